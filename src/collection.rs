use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::domain::{Record, RecordType};
use crate::error::SyncError;

/// Where a collection keeps its records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    Memory,
    /// JSON lines in a temporary file, read back one chunk at a time.
    Spool,
}

enum Storage {
    Memory(Vec<Record>),
    Spool(NamedTempFile),
}

/// A set of search records with a cached count and total size.
pub struct RecordCollection {
    storage: Storage,
    count: usize,
    size: u64,
}

impl std::fmt::Debug for RecordCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCollection")
            .field("mode", &self.mode())
            .field("count", &self.count)
            .field("size", &self.size)
            .finish()
    }
}

impl RecordCollection {
    pub fn new(mode: StorageMode) -> Result<Self, SyncError> {
        let storage = match mode {
            StorageMode::Memory => Storage::Memory(Vec::new()),
            StorageMode::Spool => Storage::Spool(
                tempfile::Builder::new()
                    .prefix("climsync-records")
                    .tempfile()
                    .map_err(|err| SyncError::Filesystem(err.to_string()))?,
            ),
        };
        Ok(Self {
            storage,
            count: 0,
            size: 0,
        })
    }

    pub fn in_memory(records: Vec<Record>) -> Self {
        let size = total_size(&records);
        Self {
            count: records.len(),
            size,
            storage: Storage::Memory(records),
        }
    }

    pub fn from_records(mode: StorageMode, records: Vec<Record>) -> Result<Self, SyncError> {
        if mode == StorageMode::Memory {
            return Ok(Self::in_memory(records));
        }
        let mut collection = Self::new(mode)?;
        collection.append(records)?;
        Ok(collection)
    }

    /// An empty collection using the same storage mode.
    pub fn empty_like(&self) -> Result<Self, SyncError> {
        Self::new(self.mode())
    }

    pub fn mode(&self) -> StorageMode {
        match self.storage {
            Storage::Memory(_) => StorageMode::Memory,
            Storage::Spool(_) => StorageMode::Spool,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn append(&mut self, records: Vec<Record>) -> Result<(), SyncError> {
        if records.is_empty() {
            return Ok(());
        }
        let added_size = total_size(&records);
        let added_count = records.len();
        match &mut self.storage {
            Storage::Memory(items) => items.extend(records),
            Storage::Spool(file) => {
                let mut writer = BufWriter::new(file.as_file_mut());
                for record in &records {
                    serde_json::to_writer(&mut writer, record)
                        .map_err(|err| SyncError::Store(err.to_string()))?;
                    writer
                        .write_all(b"\n")
                        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
                }
                writer
                    .flush()
                    .map_err(|err| SyncError::Filesystem(err.to_string()))?;
            }
        }
        self.count += added_count;
        self.size += added_size;
        Ok(())
    }

    pub fn merge(&mut self, other: RecordCollection, chunk_size: usize) -> Result<(), SyncError> {
        for chunk in other.chunks(chunk_size)? {
            self.append(chunk?)?;
        }
        Ok(())
    }

    /// Keeps the records matching `keep`, in a new collection of the same mode.
    pub fn filter<F>(&self, chunk_size: usize, mut keep: F) -> Result<RecordCollection, SyncError>
    where
        F: FnMut(&Record) -> bool,
    {
        let mut output = self.empty_like()?;
        for chunk in self.chunks(chunk_size)? {
            let kept = chunk?.into_iter().filter(|record| keep(record)).collect();
            output.append(kept)?;
        }
        Ok(output)
    }

    pub fn chunks(&self, chunk_size: usize) -> Result<Chunks<'_>, SyncError> {
        let chunk_size = chunk_size.max(1);
        let source = match &self.storage {
            Storage::Memory(items) => ChunkSource::Memory(items.chunks(chunk_size)),
            Storage::Spool(file) => {
                let reader = file
                    .reopen()
                    .map_err(|err| SyncError::Filesystem(err.to_string()))?;
                ChunkSource::Spool(BufReader::new(reader).lines())
            }
        };
        Ok(Chunks { source, chunk_size })
    }

    /// Loads every record in memory.
    pub fn records(&self) -> Result<Vec<Record>, SyncError> {
        if let Storage::Memory(items) = &self.storage {
            return Ok(items.clone());
        }
        let mut records = Vec::with_capacity(self.count);
        for chunk in self.chunks(4096)? {
            records.extend(chunk?);
        }
        Ok(records)
    }

    pub fn first(&self) -> Result<Option<Record>, SyncError> {
        match self.chunks(1)?.next() {
            Some(chunk) => Ok(chunk?.into_iter().next()),
            None => Ok(None),
        }
    }

    /// All records of a collection share the same type.
    pub fn record_type(&self) -> Result<Option<RecordType>, SyncError> {
        Ok(self.first()?.map(|record| record.record_type()))
    }
}

pub fn total_size(records: &[Record]) -> u64 {
    records.iter().filter_map(Record::size).sum()
}

enum ChunkSource<'a> {
    Memory(std::slice::Chunks<'a, Record>),
    Spool(Lines<BufReader<File>>),
}

/// Lazy cursor over a collection, yielding at most `chunk_size` records at a time.
pub struct Chunks<'a> {
    source: ChunkSource<'a>,
    chunk_size: usize,
}

impl Iterator for Chunks<'_> {
    type Item = Result<Vec<Record>, SyncError>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.source {
            ChunkSource::Memory(chunks) => chunks.next().map(|chunk| Ok(chunk.to_vec())),
            ChunkSource::Spool(lines) => {
                let mut chunk = Vec::with_capacity(self.chunk_size);
                while chunk.len() < self.chunk_size {
                    let Some(line) = lines.next() else {
                        break;
                    };
                    let parsed = line
                        .map_err(|err| SyncError::Filesystem(err.to_string()))
                        .and_then(|line| {
                            serde_json::from_str::<Record>(&line)
                                .map_err(|err| SyncError::Store(err.to_string()))
                        });
                    match parsed {
                        Ok(record) => chunk.push(record),
                        Err(err) => return Some(Err(err)),
                    }
                }
                (!chunk.is_empty()).then_some(Ok(chunk))
            }
        }
    }
}
