use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::collection::RecordCollection;
use crate::domain::Record;
use crate::error::SyncError;
use crate::pipeline::machine::Pipeline;

pub type WholeFn<'a> = Box<dyn FnMut(RecordCollection) -> Result<RecordCollection, SyncError> + 'a>;
pub type ChunkFn<'a> = Box<dyn FnMut(Vec<Record>) -> Result<Vec<Record>, SyncError> + 'a>;

/// Work attached to a pipeline state.
pub enum Transform<'a> {
    /// Receives the whole collection and returns its replacement.
    Whole(WholeFn<'a>),
    /// Receives one chunk at a time, in cursor order, and returns the records to keep.
    Chunked(ChunkFn<'a>),
}

impl<'a> Transform<'a> {
    pub fn whole<F>(f: F) -> Self
    where
        F: FnMut(RecordCollection) -> Result<RecordCollection, SyncError> + 'a,
    {
        Transform::Whole(Box::new(f))
    }

    pub fn chunked<F>(f: F) -> Self
    where
        F: FnMut(Vec<Record>) -> Result<Vec<Record>, SyncError> + 'a,
    {
        Transform::Chunked(Box::new(f))
    }
}

#[derive(Debug)]
pub struct PipelineRun {
    pub output: RecordCollection,
    pub visited: Vec<String>,
}

pub struct Engine<'a> {
    chunk_size: usize,
    transforms: HashMap<String, Transform<'a>>,
}

impl<'a> Engine<'a> {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            transforms: HashMap::new(),
        }
    }

    pub fn register(mut self, state: impl Into<String>, transform: Transform<'a>) -> Self {
        self.transforms.insert(state.into(), transform);
        self
    }

    /// Drives `pipeline` from its initial state until a terminal state.
    ///
    /// States without a registered transform pass the collection through. Any
    /// transform error aborts the run and nothing is returned.
    pub fn run(
        &mut self,
        pipeline: &Pipeline,
        input: RecordCollection,
    ) -> Result<PipelineRun, SyncError> {
        let mut collection = input;
        let mut visited = Vec::new();
        let mut seen = HashSet::new();
        let mut state = pipeline.initial_state()?;

        loop {
            if !seen.insert(state.name.clone()) {
                return Err(SyncError::Configuration(format!(
                    "pipeline {} re-entered state {}",
                    pipeline.name(),
                    state.name
                )));
            }

            let before = collection.count();
            collection = match self.transforms.get_mut(&state.name) {
                Some(Transform::Whole(f)) => f(collection)?,
                Some(Transform::Chunked(f)) => process_chunks(&collection, self.chunk_size, f)?,
                None => {
                    debug!(pipeline = pipeline.name(), state = %state.name, "no transform registered");
                    collection
                }
            };
            info!(
                pipeline = pipeline.name(),
                state = %state.name,
                step = state.transition.as_ref().map(|t| t.name.as_str()).unwrap_or("end"),
                records_in = before,
                records_out = collection.count(),
                "pipeline state done"
            );
            visited.push(state.name.clone());

            match &state.transition {
                Some(transition) => state = pipeline.state(&transition.destination)?,
                None => break,
            }
        }

        Ok(PipelineRun {
            output: collection,
            visited,
        })
    }
}

/// Applies `f` to each chunk of `input` in cursor order and concatenates the results.
pub fn process_chunks<F>(
    input: &RecordCollection,
    chunk_size: usize,
    mut f: F,
) -> Result<RecordCollection, SyncError>
where
    F: FnMut(Vec<Record>) -> Result<Vec<Record>, SyncError>,
{
    let mut output = input.empty_like()?;
    for chunk in input.chunks(chunk_size)? {
        output.append(f(chunk?)?)?;
    }
    Ok(output)
}
