//! Nearest-replica selection.
//!
//! Files hosted on several data nodes are reduced to one node per functional
//! id, chosen with the configured [`NearestMode`]. Exact repeats of an
//! (id, node) pair are dropped at the same time, so a duplicate never survives
//! while the chosen replica is kept exactly once.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

use tracing::{debug, info};

use crate::collection::RecordCollection;
use crate::domain::{DataNode, FunctionalId, NearestMode, Record, RecordType};
use crate::error::SyncError;
use crate::pipeline::process_chunks;
use crate::probe::{Coordinates, NetworkProbe, RttOutcome};

/// Score given to a host that does not answer, so it loses every comparison.
pub const UNREACHABLE_PENALTY: f64 = 20000.0;

type CacheCell<T> = Arc<OnceLock<Result<T, SyncError>>>;

/// Per-run memo of host distances.
///
/// Concurrent lookups of the same uncached host run a single probe; the other
/// callers block until it finishes and reuse the value.
#[derive(Default)]
pub struct DistanceCache {
    hosts: Mutex<HashMap<(NearestMode, DataNode), CacheCell<f64>>>,
    local: OnceLock<Result<Coordinates, SyncError>>,
}

impl DistanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.hosts.lock().map(|hosts| hosts.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_or_compute<F>(
        &self,
        mode: NearestMode,
        host: &DataNode,
        compute: F,
    ) -> Result<f64, SyncError>
    where
        F: FnOnce() -> Result<f64, SyncError>,
    {
        let cell = {
            let mut hosts = self
                .hosts
                .lock()
                .map_err(|_| SyncError::Fatal("distance cache lock poisoned".to_string()))?;
            hosts.entry((mode, host.clone())).or_default().clone()
        };
        cell.get_or_init(compute).clone()
    }

    fn local_coordinates(&self, probe: &dyn NetworkProbe) -> Result<Coordinates, SyncError> {
        self.local.get_or_init(|| probe.local_coordinates()).clone()
    }
}

/// Candidate data nodes observed for each functional id, in observation order.
#[derive(Debug, Default)]
pub struct ScoreTable {
    candidates: HashMap<FunctionalId, Vec<DataNode>>,
}

impl ScoreTable {
    /// Reads only ids and nodes; exact (id, node) repeats collapse to one candidate.
    pub fn build(collection: &RecordCollection, chunk_size: usize) -> Result<Self, SyncError> {
        let mut table = Self::default();
        for chunk in collection.chunks(chunk_size)? {
            for record in chunk? {
                table.observe(record.functional_id().clone(), record.data_node().clone());
            }
        }
        Ok(table)
    }

    pub fn observe(&mut self, id: FunctionalId, node: DataNode) {
        let nodes = self.candidates.entry(id).or_default();
        if !nodes.contains(&node) {
            nodes.push(node);
        }
    }

    pub fn candidates(&self, id: &FunctionalId) -> Option<&[DataNode]> {
        self.candidates.get(id).map(Vec::as_slice)
    }

    /// Hosts that take part in at least one comparison.
    pub fn contested_hosts(&self) -> Vec<DataNode> {
        let mut seen = HashSet::new();
        self.candidates
            .values()
            .filter(|nodes| nodes.len() > 1)
            .flatten()
            .filter(|node| seen.insert((*node).clone()))
            .cloned()
            .collect()
    }

    pub fn reduce<F>(self, mut pick: F) -> Result<NearestTable, SyncError>
    where
        F: FnMut(&[DataNode]) -> Result<DataNode, SyncError>,
    {
        let mut chosen = HashMap::with_capacity(self.candidates.len());
        for (id, nodes) in self.candidates {
            let node = if nodes.len() == 1 {
                nodes.into_iter().next()
            } else {
                Some(pick(&nodes)?)
            };
            if let Some(node) = node {
                chosen.insert(id, node);
            }
        }
        Ok(NearestTable {
            chosen,
            kept: HashSet::new(),
        })
    }
}

/// One data node per functional id, plus the pairs already admitted.
#[derive(Debug, Default)]
pub struct NearestTable {
    chosen: HashMap<FunctionalId, DataNode>,
    kept: HashSet<(FunctionalId, DataNode)>,
}

impl NearestTable {
    pub fn chosen(&self, id: &FunctionalId) -> Option<&DataNode> {
        self.chosen.get(id)
    }

    /// True the first time a record hosted on its id's chosen node is seen.
    pub fn keep(&mut self, record: &Record) -> bool {
        let id = record.functional_id();
        let node = record.data_node();
        if self.chosen.get(id) != Some(node) {
            return false;
        }
        self.kept.insert((id.clone(), node.clone()))
    }
}

pub struct NearestSelector<'a> {
    mode: NearestMode,
    probe: &'a dyn NetworkProbe,
    cache: &'a DistanceCache,
    max_parallel: usize,
    chunk_size: usize,
}

impl<'a> NearestSelector<'a> {
    pub fn new(
        mode: NearestMode,
        probe: &'a dyn NetworkProbe,
        cache: &'a DistanceCache,
        max_parallel: usize,
        chunk_size: usize,
    ) -> Self {
        Self {
            mode,
            probe,
            cache,
            max_parallel: max_parallel.max(1),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Distance from the client to `host` under the selector's mode.
    pub fn distance(&self, host: &DataNode) -> Result<f64, SyncError> {
        match self.mode {
            NearestMode::Rtt => self.cache.get_or_compute(self.mode, host, || {
                info!(host = %host, "computing round-trip time");
                match self.probe.ping(host)? {
                    RttOutcome::Measured(stats) => Ok(stats.avg),
                    RttOutcome::Unreachable => {
                        info!(host = %host, "no reply to ICMP request, using penalty");
                        Ok(UNREACHABLE_PENALTY)
                    }
                }
            }),
            NearestMode::Geolocation => self.cache.get_or_compute(self.mode, host, || {
                let local = self.cache.local_coordinates(self.probe)?;
                match self.probe.geolocate(host) {
                    Ok(remote) => Ok(self.probe.distance(local, remote)),
                    Err(err @ (SyncError::ProbeHttp(_) | SyncError::ProbeStatus { .. })) => {
                        info!(host = %host, error = %err, "host could not be located, using penalty");
                        Ok(UNREACHABLE_PENALTY)
                    }
                    Err(err) => Err(err),
                }
            }),
        }
    }

    /// First candidate wins ties; a later one replaces it only when strictly closer.
    pub fn nearest(&self, candidates: &[DataNode]) -> Result<DataNode, SyncError> {
        let (first, rest) = candidates
            .split_first()
            .ok_or_else(|| SyncError::Fatal("no candidate data node".to_string()))?;
        let mut nearest = first;
        let mut nearest_distance = self.distance(first)?;
        for candidate in rest {
            let distance = self.distance(candidate)?;
            if distance < nearest_distance {
                nearest = candidate;
                nearest_distance = distance;
            }
        }
        Ok(nearest.clone())
    }

    /// Probes distinct hosts concurrently, at most `max_parallel` at a time.
    pub fn prefetch(&self, hosts: &[DataNode]) -> Result<(), SyncError> {
        for batch in hosts.chunks(self.max_parallel) {
            let results = thread::scope(|scope| {
                let handles = batch
                    .iter()
                    .map(|host| scope.spawn(move || self.distance(host)))
                    .collect::<Vec<_>>();
                handles
                    .into_iter()
                    .map(|handle| {
                        handle
                            .join()
                            .unwrap_or_else(|_| Err(SyncError::Fatal("probe thread panicked".to_string())))
                    })
                    .collect::<Vec<_>>()
            });
            for result in results {
                result?;
            }
        }
        Ok(())
    }

    /// Keeps, for each file, only the copy hosted on the nearest data node.
    pub fn select(&self, collection: RecordCollection) -> Result<RecordCollection, SyncError> {
        if collection.is_empty() {
            return Ok(collection);
        }
        if collection.record_type()? != Some(RecordType::File) {
            debug!("dataset collection, nearest selection skipped");
            return Ok(collection);
        }

        let table = ScoreTable::build(&collection, self.chunk_size)?;
        let contested = table.contested_hosts();
        debug!(hosts = contested.len(), mode = %self.mode, "probing replica hosts");
        self.prefetch(&contested)?;

        let mut nearest = table.reduce(|candidates| self.nearest(candidates))?;
        let output = process_chunks(&collection, self.chunk_size, |chunk| {
            Ok(chunk
                .into_iter()
                .filter(|record| nearest.keep(record))
                .collect())
        })?;

        let removed = collection.count() - output.count();
        if removed > 0 {
            info!(removed, kept = output.count(), "replicas and duplicates removed");
        }
        Ok(output)
    }
}
