use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;

use climsync::collection::{RecordCollection, StorageMode};
use climsync::domain::{DataNode, DatasetRecord, FileRecord, NearestMode, Record};
use climsync::error::SyncError;
use climsync::nearest::{DistanceCache, NearestSelector, ScoreTable, UNREACHABLE_PENALTY};
use climsync::probe::{Coordinates, NetworkProbe, PingStats, RttOutcome};

#[derive(Default)]
struct MockProbe {
    rtt: HashMap<String, f64>,
    places: HashMap<String, Coordinates>,
    pings: Mutex<Vec<String>>,
}

impl MockProbe {
    fn with_rtt(pairs: &[(&str, f64)]) -> Self {
        Self {
            rtt: pairs.iter().map(|(h, v)| (h.to_string(), *v)).collect(),
            ..Self::default()
        }
    }

    fn ping_count(&self, host: &str) -> usize {
        self.pings
            .lock()
            .unwrap()
            .iter()
            .filter(|pinged| pinged.as_str() == host)
            .count()
    }
}

impl NetworkProbe for MockProbe {
    fn ping(&self, host: &DataNode) -> Result<RttOutcome, SyncError> {
        self.pings.lock().unwrap().push(host.to_string());
        Ok(match self.rtt.get(host.as_str()) {
            Some(avg) => RttOutcome::Measured(PingStats {
                min: *avg,
                avg: *avg,
                max: *avg,
                mdev: 0.0,
            }),
            None => RttOutcome::Unreachable,
        })
    }

    fn geolocate(&self, host: &DataNode) -> Result<Coordinates, SyncError> {
        self.places
            .get(host.as_str())
            .copied()
            .ok_or_else(|| SyncError::ProbeHttp(format!("no location for {host}")))
    }

    fn local_coordinates(&self) -> Result<Coordinates, SyncError> {
        self.places
            .get("local")
            .copied()
            .ok_or_else(|| SyncError::ProbeHttp("no local location".to_string()))
    }
}

fn file(id: &str, node: &str) -> Record {
    Record::File(FileRecord {
        functional_id: id.parse().unwrap(),
        data_node: node.parse().unwrap(),
        size: Some(10),
        variable: vec!["tas".to_string()],
        url: Some(format!("http://{node}/{id}")),
        local_path: None,
        dataset_functional_id: None,
        checksum: None,
        checksum_type: None,
        timestamp: None,
    })
}

fn pairs(collection: &RecordCollection) -> Vec<(String, String)> {
    collection
        .records()
        .unwrap()
        .iter()
        .map(|r| (r.functional_id().to_string(), r.data_node().to_string()))
        .collect()
}

#[test]
fn duplicates_and_farther_replicas_collapse_to_one_record() {
    let probe = MockProbe::with_rtt(&[("node.a", 10.0), ("node.b", 80.0)]);
    let cache = DistanceCache::new();
    let selector = NearestSelector::new(NearestMode::Rtt, &probe, &cache, 4, 2);
    let input = RecordCollection::in_memory(vec![
        file("f1", "node.a"),
        file("f1", "node.a"),
        file("f1", "node.b"),
    ]);

    let output = selector.select(input).unwrap();

    assert_eq!(pairs(&output), vec![("f1".to_string(), "node.a".to_string())]);
}

#[test]
fn unique_records_pass_through_without_probing() {
    let probe = MockProbe::default();
    let cache = DistanceCache::new();
    let selector = NearestSelector::new(NearestMode::Rtt, &probe, &cache, 4, 100);
    let input = RecordCollection::in_memory(vec![
        file("f1", "node.a"),
        file("f2", "node.b"),
        file("f3", "node.c"),
    ]);

    let output = selector.select(input).unwrap();

    assert_eq!(output.count(), 3);
    assert!(probe.pings.lock().unwrap().is_empty());
}

#[test]
fn unreachable_host_gets_penalty_and_loses() {
    let probe = MockProbe::with_rtt(&[("node.b", 300.0)]);
    let cache = DistanceCache::new();
    let selector = NearestSelector::new(NearestMode::Rtt, &probe, &cache, 2, 100);

    let silent: DataNode = "node.a".parse().unwrap();
    assert_eq!(selector.distance(&silent).unwrap(), UNREACHABLE_PENALTY);

    let input = RecordCollection::in_memory(vec![file("f1", "node.a"), file("f1", "node.b")]);
    let output = selector.select(input).unwrap();
    assert_eq!(pairs(&output), vec![("f1".to_string(), "node.b".to_string())]);
}

#[test]
fn host_is_probed_once_per_run() {
    let probe = MockProbe::with_rtt(&[("node.a", 10.0), ("node.b", 20.0)]);
    let cache = DistanceCache::new();
    let selector = NearestSelector::new(NearestMode::Rtt, &probe, &cache, 8, 3);
    let records = (0..50)
        .flat_map(|i| {
            let id = format!("f{i}");
            [file(&id, "node.b"), file(&id, "node.a")]
        })
        .collect();
    let input = RecordCollection::from_records(StorageMode::Spool, records).unwrap();

    let output = selector.select(input).unwrap();

    assert_eq!(output.count(), 50);
    assert!(pairs(&output).iter().all(|(_, node)| node == "node.a"));
    assert_eq!(probe.ping_count("node.a"), 1);
    assert_eq!(probe.ping_count("node.b"), 1);
    assert_eq!(cache.len(), 2);
}

#[test]
fn ties_keep_first_seen_node() {
    let probe = MockProbe::with_rtt(&[("node.a", 50.0), ("node.b", 50.0)]);
    let cache = DistanceCache::new();
    let selector = NearestSelector::new(NearestMode::Rtt, &probe, &cache, 2, 10);
    let input = RecordCollection::in_memory(vec![file("f1", "node.b"), file("f1", "node.a")]);

    let output = selector.select(input).unwrap();

    assert_eq!(pairs(&output), vec![("f1".to_string(), "node.b".to_string())]);
}

#[test]
fn geolocation_mode_picks_closest_host() {
    let mut probe = MockProbe::default();
    let place = |latitude, longitude| Coordinates {
        latitude,
        longitude,
    };
    probe.places.insert("local".to_string(), place(48.85, 2.35));
    probe.places.insert("esgf.ipsl.fr".to_string(), place(48.71, 2.21));
    probe.places.insert("esgf.llnl.gov".to_string(), place(37.68, -121.7));
    let cache = DistanceCache::new();
    let selector = NearestSelector::new(NearestMode::Geolocation, &probe, &cache, 2, 10);
    let input = RecordCollection::in_memory(vec![
        file("f1", "esgf.llnl.gov"),
        file("f1", "esgf.ipsl.fr"),
    ]);

    let output = selector.select(input).unwrap();

    assert_eq!(
        pairs(&output),
        vec![("f1".to_string(), "esgf.ipsl.fr".to_string())]
    );
}

fn located_hosts() -> MockProbe {
    let mut probe = MockProbe::default();
    probe.places.insert(
        "local".to_string(),
        Coordinates {
            latitude: 48.85,
            longitude: 2.35,
        },
    );
    probe.places.insert(
        "node.b".to_string(),
        Coordinates {
            latitude: 37.68,
            longitude: -121.7,
        },
    );
    probe
}

#[test]
fn unlocatable_host_gets_penalty_in_geolocation_mode() {
    let probe = located_hosts();
    let cache = DistanceCache::new();
    let selector = NearestSelector::new(NearestMode::Geolocation, &probe, &cache, 2, 10);

    let silent: DataNode = "node.a".parse().unwrap();
    assert_eq!(selector.distance(&silent).unwrap(), UNREACHABLE_PENALTY);

    let input = RecordCollection::in_memory(vec![file("f1", "node.a"), file("f1", "node.b")]);
    let output = selector.select(input).unwrap();
    assert_eq!(pairs(&output), vec![("f1".to_string(), "node.b".to_string())]);
}

#[test]
fn local_geolocation_failure_aborts_selection() {
    let probe = MockProbe::default();
    let cache = DistanceCache::new();
    let selector = NearestSelector::new(NearestMode::Geolocation, &probe, &cache, 2, 10);
    let input = RecordCollection::in_memory(vec![file("f1", "node.a"), file("f1", "node.b")]);

    assert_matches!(selector.select(input), Err(SyncError::ProbeHttp(_)));
}

struct MalformedGeolocation;

impl NetworkProbe for MalformedGeolocation {
    fn ping(&self, _host: &DataNode) -> Result<RttOutcome, SyncError> {
        Ok(RttOutcome::Unreachable)
    }

    fn geolocate(&self, _host: &DataNode) -> Result<Coordinates, SyncError> {
        Err(SyncError::ProbeResponse("missing field `lat`".to_string()))
    }

    fn local_coordinates(&self) -> Result<Coordinates, SyncError> {
        Ok(Coordinates {
            latitude: 0.0,
            longitude: 0.0,
        })
    }
}

#[test]
fn malformed_geolocation_response_keeps_its_variant() {
    let cache = DistanceCache::new();
    let selector = NearestSelector::new(NearestMode::Geolocation, &MalformedGeolocation, &cache, 2, 10);
    let input = RecordCollection::in_memory(vec![file("f1", "node.a"), file("f1", "node.b")]);

    assert_matches!(selector.select(input), Err(SyncError::ProbeResponse(_)));
}

#[test]
fn concurrent_lookups_of_one_host_compute_once() {
    let cache = DistanceCache::new();
    let calls = AtomicUsize::new(0);
    let host: DataNode = "node.a".parse().unwrap();

    thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                let value = cache
                    .get_or_compute(NearestMode::Rtt, &host, || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(50));
                        Ok(42.0)
                    })
                    .unwrap();
                assert_eq!(value, 42.0);
            });
        }
    });

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.len(), 1);
}

#[test]
fn dataset_collections_pass_through() {
    let probe = MockProbe::default();
    let cache = DistanceCache::new();
    let selector = NearestSelector::new(NearestMode::Rtt, &probe, &cache, 2, 10);
    let dataset = |node: &str| {
        Record::Dataset(DatasetRecord {
            functional_id: "cmip5.output1.IPSL.v20120101".parse().unwrap(),
            data_node: node.parse().unwrap(),
            master_id: None,
            version: Some("v20120101".to_string()),
            timestamp: None,
            latest: None,
            size: None,
            local_path: None,
        })
    };
    let input = RecordCollection::in_memory(vec![dataset("node.a"), dataset("node.b")]);

    let output = selector.select(input).unwrap();

    assert_eq!(output.count(), 2);
}

#[test]
fn score_table_lists_only_contested_hosts() {
    let input = RecordCollection::in_memory(vec![
        file("f1", "node.a"),
        file("f1", "node.b"),
        file("f2", "node.c"),
        file("f2", "node.c"),
    ]);
    let table = ScoreTable::build(&input, 2).unwrap();

    let mut hosts = table
        .contested_hosts()
        .into_iter()
        .map(|h| h.to_string())
        .collect::<Vec<_>>();
    hosts.sort();
    assert_eq!(hosts, vec!["node.a", "node.b"]);
    assert_eq!(table.candidates(&"f2".parse().unwrap()).unwrap().len(), 1);
}
