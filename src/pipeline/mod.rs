//! Post-search processing pipelines.
//!
//! A [`Pipeline`] declares an ordered chain of states; an [`Engine`] binds a
//! [`Transform`] to each state and drives a [`RecordCollection`] through it.
//!
//! [`RecordCollection`]: crate::collection::RecordCollection

mod engine;
mod machine;

pub use engine::{ChunkFn, Engine, PipelineRun, Transform, WholeFn, process_chunks};
pub use machine::{Pipeline, State, Transition};

pub const SANITIZE_STATE: &str = "S0100";
pub const NEAREST_STATE: &str = "S0200";
pub const LATEST_STATE: &str = "S0300";
pub const DONE_STATE: &str = "S0400";

/// The post-search file pipeline: anomaly filter, nearest replica, latest version.
pub fn post_search_pipeline() -> Result<Pipeline, crate::error::SyncError> {
    Pipeline::new(
        "post-search",
        vec![
            State::initial(
                SANITIZE_STATE,
                Some(Transition::new("remove_anomalies", NEAREST_STATE)),
            ),
            State::new(
                NEAREST_STATE,
                Some(Transition::new("keep_nearest_replica", LATEST_STATE)),
            ),
            State::new(
                LATEST_STATE,
                Some(Transition::new("keep_latest_version", DONE_STATE)),
            ),
            State::new(DONE_STATE, None),
        ],
    )
}
