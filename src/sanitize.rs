//! Rejection rules applied right after search results are parsed.

use tracing::{info, warn};

use crate::domain::Record;

/// Splits a chunk into kept and rejected records.
///
/// A file must carry exactly one `variable` value. Datasets have no reject
/// rule and are always kept.
pub fn partition(records: Vec<Record>) -> (Vec<Record>, Vec<Record>) {
    records.into_iter().partition(|record| match record {
        Record::File(file) => file.variable.len() == 1,
        Record::Dataset(_) => true,
    })
}

pub fn remove_anomalies(records: Vec<Record>, log_inconsistency: bool) -> Vec<Record> {
    let (keep, reject) = partition(records);
    if !reject.is_empty() {
        info!(anomalies = reject.len(), "anomalies found");
        if log_inconsistency {
            for record in &reject {
                warn!(
                    id = %record.functional_id(),
                    "'variable' attribute does not hold exactly one value"
                );
            }
        }
    }
    keep
}
