use super::{parse_artifact_name, SnapshotId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Snapshots eligible for deletion: created strictly before
/// `now - retention_days`, never including the most recent snapshot.
pub fn select_expired(
    ids: &[SnapshotId],
    now: DateTime<Utc>,
    retention_days: u32,
) -> Vec<SnapshotId> {
    let Some(latest) = ids.iter().max().copied() else {
        return Vec::new();
    };
    let cutoff = now - chrono::Duration::days(i64::from(retention_days));

    let mut expired: Vec<SnapshotId> = ids
        .iter()
        .copied()
        .filter(|id| *id != latest && id.created_at() < cutoff)
        .collect();
    expired.sort();
    expired.dedup();
    expired
}

/// Group remote archive keys by the snapshot they belong to. Keys that do
/// not name a snapshot artifact are left out.
pub fn group_remote_keys(keys: &[String]) -> BTreeMap<SnapshotId, Vec<String>> {
    let mut grouped: BTreeMap<SnapshotId, Vec<String>> = BTreeMap::new();
    for key in keys {
        let name = key.rsplit('/').next().unwrap_or(key);
        if let Some((id, _)) = parse_artifact_name(name) {
            grouped.entry(id).or_default().push(key.clone());
        }
    }
    grouped
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionReport {
    pub local_deleted: Vec<SnapshotId>,
    pub remote_deleted: Vec<String>,
    pub failures: Vec<String>,
}
