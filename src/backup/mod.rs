pub mod backup_manager;
pub mod backup_verification;
pub mod compression;
pub mod repository;
pub mod retention;

pub use backup_manager::*;
pub use backup_verification::*;
pub use repository::*;
pub use retention::*;

use crate::error::ErrorClass;
use crate::runtime::RuntimeError;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum DatastoreKind {
    /// PostgreSQL, dumped with pg_dump
    Relational,
    /// SQLite file copied online
    #[serde(rename = "embedded-file")]
    Embedded,
}

impl fmt::Display for DatastoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatastoreKind::Relational => f.write_str("relational"),
            DatastoreKind::Embedded => f.write_str("embedded-file"),
        }
    }
}

impl FromStr for DatastoreKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relational" | "postgres" | "postgresql" => Ok(DatastoreKind::Relational),
            "embedded" | "embedded-file" | "sqlite" => Ok(DatastoreKind::Embedded),
            other => Err(format!(
                "unsupported datastore kind {other:?}, expected relational or embedded"
            )),
        }
    }
}

/// Timestamp-derived snapshot identifier, `YYYYMMDD_HHMMSS_mmm` in UTC.
/// Ordering follows creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotId(DateTime<Utc>);

impl SnapshotId {
    pub const LEN: usize = 19;

    pub fn from_time(time: DateTime<Utc>) -> Self {
        let millis = time.timestamp_millis();
        Self(Utc.timestamp_millis_opt(millis).single().unwrap_or(time))
    }

    /// Identifier for a snapshot taken at `now`, bumped past `latest` when the
    /// clock has not moved on (or moved backwards).
    pub fn next(now: DateTime<Utc>, latest: Option<&SnapshotId>) -> Self {
        let candidate = Self::from_time(now);
        match latest {
            Some(latest) if candidate <= *latest => {
                Self::from_time(latest.0 + chrono::Duration::milliseconds(1))
            }
            _ => candidate,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.0
    }

    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != Self::LEN || !s.is_ascii() {
            return None;
        }
        let (stamp, millis) = (&s[..15], &s[15..]);
        let millis = millis.strip_prefix('_')?;
        if !millis.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let millis: i64 = millis.parse().ok()?;
        let naive = NaiveDateTime::parse_from_str(stamp, "%Y%m%d_%H%M%S").ok()?;
        Some(Self(
            Utc.from_utc_datetime(&naive) + chrono::Duration::milliseconds(millis),
        ))
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y%m%d_%H%M%S_%3f"))
    }
}

impl FromStr for SnapshotId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("{s:?} is not a snapshot identifier"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// pg_dump custom format
    NativeDump,
    /// zstd-compressed plain SQL
    PortableDump,
    /// zstd-compressed SQLite file
    EmbeddedCopy,
    /// gzip tarball of uploaded assets
    Uploads,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 4] = [
        ArtifactKind::NativeDump,
        ArtifactKind::PortableDump,
        ArtifactKind::EmbeddedCopy,
        ArtifactKind::Uploads,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            ArtifactKind::NativeDump => "dump",
            ArtifactKind::PortableDump => "sql.zst",
            ArtifactKind::EmbeddedCopy => "sqlite.zst",
            ArtifactKind::Uploads => "uploads.tar.gz",
        }
    }

    pub fn from_suffix(suffix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.suffix() == suffix)
    }

    pub fn file_name(self, id: &SnapshotId) -> String {
        format!("{id}.{}", self.suffix())
    }
}

/// Split `<id>.<suffix>` into its parts; anything else is not a snapshot file.
pub fn parse_artifact_name(name: &str) -> Option<(SnapshotId, ArtifactKind)> {
    let (id, suffix) = name.split_once('.')?;
    Some((SnapshotId::parse(id)?, ArtifactKind::from_suffix(suffix)?))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotArtifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// One backup. Never modified once written; only copied or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub kind: DatastoreKind,
    pub directory: PathBuf,
    pub artifacts: Vec<SnapshotArtifact>,
    pub remote_keys: Vec<String>,
    pub verified: bool,
}

impl Snapshot {
    pub fn new(id: SnapshotId, kind: DatastoreKind, directory: PathBuf) -> Self {
        Self {
            id,
            kind,
            directory,
            artifacts: Vec::new(),
            remote_keys: Vec::new(),
            verified: false,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.id.created_at()
    }

    pub fn size_bytes(&self) -> u64 {
        self.artifacts.iter().map(|a| a.size_bytes).sum()
    }

    pub fn artifact(&self, kind: ArtifactKind) -> Option<&SnapshotArtifact> {
        self.artifacts.iter().find(|a| a.kind == kind)
    }

    pub fn path_for(&self, kind: ArtifactKind) -> PathBuf {
        self.directory.join(kind.file_name(&self.id))
    }

    /// Infer the datastore kind from which artifacts are present.
    fn infer_kind(artifacts: &[SnapshotArtifact]) -> DatastoreKind {
        if artifacts.iter().any(|a| a.kind == ArtifactKind::EmbeddedCopy) {
            DatastoreKind::Embedded
        } else {
            DatastoreKind::Relational
        }
    }
}

/// Snapshot lifetime configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub retention_days: u32,
    pub remote_mirror: bool,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retention_days: 30,
            remote_mirror: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSettings {
    /// Directory where snapshots are stored
    pub backup_root: PathBuf,

    /// Uploaded assets archived with each snapshot
    pub uploads_dir: Option<PathBuf>,

    pub retention: RetentionPolicy,

    /// Key prefix in the remote archive
    pub remote_prefix: String,
}

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("Datastore unreachable: {message}")]
    ConnectionRefused { message: String },

    #[error("Cannot write snapshot to {path}: {message}")]
    InsufficientSpace { path: PathBuf, message: String },

    #[error("Snapshot {snapshot} failed verification: {message}")]
    Corrupt { snapshot: String, message: String },

    #[error("Dump failed: {message}")]
    DumpFailed { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackupError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BackupError::ConnectionRefused { .. } => ErrorClass::Connectivity,
            BackupError::InsufficientSpace { .. } => ErrorClass::Configuration,
            BackupError::Corrupt { .. } => ErrorClass::Integrity,
            BackupError::DumpFailed { .. } | BackupError::Io(_) => ErrorClass::Other,
        }
    }
}

impl From<RuntimeError> for BackupError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unreachable { target, message } => BackupError::ConnectionRefused {
                message: format!("{target}: {message}"),
            },
            RuntimeError::Io(e) => BackupError::Io(e),
            other => BackupError::DumpFailed {
                message: other.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_id_round_trips_through_display() {
        let time = Utc.with_ymd_and_hms(2024, 5, 1, 2, 0, 0).unwrap()
            + chrono::Duration::milliseconds(42);
        let id = SnapshotId::from_time(time);
        assert_eq!(id.to_string(), "20240501_020000_042");
        assert_eq!(SnapshotId::parse("20240501_020000_042"), Some(id));
    }

    #[test]
    fn test_snapshot_id_rejects_garbage() {
        assert!(SnapshotId::parse("20240501_020000").is_none());
        assert!(SnapshotId::parse("20241301_020000_000").is_none());
        assert!(SnapshotId::parse("20240501-020000-000").is_none());
        assert!(SnapshotId::parse("abcdefgh_ijklmn_opq").is_none());
    }

    #[test]
    fn test_next_is_strictly_increasing() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 2, 0, 0).unwrap();
        let first = SnapshotId::next(now, None);
        let second = SnapshotId::next(now, Some(&first));
        let third = SnapshotId::next(now - chrono::Duration::hours(1), Some(&second));
        assert!(first < second);
        assert!(second < third);
    }

    #[test]
    fn test_parse_artifact_name() {
        let (id, kind) = parse_artifact_name("20240501_020000_000.sql.zst").unwrap();
        assert_eq!(kind, ArtifactKind::PortableDump);
        assert_eq!(id.to_string(), "20240501_020000_000");

        assert_eq!(
            parse_artifact_name("20240501_020000_000.uploads.tar.gz").map(|(_, k)| k),
            Some(ArtifactKind::Uploads)
        );
        assert!(parse_artifact_name("20240501_020000_000.sql").is_none());
        assert!(parse_artifact_name(".printhub-ops.lock").is_none());
    }

    #[test]
    fn test_datastore_kind_parsing() {
        assert_eq!("embedded".parse::<DatastoreKind>(), Ok(DatastoreKind::Embedded));
        assert_eq!(
            "Relational".parse::<DatastoreKind>(),
            Ok(DatastoreKind::Relational)
        );
        assert!("mongo".parse::<DatastoreKind>().is_err());
        assert_eq!(DatastoreKind::Embedded.to_string(), "embedded-file");
    }

    #[test]
    fn test_runtime_errors_map_to_backup_errors() {
        let err: BackupError = RuntimeError::Unreachable {
            target: "postgres".to_string(),
            message: "refused".to_string(),
        }
        .into();
        assert!(matches!(err, BackupError::ConnectionRefused { .. }));
        assert_eq!(err.class(), ErrorClass::Connectivity);
    }
}
