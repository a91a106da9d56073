pub mod application;
pub mod backup;
pub mod clock;
pub mod config;
pub mod deploy;
pub mod error;
pub mod lock;
pub mod monitoring;
pub mod notify;
pub mod restore;
pub mod runtime;
pub mod schedule;

pub use config::Config;
pub use error::{classify, ErrorClass};

// Re-export the operation entry points
pub use backup::{BackupManager, Snapshot, SnapshotId};
pub use deploy::{DeploymentAttempt, DeploymentOrchestrator, DeploymentState};
pub use monitoring::{HealthProbe, HealthReport, HealthStatus, HealthTarget};
pub use restore::{RestoreManager, RestoreRequest, RestoreResult};
pub use schedule::ScheduleManager;
