use crate::backup::BackupError;
use crate::config::ConfigError;
use crate::deploy::DeployError;
use crate::lock::LockError;
use crate::restore::RestoreError;
use crate::runtime::RuntimeError;
use crate::schedule::ScheduleError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Operator-facing error classes. Every module error maps onto one of these
/// and the class decides the process exit code.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// Datastore or remote archive unreachable
    Connectivity,
    /// Corrupt or unverifiable snapshot
    Integrity,
    /// Malformed input, detected before any side effect
    Configuration,
    /// Operation impossible in the current state, e.g. no snapshot to roll back to
    State,
    Other,
}

impl ErrorClass {
    pub fn exit_code(self) -> u8 {
        match self {
            ErrorClass::Other => 1,
            ErrorClass::Configuration => 2,
            ErrorClass::Connectivity => 3,
            ErrorClass::Integrity => 4,
            ErrorClass::State => 5,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ErrorClass::Connectivity => "connectivity",
            ErrorClass::Integrity => "integrity",
            ErrorClass::Configuration => "configuration",
            ErrorClass::State => "state",
            ErrorClass::Other => "error",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Find the class of the first typed error in an `anyhow` chain.
pub fn classify(err: &anyhow::Error) -> ErrorClass {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<BackupError>() {
            return e.class();
        }
        if let Some(e) = cause.downcast_ref::<RestoreError>() {
            return e.class();
        }
        if let Some(e) = cause.downcast_ref::<DeployError>() {
            return e.class();
        }
        if let Some(e) = cause.downcast_ref::<ScheduleError>() {
            return e.class();
        }
        if let Some(e) = cause.downcast_ref::<ConfigError>() {
            return e.class();
        }
        if let Some(e) = cause.downcast_ref::<LockError>() {
            return e.class();
        }
        if let Some(e) = cause.downcast_ref::<RuntimeError>() {
            return e.class();
        }
    }
    ErrorClass::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let classes = [
            ErrorClass::Connectivity,
            ErrorClass::Integrity,
            ErrorClass::Configuration,
            ErrorClass::State,
            ErrorClass::Other,
        ];
        let mut codes: Vec<u8> = classes.iter().map(|c| c.exit_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), classes.len());
        assert!(!codes.contains(&0));
    }

    #[test]
    fn test_classify_walks_context_chain() {
        let err = anyhow::Error::new(ScheduleError::InvalidTime {
            value: "25:00".to_string(),
            reason: "hour must be between 0 and 23".to_string(),
        })
        .context("installing backup schedule");
        assert_eq!(classify(&err), ErrorClass::Configuration);

        let plain = anyhow::anyhow!("something else");
        assert_eq!(classify(&plain), ErrorClass::Other);
    }
}
