pub mod crontab;

pub use crontab::*;

use crate::error::ErrorClass;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Comment identifying the crontab lines this tool owns.
pub const MARKER: &str = "# printhub-ops:backup";

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Invalid time {value:?}: {reason}")]
    InvalidTime { value: String, reason: String },

    #[error("Invalid frequency {0:?}, expected hourly, daily or weekly")]
    InvalidFrequency(String),

    #[error("Crontab error: {message}")]
    Store { message: String },
}

impl ScheduleError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ScheduleError::InvalidTime { .. } | ScheduleError::InvalidFrequency(_) => {
                ErrorClass::Configuration
            }
            ScheduleError::Store { .. } => ErrorClass::Other,
        }
    }
}

pub type Result<T> = std::result::Result<T, ScheduleError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    /// Minute 0 of every hour
    Hourly,
    Daily,
    /// Sundays
    Weekly,
}

impl FromStr for Frequency {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hourly" => Ok(Frequency::Hourly),
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            other => Err(ScheduleError::InvalidFrequency(other.to_string())),
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Frequency::Hourly => "hourly",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
}

impl Default for TimeOfDay {
    fn default() -> Self {
        Self { hour: 2, minute: 0 }
    }
}

impl FromStr for TimeOfDay {
    type Err = ScheduleError;

    /// Strict `HH:MM`, hours 0-23 and minutes 0-59.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| ScheduleError::InvalidTime {
            value: s.to_string(),
            reason: reason.to_string(),
        };

        let (hour, minute) = s.trim().split_once(':').ok_or_else(|| invalid("expected HH:MM"))?;
        let field = |raw: &str, max: u8, what: &str| -> Result<u8> {
            if raw.is_empty() || raw.len() > 2 || !raw.chars().all(|c| c.is_ascii_digit()) {
                return Err(invalid(&format!("{what} must be one or two digits")));
            }
            let value: u8 = raw.parse().map_err(|_| invalid(&format!("bad {what}")))?;
            if value > max {
                return Err(invalid(&format!("{what} must be between 0 and {max}")));
            }
            Ok(value)
        };

        Ok(Self {
            hour: field(hour, 23, "hour")?,
            minute: field(minute, 59, "minute")?,
        })
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// One marked crontab line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub frequency: Frequency,
    /// `None` for hourly entries
    pub time: Option<TimeOfDay>,
    pub command: String,
}

impl ScheduleEntry {
    pub fn new(frequency: Frequency, time: TimeOfDay, command: impl Into<String>) -> Self {
        let time = match frequency {
            Frequency::Hourly => None,
            _ => Some(time),
        };
        Self {
            frequency,
            time,
            command: command.into(),
        }
    }

    pub fn cron_expression(&self) -> String {
        match (self.frequency, self.time) {
            (Frequency::Hourly, _) | (_, None) => "0 * * * *".to_string(),
            (Frequency::Daily, Some(t)) => format!("{} {} * * *", t.minute, t.hour),
            (Frequency::Weekly, Some(t)) => format!("{} {} * * 0", t.minute, t.hour),
        }
    }

    pub fn to_line(&self) -> String {
        format!("{} {} {}", self.cron_expression(), self.command, MARKER)
    }

    /// Parse a line this tool wrote; unmarked lines yield `None`.
    pub fn parse_line(line: &str) -> Option<Self> {
        let body = line.trim().strip_suffix(MARKER)?.trim_end();
        let fields: Vec<&str> = body.splitn(6, char::is_whitespace).collect();
        if fields.len() < 6 {
            return None;
        }

        let frequency = if fields[1] == "*" {
            Frequency::Hourly
        } else if fields[4] == "0" {
            Frequency::Weekly
        } else {
            Frequency::Daily
        };
        let time = match frequency {
            Frequency::Hourly => None,
            _ => Some(TimeOfDay {
                hour: fields[1].parse().ok()?,
                minute: fields[0].parse().ok()?,
            }),
        };

        Some(Self {
            frequency,
            time,
            command: fields[5].trim().to_string(),
        })
    }
}

fn is_marked(line: &str) -> bool {
    line.trim_end().ends_with(MARKER)
}

/// Installs and removes the recurring backup trigger in the host crontab.
#[derive(Debug, Clone)]
pub struct ScheduleManager {
    store: Arc<dyn CrontabStore>,
    command: String,
}

impl ScheduleManager {
    /// `command` is the shell command cron runs, e.g. `cd /srv/app && printhub-ops backup`.
    pub fn new(store: Arc<dyn CrontabStore>, command: impl Into<String>) -> Self {
        Self {
            store,
            command: command.into(),
        }
    }

    /// Replace any marked entry with a single new one. The time is
    /// validated before the crontab is read; hourly entries ignore it.
    pub async fn install(
        &self,
        frequency: Frequency,
        time_of_day: Option<&str>,
        run_as_user: Option<&str>,
    ) -> Result<ScheduleEntry> {
        let time = match time_of_day {
            Some(raw) => raw.parse::<TimeOfDay>()?,
            None => TimeOfDay::default(),
        };
        if frequency == Frequency::Hourly && time_of_day.is_some() {
            debug!("Hourly schedules run at minute 0; ignoring --time");
        }
        let entry = ScheduleEntry::new(frequency, time, self.command.clone());

        let current = self.store.read(run_as_user).await?;
        let mut lines: Vec<&str> = current.lines().filter(|l| !is_marked(l)).collect();
        let replaced = current.lines().filter(|l| is_marked(l)).count();
        let new_line = entry.to_line();
        lines.push(&new_line);

        self.store
            .write(run_as_user, &join_lines(&lines))
            .await?;

        if replaced > 0 {
            info!("Replaced {} existing backup schedule entries", replaced);
        }
        info!("Installed {} backup schedule: {}", frequency, new_line);
        Ok(entry)
    }

    /// Delete marked entries only. Returns how many were removed.
    pub async fn remove(&self, run_as_user: Option<&str>) -> Result<usize> {
        let current = self.store.read(run_as_user).await?;
        let kept: Vec<&str> = current.lines().filter(|l| !is_marked(l)).collect();
        let removed = current.lines().count() - kept.len();

        if removed == 0 {
            warn!("No backup schedule installed");
            return Ok(0);
        }

        self.store.write(run_as_user, &join_lines(&kept)).await?;
        info!("Removed {} backup schedule entries", removed);
        Ok(removed)
    }

    pub async fn list(&self, run_as_user: Option<&str>) -> Result<Vec<ScheduleEntry>> {
        let current = self.store.read(run_as_user).await?;
        Ok(current
            .lines()
            .filter(|l| is_marked(l))
            .filter_map(ScheduleEntry::parse_line)
            .collect())
    }
}

fn join_lines(lines: &[&str]) -> String {
    if lines.is_empty() {
        return String::new();
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(store: Arc<InMemoryCrontab>) -> ScheduleManager {
        ScheduleManager::new(store, "cd /srv/printhub && printhub-ops backup")
    }

    #[test]
    fn test_time_validation() {
        assert_eq!(
            "02:00".parse::<TimeOfDay>().unwrap(),
            TimeOfDay { hour: 2, minute: 0 }
        );
        assert_eq!(
            "23:59".parse::<TimeOfDay>().unwrap(),
            TimeOfDay {
                hour: 23,
                minute: 59
            }
        );
        for bad in ["24:00", "12:60", "2", "ab:cd", "-1:00", "12:5x", "", "123:00"] {
            assert!(
                matches!(
                    bad.parse::<TimeOfDay>(),
                    Err(ScheduleError::InvalidTime { .. })
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_cron_expressions() {
        let time = TimeOfDay {
            hour: 3,
            minute: 15,
        };
        assert_eq!(
            ScheduleEntry::new(Frequency::Hourly, time, "x").cron_expression(),
            "0 * * * *"
        );
        assert_eq!(
            ScheduleEntry::new(Frequency::Daily, time, "x").cron_expression(),
            "15 3 * * *"
        );
        assert_eq!(
            ScheduleEntry::new(Frequency::Weekly, time, "x").cron_expression(),
            "15 3 * * 0"
        );
    }

    #[test]
    fn test_lines_parse_back() {
        let entry = ScheduleEntry::new(
            Frequency::Weekly,
            TimeOfDay { hour: 4, minute: 5 },
            "printhub-ops backup",
        );
        assert_eq!(ScheduleEntry::parse_line(&entry.to_line()), Some(entry));
        assert_eq!(ScheduleEntry::parse_line("0 2 * * * /usr/bin/other"), None);
    }

    #[tokio::test]
    async fn test_install_twice_leaves_one_entry() {
        let store = Arc::new(InMemoryCrontab::default());
        let manager = manager(store.clone());

        manager
            .install(Frequency::Daily, Some("02:00"), None)
            .await
            .unwrap();
        manager
            .install(Frequency::Daily, Some("02:00"), None)
            .await
            .unwrap();

        let entries = manager.list(None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].frequency, Frequency::Daily);
        assert_eq!(entries[0].time, Some(TimeOfDay { hour: 2, minute: 0 }));
        assert_eq!(store.contents(None).matches(MARKER).count(), 1);
    }

    #[tokio::test]
    async fn test_unrelated_entries_survive_install_and_remove() {
        let store = Arc::new(InMemoryCrontab::default());
        store.set(None, "MAILTO=ops@example.com\n*/5 * * * * /usr/bin/certbot renew\n");
        let manager = manager(store.clone());

        manager.install(Frequency::Hourly, None, None).await.unwrap();
        assert!(store.contents(None).contains("certbot"));

        assert_eq!(manager.remove(None).await.unwrap(), 1);
        assert_eq!(
            store.contents(None),
            "MAILTO=ops@example.com\n*/5 * * * * /usr/bin/certbot renew\n"
        );
        assert_eq!(manager.remove(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_time_leaves_store_untouched() {
        let store = Arc::new(InMemoryCrontab::default());
        store.set(None, "0 1 * * * /usr/bin/true\n");
        let manager = manager(store.clone());

        let err = manager
            .install(Frequency::Daily, Some("25:00"), None)
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Configuration);
        assert_eq!(store.reads(), 0);
        assert_eq!(store.contents(None), "0 1 * * * /usr/bin/true\n");
    }

    #[tokio::test]
    async fn test_users_have_separate_crontabs() {
        let store = Arc::new(InMemoryCrontab::default());
        let manager = manager(store.clone());

        manager
            .install(Frequency::Weekly, Some("01:30"), Some("deploy"))
            .await
            .unwrap();
        assert!(manager.list(None).await.unwrap().is_empty());
        assert_eq!(manager.list(Some("deploy")).await.unwrap().len(), 1);
    }
}
