//! Records kept in the worker registry.
use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The identifier of a worker, unique per worker process.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    /// Generates an identifier from the process id and a random suffix.
    pub fn generate() -> Self {
        Self(format!(
            "worker-{}-{:08x}",
            std::process::id(),
            rand::random::<u32>()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for WorkerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Running,
    Paused,
    Stopped,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }
}

impl Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown worker status `{0}`")]
pub struct UnknownWorkerStatus(String);

impl FromStr for WorkerStatus {
    type Err = UnknownWorkerStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "stopped" => Ok(Self::Stopped),
            other => Err(UnknownWorkerStatus(other.to_owned())),
        }
    }
}

/// A command sent to a worker through the registry.
///
/// Commands are only observed when the worker next polls its own status, between jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerAction {
    Pause,
    Resume,
    Stop,
}

impl WorkerAction {
    pub fn target_status(&self) -> WorkerStatus {
        match self {
            Self::Pause => WorkerStatus::Paused,
            Self::Resume => WorkerStatus::Running,
            Self::Stop => WorkerStatus::Stopped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRecord {
    pub worker_id: WorkerId,
    pub queue: String,
    pub status: WorkerStatus,
    pub processed_count: u64,
    pub failed_count: u64,
    pub last_heartbeat: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

impl WorkerRecord {
    /// Whether the last heartbeat is more than `timeout` before `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: chrono::TimeDelta) -> bool {
        now - self.last_heartbeat > timeout
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(WorkerId::generate(), WorkerId::generate());
    }

    #[test]
    fn status_parses_from_its_name() {
        for status in [
            WorkerStatus::Running,
            WorkerStatus::Paused,
            WorkerStatus::Stopped,
        ] {
            assert_eq!(status.as_str().parse::<WorkerStatus>(), Ok(status));
        }
        assert!("sleeping".parse::<WorkerStatus>().is_err());
    }

    #[test]
    fn stale_after_timeout_without_heartbeat() {
        let now = Utc::now();
        let worker = WorkerRecord {
            worker_id: WorkerId::from("worker-1"),
            queue: "default".to_owned(),
            status: WorkerStatus::Running,
            processed_count: 0,
            failed_count: 0,
            last_heartbeat: now - chrono::TimeDelta::minutes(10),
            started_at: now - chrono::TimeDelta::hours(1),
        };

        assert!(worker.is_stale(now, chrono::TimeDelta::minutes(5)));
        assert!(!worker.is_stale(now, chrono::TimeDelta::minutes(15)));
        assert!(!worker.is_stale(now, chrono::TimeDelta::MAX));
    }

    #[test]
    fn actions_map_to_statuses() {
        assert_eq!(WorkerAction::Pause.target_status(), WorkerStatus::Paused);
        assert_eq!(WorkerAction::Resume.target_status(), WorkerStatus::Running);
        assert_eq!(WorkerAction::Stop.target_status(), WorkerStatus::Stopped);
    }
}
