//! Task model and status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for its `scheduled_for` time and a free namespace.
    Scheduled,
    /// Claimed and currently executing.
    Processing,
    /// Run finished normally.
    Completed,
    /// Run aborted with an error.
    Failed,
    /// Run was interrupted before it could finish.
    Stopped,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        Self::Scheduled,
        Self::Processing,
        Self::Completed,
        Self::Failed,
        Self::Stopped,
    ];

    pub const TERMINAL: [TaskStatus; 3] = [Self::Completed, Self::Failed, Self::Stopped];

    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Scheduled, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Stopped)
        )
    }

    /// Position in the lifecycle. Status writes may only move forward.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Scheduled => 0,
            Self::Processing => 1,
            Self::Completed | Self::Failed | Self::Stopped => 2,
        }
    }

    /// Statuses a record may hold for a write of `self` to be accepted.
    pub fn earlier_statuses(&self) -> Vec<TaskStatus> {
        Self::ALL
            .into_iter()
            .filter(|from| from.rank() < self.rank())
            .collect()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// A durable, schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    pub namespace: String,
    /// The instruction the run is seeded with.
    pub message: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    /// Earliest eligible execution time. Never mutated after creation.
    pub scheduled_for: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl Task {
    /// Create a new scheduled task.
    pub fn new(
        namespace: impl Into<String>,
        message: impl Into<String>,
        scheduled_for: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            namespace: namespace.into(),
            message: message.into(),
            status: TaskStatus::Scheduled,
            created_at: Utc::now(),
            scheduled_for,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    /// Whether the task may be claimed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Scheduled && self.scheduled_for <= now
    }
}

/// Optional fields written alongside a status change.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(at),
            ..Default::default()
        }
    }

    pub fn completed(result: serde_json::Value) -> Self {
        Self {
            completed_at: Some(Utc::now()),
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            completed_at: Some(Utc::now()),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}
