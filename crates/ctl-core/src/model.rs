use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::settings::RunSettings;

/// An isolated crawl codebase. Created by the API layer; the control plane
/// only reads it.
#[derive(Debug, Clone, PartialEq)]
pub struct Project {
    pub id: String,
    pub name: String,
    /// Filesystem root holding spider source and the project's crawl tool.
    pub root_path: PathBuf,
    /// Set by the API when deletion is requested; blocks new runs.
    pub pending_delete: bool,
    pub created_at: DateTime<Utc>,
}

/// A program within a project that emits structured records from web pages.
/// `(project, name)` is unique.
#[derive(Debug, Clone, PartialEq)]
pub struct Spider {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub settings: RunSettings,
}

/// A cron rule attached to a spider. The scheduler owns the two fire
/// timestamps; everything else is owned by the API layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    pub id: String,
    pub spider_id: String,
    pub cron: String,
    pub active: bool,
    pub last_fire_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub overrides: RunSettings,
}

/// Lifecycle state of a run. Transitions are monotone along
/// `Pending → Running → {Finished | Failed | Cancelled}`; the only other
/// writes are reconciliation's terminal repairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Pending => "PENDING",
            RunState::Running => "RUNNING",
            RunState::Finished => "FINISHED",
            RunState::Failed => "FAILED",
            RunState::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<RunState> {
        match s {
            "PENDING" => Some(RunState::Pending),
            "RUNNING" => Some(RunState::Running),
            "FINISHED" => Some(RunState::Finished),
            "FAILED" => Some(RunState::Failed),
            "CANCELLED" => Some(RunState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Finished | RunState::Failed | RunState::Cancelled
        )
    }

    /// Whether `self → to` is a legal forward transition.
    pub fn can_transition(self, to: RunState) -> bool {
        matches!(
            (self, to),
            (RunState::Pending, RunState::Running)
                | (RunState::Pending, RunState::Failed)
                | (RunState::Pending, RunState::Cancelled)
                | (RunState::Running, RunState::Finished)
                | (RunState::Running, RunState::Failed)
                | (RunState::Running, RunState::Cancelled)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What asked for a run: a schedule fire or a direct caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOrigin {
    Schedule(String),
    Manual,
}

impl RunOrigin {
    pub fn schedule_id(&self) -> Option<&str> {
        match self {
            RunOrigin::Schedule(id) => Some(id),
            RunOrigin::Manual => None,
        }
    }
}

/// One execution of a spider, from dispatch to terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    pub id: String,
    pub project_id: String,
    pub spider_id: String,
    pub spider_name: String,
    pub schedule_id: Option<String>,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub items_count: i64,
    pub requests_count: i64,
    pub error_count: i64,
    pub output_path: PathBuf,
    pub settings: RunSettings,
    pub pid: Option<u32>,
    pub error_message: Option<String>,
}

impl Run {
    /// Wall-clock duration, when both endpoints are known.
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }
}

/// Transient queued request to start a run. Consumed exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub id: String,
    pub spider_id: String,
    pub project_id: String,
    pub schedule_id: Option<String>,
    pub fired_at: DateTime<Utc>,
    pub overrides: RunSettings,
    /// Times the dispatcher has put this request back for lack of capacity.
    pub attempts: u32,
    /// Set once `attempts` crosses the re-queue bound; ready items jump the
    /// FIFO so starved requests eventually win a slot.
    pub high_priority: bool,
}

impl DispatchRequest {
    pub fn scheduled(
        schedule_id: &str,
        spider_id: &str,
        project_id: &str,
        fired_at: DateTime<Utc>,
        overrides: RunSettings,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            spider_id: spider_id.to_string(),
            project_id: project_id.to_string(),
            schedule_id: Some(schedule_id.to_string()),
            fired_at,
            overrides,
            attempts: 0,
            high_priority: false,
        }
    }

    pub fn manual(spider_id: &str, project_id: &str, overrides: RunSettings) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            spider_id: spider_id.to_string(),
            project_id: project_id.to_string(),
            schedule_id: None,
            fired_at: Utc::now(),
            overrides,
            attempts: 0,
            high_priority: false,
        }
    }

    pub fn origin(&self) -> RunOrigin {
        match &self.schedule_id {
            Some(id) => RunOrigin::Schedule(id.clone()),
            None => RunOrigin::Manual,
        }
    }
}
