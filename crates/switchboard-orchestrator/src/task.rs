//! Task model and lifecycle states.
//!
//! This module defines the unit of work the orchestrator distributes, its
//! priority ordering, and the monotonic status machine each task moves
//! through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generates a fresh task id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task priority (higher value = dispatched first).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work.
    Low,
    /// Default priority.
    #[default]
    Medium,
    /// Dispatched ahead of normal work.
    High,
    /// Dispatched ahead of everything else.
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// A named agent role with a provider-weight profile.
///
/// The role set is closed: unknown roles are rejected at submit time rather
/// than at execution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Writes and refactors code.
    CodeDeveloper,
    /// Diagnoses failures and error reports.
    ErrorDiagnostician,
    /// Drafts prose content.
    ContentWriter,
    /// Crunches and summarizes data.
    DataAnalyst,
    /// Catch-all assistant for everything else.
    GeneralAssistant,
}

impl Role {
    /// All known roles, in a stable order.
    pub const ALL: [Self; 5] = [
        Self::CodeDeveloper,
        Self::ErrorDiagnostician,
        Self::ContentWriter,
        Self::DataAnalyst,
        Self::GeneralAssistant,
    ];

    /// Canonical name for this role.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CodeDeveloper => "CodeDeveloper",
            Self::ErrorDiagnostician => "ErrorDiagnostician",
            Self::ContentWriter => "ContentWriter",
            Self::DataAnalyst => "DataAnalyst",
            Self::GeneralAssistant => "GeneralAssistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "CodeDeveloper" => Ok(Self::CodeDeveloper),
            "ErrorDiagnostician" => Ok(Self::ErrorDiagnostician),
            "ContentWriter" => Ok(Self::ContentWriter),
            "DataAnalyst" => Ok(Self::DataAnalyst),
            "GeneralAssistant" => Ok(Self::GeneralAssistant),
            other => Err(format!("unknown role: '{other}'")),
        }
    }
}

/// Task execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Queued, not yet picked up by the dispatch loop.
    Pending,
    /// Popped from the queue and matched to an agent.
    Assigned,
    /// An agent is executing the task against the provider pool.
    Executing,
    /// Terminal: the task produced a result.
    Completed,
    /// Terminal: the task failed after exhausting its candidates.
    Failed,
}

impl TaskStatus {
    /// Checks if the task can transition to the given status.
    ///
    /// Transitions are monotonic: Pending → Assigned → Executing →
    /// {Completed | Failed}, with no way back. Pending → Failed is also
    /// valid and covers cancellation before dispatch.
    ///
    /// # Arguments
    /// * `to` - The target status
    ///
    /// # Returns
    /// Returns `true` if the transition is valid, `false` otherwise.
    #[must_use]
    pub fn can_transition_to(&self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Assigned | Self::Failed)
                | (Self::Assigned, Self::Executing)
                | (Self::Executing, Self::Completed | Self::Failed)
        )
    }

    /// Whether this status is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One unit of work submitted to the orchestrator.
///
/// Title and description are opaque payloads; the orchestrator only looks at
/// role, priority, and status. A task record is mutated solely by the
/// orchestrator that owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task id.
    pub id: TaskId,
    /// Short label for the work (opaque).
    pub title: String,
    /// Full payload for the work (opaque).
    pub description: String,
    /// The agent role that should execute this task.
    pub role: Role,
    /// Dispatch priority.
    pub priority: Priority,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// The provider that ultimately executed the task (set once execution
    /// succeeds on a provider).
    pub assigned_provider: Option<String>,
    /// The result payload, if completed.
    pub result: Option<String>,
    /// The terminal error, if failed.
    pub error: Option<String>,
    /// Tokens consumed across the successful attempt.
    pub tokens_used: u32,
    /// Estimated cost of the successful attempt in USD.
    pub cost_estimate: f64,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Terminal time, if completed or failed.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Creates a new pending task.
    ///
    /// # Arguments
    /// * `title` - Short label (opaque payload)
    /// * `description` - Full payload
    /// * `role` - The agent role to execute the task
    /// * `priority` - Dispatch priority
    #[must_use]
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        role: Role,
        priority: Priority,
    ) -> Self {
        Self {
            id: TaskId::new(),
            title: title.into(),
            description: description.into(),
            role,
            priority,
            status: TaskStatus::Pending,
            assigned_provider: None,
            result: None,
            error: None,
            tokens_used: 0,
            cost_estimate: 0.0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Read-only view of a task, returned by status lookups.
pub type TaskSnapshot = Task;
