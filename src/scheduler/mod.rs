//! Task scheduling: a three-level priority queue with fair admission and a
//! single background worker that owns the decode path.

pub mod queue;
pub mod worker;

use std::time::Instant;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::config::RuntimeParams;
use crate::error::Result;
use crate::session::ExecCtx;

pub use queue::{QueueSettings, QueueStats, TaskQueue};

/// Process-unique task identifier, monotonically assigned.
pub type TaskId = u64;

/// Scheduling priority. Urgent gets its own queue level; High and Normal
/// share one; Low has its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            "urgent" => Some(Priority::Urgent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Expired,
    Rejected,
}

/// What a finished task hands back: the (possibly truncated) response body,
/// or the error that stopped it.
pub type TaskOutcome = Result<Bytes>;

/// One queued inference request.
#[derive(Debug)]
pub struct Task {
    pub id: TaskId,
    pub exec_ctx: ExecCtx,
    pub priority: Priority,
    pub created_at: Instant,
    /// `created_at` + the per-task timeout at enqueue time.
    pub timeout_at: Instant,
    pub prompt: Bytes,
    pub runtime: Option<RuntimeParams>,
    pub state: TaskState,
    /// Completion channel back to the submitting caller. Absent when the
    /// caller chose not to wait.
    pub responder: Option<oneshot::Sender<TaskOutcome>>,
}
