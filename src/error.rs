//! Gateway error taxonomy.
//!
//! Every public API call returns one of these kinds so callers can tell
//! transient conditions (Capacity, Busy) from terminal ones (Unrecoverable).
//! Partial inference output (deadline or context exhaustion mid-decode) is
//! not an error: the orchestrator returns the text produced so far as a
//! successful, truncated body.

use thiserror::Error;

use crate::engine::EngineError;

#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// Caller passed a null, missing, or malformed argument that admits no
    /// default correction.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// max_concurrent exhausted or the task queue is full.
    #[error("capacity exhausted: {0}")]
    Capacity(String),

    /// The engine refused to load the requested model. A recovery attempt
    /// with the previous model may already have happened.
    #[error("model load failed: {0}")]
    ModelLoadFailed(String),

    /// Both the new and the backup model failed to load during a swap.
    /// The backend must be deinitialized.
    #[error("backend is unrecoverable; deinitialize it")]
    Unrecoverable,

    /// A decode/tokenize/sample call surfaced an engine failure.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// The tokenized prompt exceeds context capacity even after any
    /// permitted context shift.
    #[error("prompt of {prompt_tokens} tokens exceeds context capacity {capacity}")]
    PromptTooLarge { prompt_tokens: usize, capacity: usize },

    /// No session matches the supplied execution context.
    #[error("no session for execution context {0}")]
    NotFound(u64),

    /// A model swap is in progress.
    #[error("a model swap is in progress")]
    Busy,

    /// The configuration document could not be parsed; defaults remain.
    #[error("configuration parse error: {0}")]
    Configuration(String),

    /// The task's deadline elapsed while it was still queued, before any
    /// token was produced.
    #[error("task {0} expired before it could start")]
    Timeout(u64),

    /// The session was closed (or the gateway shut down) while the task
    /// was waiting in the queue.
    #[error("session closed before the task could run")]
    SessionClosed,
}

pub type Result<T> = std::result::Result<T, GatewayError>;
