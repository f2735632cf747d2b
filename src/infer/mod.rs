//! Request execution: sampler construction and the end-to-end decode loop.

pub mod orchestrator;
pub mod sampler;

use crate::config::{SamplingParams, StoppingParams};

pub use orchestrator::{CompletionOutcome, FinishReason};

/// Swap-updatable generation defaults shared between the worker and the
/// public API.
#[derive(Debug, Clone, Default)]
pub struct GenerationDefaults {
    pub sampling: SamplingParams,
    pub stopping: StoppingParams,
}
