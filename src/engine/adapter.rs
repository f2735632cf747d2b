//! The capability interface the gateway consumes from the inference engine.

use std::path::Path;

use thiserror::Error;

use crate::config::{ModelParams, SamplingParams};
use crate::engine::{Batch, ChatMessage, ContextHandle, ModelHandle, ModelInfo, SamplerHandle, SeqId, TokenId};

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    #[error("failed to create context: {0}")]
    Context(String),

    #[error("tokenization failed: {0}")]
    Tokenize(String),

    #[error("chat template failed: {0}")]
    Template(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("sampling failed: {0}")]
    Sample(String),

    #[error("unknown engine handle {0}")]
    BadHandle(u64),
}

/// Synchronous capability set of the underlying inference engine.
///
/// The engine's decode is single-consumer on one context: only the worker
/// thread and the swap controller (under the swap lock) call the mutating
/// operations. All methods that can fail return [`EngineError`]; the gateway
/// translates these into its own taxonomy.
pub trait Engine: Send {
    /// Downcast support, mainly for exercising concrete engines in tests.
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;

    fn load_model(&mut self, path: &Path, params: &ModelParams) -> Result<ModelHandle, EngineError>;

    fn free_model(&mut self, model: ModelHandle);

    fn create_context(&mut self, model: ModelHandle, params: &ModelParams) -> Result<ContextHandle, EngineError>;

    fn free_context(&mut self, ctx: ContextHandle);

    /// Engine-reported model facts (description, vocab size, trained context).
    fn model_info(&self, model: ModelHandle) -> Result<ModelInfo, EngineError>;

    /// Render a conversation through the model's chat template.
    fn apply_chat_template(
        &self,
        model: ModelHandle,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Result<String, EngineError>;

    fn tokenize(&self, model: ModelHandle, text: &str, add_bos: bool, special: bool) -> Result<Vec<TokenId>, EngineError>;

    /// Raw bytes of one token. May be a partial UTF-8 sequence.
    fn token_to_piece(&self, model: ModelHandle, token: TokenId) -> Vec<u8>;

    /// Whether the token ends generation (EOS/EOT family).
    fn is_end_of_generation(&self, model: ModelHandle, token: TokenId) -> bool;

    /// Context window size in tokens.
    fn ctx_capacity(&self, ctx: ContextHandle) -> u32;

    /// Tokens currently held in the context's KV cache, all sequences.
    fn ctx_used(&self, ctx: ContextHandle) -> u32;

    fn decode(&mut self, ctx: ContextHandle, batch: &Batch) -> Result<(), EngineError>;

    /// Drop every sequence from the KV cache. `data` additionally releases
    /// the backing buffers.
    fn kv_clear(&mut self, ctx: ContextHandle, data: bool);

    /// Remove cells of `seq` in positions `[from, to)`. Negative bounds
    /// select the whole sequence.
    fn kv_seq_remove(&mut self, ctx: ContextHandle, seq: SeqId, from: i64, to: i64);

    /// Shift cells of `seq` in `[from, to)` by `delta` positions.
    fn kv_seq_shift(&mut self, ctx: ContextHandle, seq: SeqId, from: i64, to: i64, delta: i64);

    fn attach_threadpool(&mut self, ctx: ContextHandle, threads: i32, threads_batch: i32);

    /// Build an immutable sampler chain from a fully-resolved parameter
    /// record (sentinels such as `penalty_last_n = -1` already expanded).
    fn sampler_build(&mut self, model: ModelHandle, params: &SamplingParams) -> Result<SamplerHandle, EngineError>;

    fn sampler_free(&mut self, sampler: SamplerHandle);

    /// Sample the next token from the logits of the last decode on `seq`.
    fn sampler_sample(&mut self, sampler: SamplerHandle, ctx: ContextHandle, seq: SeqId) -> Result<TokenId, EngineError>;
}
