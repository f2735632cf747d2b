//! Engine adapter: the only surface through which the gateway touches the
//! inference engine.
//!
//! The gateway treats the engine as an external collaborator. Everything it
//! needs (model/context lifecycle, tokenization, chat templating, batch
//! decode, sampling, KV-cache range operations) is expressed as the
//! [`Engine`] trait so the rest of the crate can be exercised against the
//! [`StubEngine`] simulation.

pub mod adapter;
pub mod stub;

pub use adapter::{Engine, EngineError};
pub use stub::StubEngine;

/// Token identifier, engine-scoped.
pub type TokenId = i32;

/// KV-cache sequence identifier. Equal to the owning session's exec-ctx.
pub type SeqId = u64;

/// Opaque handle to a loaded model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelHandle(pub(crate) u64);

/// Opaque handle to an execution context created from a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub(crate) u64);

/// Opaque handle to a built sampler chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerHandle(pub(crate) u64);

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for ChatRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One turn of a conversation, as fed to the chat template.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A contiguous run of tokens to decode into one sequence.
///
/// Positions are `pos .. pos + tokens.len()`; the engine computes logits
/// for the final token of the batch.
#[derive(Debug, Clone)]
pub struct Batch {
    pub seq: SeqId,
    pub pos: u32,
    pub tokens: Vec<TokenId>,
}

/// Engine-reported facts about a loaded model, recorded at load/swap time.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    /// Human-readable architecture description (e.g. "llama 7B Q4_K_M").
    pub description: String,

    /// Vocabulary size.
    pub vocab_size: usize,

    /// Context length the model was trained with.
    pub trained_ctx: u32,
}

/// Metadata about the currently loaded model, derived from the file and the
/// engine at load time.
#[derive(Debug, Clone)]
pub struct ModelMeta {
    /// File basename without extension.
    pub name: String,

    /// Path the model was loaded from (needed for swap rollback).
    pub path: std::path::PathBuf,

    /// Engine description string.
    pub architecture: String,

    pub vocab_size: usize,

    pub trained_ctx: u32,

    /// Version tag derived from file size and modification time.
    pub version: String,
}

impl ModelMeta {
    pub fn probe(engine: &dyn Engine, model: ModelHandle, path: &std::path::Path) -> Result<Self, EngineError> {
        let info = engine.model_info(model)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let version = match std::fs::metadata(path) {
            Ok(meta) => {
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                format!("{:x}-{:x}", meta.len(), mtime)
            }
            Err(_) => "unknown".to_string(),
        };
        Ok(Self {
            name,
            path: path.to_path_buf(),
            architecture: info.description,
            vocab_size: info.vocab_size,
            trained_ctx: info.trained_ctx,
            version,
        })
    }
}

/// Engine-side state owned by the adapter: the engine itself plus the
/// current model/context handles. Mutated only by the worker (during a
/// task) and the swap controller (under the swap lock).
pub struct EngineState {
    pub engine: Box<dyn Engine>,
    pub model: Option<ModelHandle>,
    pub ctx: Option<ContextHandle>,
    pub params: crate::config::ModelParams,
    pub meta: Option<ModelMeta>,
}

impl EngineState {
    pub fn new(engine: Box<dyn Engine>) -> Self {
        Self {
            engine,
            model: None,
            ctx: None,
            params: crate::config::ModelParams::default(),
            meta: None,
        }
    }

    /// The loaded model and context, or `InvalidArgument` when no model has
    /// been loaded yet.
    pub fn loaded(&self) -> crate::error::Result<(ModelHandle, ContextHandle)> {
        match (self.model, self.ctx) {
            (Some(m), Some(c)) => Ok((m, c)),
            _ => Err(crate::error::GatewayError::InvalidArgument(
                "no model loaded".into(),
            )),
        }
    }
}
