//! Stub engine: simulates a llama.cpp-shaped runtime for testing the
//! gateway without the C library.
//!
//! The stub tokenizes at the byte level (one token per byte), renders a
//! ChatML-style template, and generates from a queue of scripted replies.
//! KV cells are tracked per sequence so range removals and shifts can be
//! asserted against. An optional per-token delay makes deadline behavior
//! observable in tests.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::config::{ModelParams, SamplingParams};
use crate::engine::{
    Batch, ChatMessage, ContextHandle, Engine, EngineError, ModelHandle, ModelInfo, SamplerHandle, SeqId, TokenId,
};

/// Beginning-of-sequence token.
pub const BOS: TokenId = 1;

/// End-of-generation token.
pub const EOS: TokenId = 2;

/// First token id carrying a byte payload; byte `b` is token `BYTE_BASE + b`.
pub const BYTE_BASE: TokenId = 3;

const VOCAB_SIZE: usize = BYTE_BASE as usize + 256;

struct StubModel {
    path: String,
    info: ModelInfo,
}

struct StubContext {
    capacity: u32,
    /// Occupied cell positions per sequence.
    cells: HashMap<SeqId, BTreeSet<i64>>,
}

pub struct StubEngine {
    next_handle: u64,
    models: HashMap<u64, StubModel>,
    contexts: HashMap<u64, StubContext>,
    samplers: HashMap<u64, SamplingParams>,

    /// Scripted assistant replies, consumed front-first. When empty, the
    /// stub answers with [`Self::DEFAULT_REPLY`].
    replies: VecDeque<String>,

    /// Bytes of the reply currently being emitted token by token.
    active_reply: Option<VecDeque<u8>>,

    /// Artificial latency per sampled token.
    delay_per_token: Option<Duration>,

    pub decode_calls: u64,
    pub sample_calls: u64,
}

impl StubEngine {
    pub const DEFAULT_REPLY: &'static str = "ok";

    pub fn new() -> Self {
        Self {
            next_handle: 1,
            models: HashMap::new(),
            contexts: HashMap::new(),
            samplers: HashMap::new(),
            replies: VecDeque::new(),
            active_reply: None,
            delay_per_token: None,
            decode_calls: 0,
            sample_calls: 0,
        }
    }

    /// Script the next assistant reply.
    pub fn queue_reply(&mut self, text: impl Into<String>) {
        self.replies.push_back(text.into());
    }

    /// Sleep this long inside every `sampler_sample` call.
    pub fn set_delay_per_token(&mut self, delay: Duration) {
        self.delay_per_token = Some(delay);
    }

    /// Occupied cell positions for a sequence, ascending. Empty when the
    /// sequence holds nothing.
    pub fn seq_cells(&self, ctx: ContextHandle, seq: SeqId) -> Vec<i64> {
        self.contexts
            .get(&ctx.0)
            .and_then(|c| c.cells.get(&seq))
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of live sequences in a context.
    pub fn seq_count(&self, ctx: ContextHandle) -> usize {
        self.contexts
            .get(&ctx.0)
            .map(|c| c.cells.values().filter(|s| !s.is_empty()).count())
            .unwrap_or(0)
    }

    /// The parameter record a sampler was built from.
    pub fn sampler_params(&self, sampler: SamplerHandle) -> Option<&SamplingParams> {
        self.samplers.get(&sampler.0)
    }

    pub fn live_samplers(&self) -> usize {
        self.samplers.len()
    }

    fn handle(&mut self) -> u64 {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }
}

impl Default for StubEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for StubEngine {
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn load_model(&mut self, path: &Path, params: &ModelParams) -> Result<ModelHandle, EngineError> {
        if !path.exists() {
            return Err(EngineError::ModelLoad(format!(
                "model file not found: {}",
                path.display()
            )));
        }

        let h = self.handle();
        self.models.insert(
            h,
            StubModel {
                path: path.display().to_string(),
                info: ModelInfo {
                    description: "stub byte-level model".to_string(),
                    vocab_size: VOCAB_SIZE,
                    trained_ctx: params.ctx_size,
                },
            },
        );
        debug!(model = h, path = %path.display(), "stub model loaded");
        Ok(ModelHandle(h))
    }

    fn free_model(&mut self, model: ModelHandle) {
        self.models.remove(&model.0);
    }

    fn create_context(&mut self, model: ModelHandle, params: &ModelParams) -> Result<ContextHandle, EngineError> {
        if !self.models.contains_key(&model.0) {
            return Err(EngineError::BadHandle(model.0));
        }
        let h = self.handle();
        self.contexts.insert(
            h,
            StubContext {
                capacity: params.ctx_size,
                cells: HashMap::new(),
            },
        );
        Ok(ContextHandle(h))
    }

    fn free_context(&mut self, ctx: ContextHandle) {
        self.contexts.remove(&ctx.0);
    }

    fn model_info(&self, model: ModelHandle) -> Result<ModelInfo, EngineError> {
        self.models
            .get(&model.0)
            .map(|m| m.info.clone())
            .ok_or(EngineError::BadHandle(model.0))
    }

    fn apply_chat_template(
        &self,
        model: ModelHandle,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Result<String, EngineError> {
        if !self.models.contains_key(&model.0) {
            return Err(EngineError::BadHandle(model.0));
        }
        let mut out = String::new();
        for m in messages {
            out.push_str("<|im_start|>");
            out.push_str(m.role.as_str());
            out.push('\n');
            out.push_str(&m.content);
            out.push_str("<|im_end|>\n");
        }
        if add_generation_prompt {
            out.push_str("<|im_start|>assistant\n");
        }
        Ok(out)
    }

    fn tokenize(&self, model: ModelHandle, text: &str, add_bos: bool, _special: bool) -> Result<Vec<TokenId>, EngineError> {
        if !self.models.contains_key(&model.0) {
            return Err(EngineError::BadHandle(model.0));
        }
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_bos {
            tokens.push(BOS);
        }
        tokens.extend(text.bytes().map(|b| BYTE_BASE + b as TokenId));
        Ok(tokens)
    }

    fn token_to_piece(&self, _model: ModelHandle, token: TokenId) -> Vec<u8> {
        if token >= BYTE_BASE && token < BYTE_BASE + 256 {
            vec![(token - BYTE_BASE) as u8]
        } else {
            Vec::new()
        }
    }

    fn is_end_of_generation(&self, _model: ModelHandle, token: TokenId) -> bool {
        token == EOS
    }

    fn ctx_capacity(&self, ctx: ContextHandle) -> u32 {
        self.contexts.get(&ctx.0).map(|c| c.capacity).unwrap_or(0)
    }

    fn ctx_used(&self, ctx: ContextHandle) -> u32 {
        self.contexts
            .get(&ctx.0)
            .map(|c| c.cells.values().map(|s| s.len() as u32).sum())
            .unwrap_or(0)
    }

    fn decode(&mut self, ctx: ContextHandle, batch: &Batch) -> Result<(), EngineError> {
        let context = self
            .contexts
            .get_mut(&ctx.0)
            .ok_or(EngineError::BadHandle(ctx.0))?;

        let cells = context.cells.entry(batch.seq).or_default();
        for (i, _) in batch.tokens.iter().enumerate() {
            cells.insert(batch.pos as i64 + i as i64);
        }
        self.decode_calls += 1;

        // The first prefill chunk of a turn arms the next scripted reply.
        if batch.pos == 0 && batch.tokens.len() > 1 {
            let text = self
                .replies
                .pop_front()
                .unwrap_or_else(|| Self::DEFAULT_REPLY.to_string());
            self.active_reply = Some(text.into_bytes().into());
        }
        Ok(())
    }

    fn kv_clear(&mut self, ctx: ContextHandle, _data: bool) {
        if let Some(context) = self.contexts.get_mut(&ctx.0) {
            context.cells.clear();
        }
    }

    fn kv_seq_remove(&mut self, ctx: ContextHandle, seq: SeqId, from: i64, to: i64) {
        if let Some(context) = self.contexts.get_mut(&ctx.0) {
            if let Some(cells) = context.cells.get_mut(&seq) {
                if from < 0 && to < 0 {
                    cells.clear();
                } else {
                    cells.retain(|&p| p < from || p >= to);
                }
            }
        }
    }

    fn kv_seq_shift(&mut self, ctx: ContextHandle, seq: SeqId, from: i64, to: i64, delta: i64) {
        if let Some(context) = self.contexts.get_mut(&ctx.0) {
            if let Some(cells) = context.cells.get_mut(&seq) {
                let moved: Vec<i64> = cells.iter().copied().filter(|&p| p >= from && p < to).collect();
                for p in &moved {
                    cells.remove(p);
                }
                for p in moved {
                    cells.insert(p + delta);
                }
            }
        }
    }

    fn attach_threadpool(&mut self, _ctx: ContextHandle, _threads: i32, _threads_batch: i32) {}

    fn sampler_build(&mut self, model: ModelHandle, params: &SamplingParams) -> Result<SamplerHandle, EngineError> {
        if !self.models.contains_key(&model.0) {
            return Err(EngineError::BadHandle(model.0));
        }
        let h = self.handle();
        self.samplers.insert(h, params.clone());
        Ok(SamplerHandle(h))
    }

    fn sampler_free(&mut self, sampler: SamplerHandle) {
        self.samplers.remove(&sampler.0);
    }

    fn sampler_sample(&mut self, sampler: SamplerHandle, _ctx: ContextHandle, _seq: SeqId) -> Result<TokenId, EngineError> {
        if !self.samplers.contains_key(&sampler.0) {
            return Err(EngineError::BadHandle(sampler.0));
        }
        if let Some(delay) = self.delay_per_token {
            std::thread::sleep(delay);
        }
        self.sample_calls += 1;

        match self.active_reply.as_mut().and_then(|r| r.pop_front()) {
            Some(byte) => Ok(BYTE_BASE + byte as TokenId),
            None => {
                self.active_reply = None;
                Ok(EOS)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ChatRole;

    fn loaded() -> (StubEngine, ModelHandle, ContextHandle) {
        let mut engine = StubEngine::new();
        let file = std::env::temp_dir().join("nn-gateway-stub-test.gguf");
        std::fs::write(&file, b"stub").unwrap();
        let params = ModelParams::default();
        let model = engine.load_model(&file, &params).unwrap();
        let ctx = engine.create_context(model, &params).unwrap();
        (engine, model, ctx)
    }

    #[test]
    fn test_load_requires_existing_file() {
        let mut engine = StubEngine::new();
        let err = engine
            .load_model(Path::new("/nonexistent/model.gguf"), &ModelParams::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::ModelLoad(_)));
    }

    #[test]
    fn test_tokenize_round_trips_bytes() {
        let (engine, model, _ctx) = loaded();
        let tokens = engine.tokenize(model, "hi", true, true).unwrap();
        assert_eq!(tokens[0], BOS);
        let bytes: Vec<u8> = tokens[1..]
            .iter()
            .flat_map(|&t| engine.token_to_piece(model, t))
            .collect();
        assert_eq!(bytes, b"hi");
    }

    #[test]
    fn test_chat_template_shape() {
        let (engine, model, _ctx) = loaded();
        let rendered = engine
            .apply_chat_template(model, &[ChatMessage::new(ChatRole::User, "hello")], true)
            .unwrap();
        assert!(rendered.starts_with("<|im_start|>user\nhello<|im_end|>\n"));
        assert!(rendered.ends_with("<|im_start|>assistant\n"));
    }

    #[test]
    fn test_scripted_reply_then_eos() {
        let (mut engine, model, ctx) = loaded();
        engine.queue_reply("ab");

        let sampler = engine.sampler_build(model, &SamplingParams::default()).unwrap();
        // Prefill arms the reply.
        engine
            .decode(ctx, &Batch { seq: 7, pos: 0, tokens: vec![BOS, BYTE_BASE] })
            .unwrap();

        let t1 = engine.sampler_sample(sampler, ctx, 7).unwrap();
        let t2 = engine.sampler_sample(sampler, ctx, 7).unwrap();
        let t3 = engine.sampler_sample(sampler, ctx, 7).unwrap();
        assert_eq!(engine.token_to_piece(model, t1), b"a");
        assert_eq!(engine.token_to_piece(model, t2), b"b");
        assert_eq!(t3, EOS);
    }

    #[test]
    fn test_kv_remove_and_shift() {
        let (mut engine, _model, ctx) = loaded();
        engine
            .decode(ctx, &Batch { seq: 1, pos: 0, tokens: vec![10, 11, 12, 13, 14, 15, 16, 17] })
            .unwrap();
        assert_eq!(engine.ctx_used(ctx), 8);

        // Drop [2, 4) then slide the tail left by 2.
        engine.kv_seq_remove(ctx, 1, 2, 4);
        engine.kv_seq_shift(ctx, 1, 4, 8, -2);
        assert_eq!(engine.seq_cells(ctx, 1), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_kv_remove_whole_sequence() {
        let (mut engine, _model, ctx) = loaded();
        engine
            .decode(ctx, &Batch { seq: 3, pos: 0, tokens: vec![10, 11] })
            .unwrap();
        engine.kv_seq_remove(ctx, 3, -1, -1);
        assert!(engine.seq_cells(ctx, 3).is_empty());
    }
}
