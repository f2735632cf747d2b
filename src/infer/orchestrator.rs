//! End-to-end execution of one inference request.
//!
//! The flow for `(exec_ctx, prompt)`: touch the session, merge runtime
//! overrides into the sampling record (rebuilding the slot sampler only on
//! change), append the user turn, render the chat template, clear the
//! session's KV sequence, tokenize, prefill in engine-batch-sized chunks,
//! then decode token by token until EOS, a stop sequence, the token budget,
//! a full context, or the task deadline. Deadline and context exhaustion
//! return the partial text as success.

use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info};

use crate::config::RuntimeParams;
use crate::engine::{Batch, ChatMessage, ChatRole, EngineState};
use crate::error::{GatewayError, Result};
use crate::infer::{sampler, GenerationDefaults};
use crate::memory::MemoryManager;
use crate::session::{ExecCtx, SessionStore};

/// Why the decode loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The model emitted an end-of-generation token.
    Eos,
    /// The response ended with a configured stop sequence (now removed).
    StopSequence,
    /// The token budget was exhausted.
    Length,
    /// The context filled up and could not be shifted further.
    ContextFull,
    /// The task deadline elapsed mid-decode.
    Timeout,
}

#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub text: String,
    pub finish: FinishReason,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// Drive one request to completion. Caller holds the engine state lock for
/// the whole call; this is the single-consumer decode path.
pub fn run(
    state: &mut EngineState,
    sessions: &SessionStore,
    memory: &MemoryManager,
    defaults: &GenerationDefaults,
    exec_ctx: ExecCtx,
    prompt: &str,
    runtime: Option<&RuntimeParams>,
    deadline: Instant,
) -> Result<CompletionOutcome> {
    sessions.touch(exec_ctx)?;
    let (model, ctx) = state.loaded()?;
    let capacity = state.engine.ctx_capacity(ctx);
    let seq = exec_ctx;

    // Effective parameters for this request.
    let effective = sampler::effective(&defaults.sampling, runtime);
    let max_tokens = runtime
        .and_then(|rt| rt.max_tokens)
        .unwrap_or(defaults.stopping.max_tokens);
    let ignore_eos = effective.ignore_eos;
    let mut stops: Vec<String> = defaults.stopping.stop.clone();
    if let Some(extra) = runtime.and_then(|rt| rt.stop.as_ref()) {
        stops.extend(extra.iter().cloned());
    }

    // Rebuild the slot sampler only when the effective record changed.
    let (current, current_params) = sessions.sampler(exec_ctx)?;
    let slot_sampler = match current {
        Some(handle) if current_params == effective => handle,
        _ => {
            let rebuilt = sampler::build(state.engine.as_mut(), model, capacity, &effective)?;
            if let Some(old) = sessions.set_sampler(exec_ctx, rebuilt, effective.clone())? {
                state.engine.sampler_free(old);
            }
            rebuilt
        }
    };

    // The user turn joins the history before any decode work.
    sessions.append_message(exec_ctx, ChatMessage::new(ChatRole::User, prompt))?;
    let history = sessions.history(exec_ctx)?;
    let rendered = state.engine.apply_chat_template(model, &history, true)?;

    // Session-isolated prefill: each turn re-seeds the sequence.
    memory.clear(state.engine.as_mut(), ctx, seq);
    if memory.pressure_detected() {
        memory.handle_pressure(state.engine.as_mut(), ctx, seq, 0);
    }

    let tokens = state.engine.tokenize(model, &rendered, true, true)?;
    if tokens.len() > capacity as usize {
        // A freshly cleared sequence has nothing to shift away.
        let shifted = memory.shift(state.engine.as_mut(), ctx, seq, 0);
        if shifted.is_none() || tokens.len() > capacity as usize {
            return Err(GatewayError::PromptTooLarge {
                prompt_tokens: tokens.len(),
                capacity: capacity as usize,
            });
        }
    }

    // Prefill.
    let prompt_tokens = tokens.len();
    let mut n_past: u32 = 0;
    for chunk in tokens.chunks(state.params.batch_size.max(1) as usize) {
        state.engine.decode(
            ctx,
            &Batch {
                seq,
                pos: n_past,
                tokens: chunk.to_vec(),
            },
        )?;
        n_past += chunk.len() as u32;
    }
    debug!(exec_ctx, prompt_tokens, "prefill complete");

    // Decode loop.
    let mut response: Vec<u8> = Vec::new();
    let mut completion_tokens: usize = 0;
    let mut finish = FinishReason::Length;

    'decode: for _ in 0..max_tokens {
        if Instant::now() > deadline {
            finish = FinishReason::Timeout;
            break;
        }

        let token = state.engine.sampler_sample(slot_sampler, ctx, seq)?;

        if state.engine.is_end_of_generation(model, token) && !ignore_eos {
            finish = FinishReason::Eos;
            break;
        }

        let piece = state.engine.token_to_piece(model, token);
        response.extend_from_slice(&piece);

        for stop in &stops {
            if !stop.is_empty() && response.ends_with(stop.as_bytes()) {
                response.truncate(response.len() - stop.len());
                finish = FinishReason::StopSequence;
                break 'decode;
            }
        }

        if n_past + 1 > capacity {
            if let Some(shifted) = memory.shift(state.engine.as_mut(), ctx, seq, n_past) {
                n_past = shifted;
            }
            if n_past + 1 > capacity {
                finish = FinishReason::ContextFull;
                break;
            }
        }

        state.engine.decode(
            ctx,
            &Batch {
                seq,
                pos: n_past,
                tokens: vec![token],
            },
        )?;
        n_past += 1;
        completion_tokens += 1;

        // Periodic cache maintenance; cheap enough off the per-token path.
        if completion_tokens % 32 == 0 {
            n_past = memory.optimize(state.engine.as_mut(), ctx, seq, n_past);
            if memory.pressure_detected() {
                n_past = memory.handle_pressure(state.engine.as_mut(), ctx, seq, n_past);
            }
        }
    }

    let text = String::from_utf8_lossy(&response).into_owned();
    sessions.append_message(exec_ctx, ChatMessage::new(ChatRole::Assistant, text.clone()))?;
    sessions.set_output(exec_ctx, Bytes::from(text.clone()))?;

    info!(
        exec_ctx,
        prompt_tokens,
        completion_tokens,
        finish = ?finish,
        "completion finished"
    );

    Ok(CompletionOutcome {
        text,
        finish,
        prompt_tokens,
        completion_tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::{MemoryConfig, ModelParams, SamplingParams};
    use crate::engine::stub::StubEngine;
    use crate::engine::Engine;
    use crate::session::store::{SessionCaps, SessionStore};

    fn setup(ctx_size: u32) -> (EngineState, SessionStore, MemoryManager, GenerationDefaults) {
        let mut engine = StubEngine::new();
        let file = std::env::temp_dir().join("nn-gateway-orch-test.gguf");
        std::fs::write(&file, b"stub").unwrap();
        let params = ModelParams {
            ctx_size,
            ..ModelParams::default()
        };
        let model = engine.load_model(&file, &params).unwrap();
        let ctx = engine.create_context(model, &params).unwrap();

        let state = EngineState {
            engine: Box::new(engine),
            model: Some(model),
            ctx: Some(ctx),
            params,
            meta: None,
        };
        let sessions = SessionStore::new(SessionCaps {
            max_sessions: 10,
            max_concurrent: 10,
            idle_timeout: Duration::from_secs(300),
            auto_cleanup: true,
        });
        let memory = MemoryManager::new(MemoryConfig::default());
        (state, sessions, memory, GenerationDefaults::default())
    }

    fn stub(state: &mut EngineState) -> &mut StubEngine {
        state.engine.as_any_mut().downcast_mut().unwrap()
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[test]
    fn test_round_trip_appends_both_turns() {
        let (mut state, sessions, memory, defaults) = setup(2048);
        let (exec_ctx, _) = sessions.open(None, SamplingParams::default()).unwrap();
        stub(&mut state).queue_reply("hello there");

        let out = run(
            &mut state, &sessions, &memory, &defaults, exec_ctx, "hi", None, far_deadline(),
        )
        .unwrap();
        assert_eq!(out.text, "hello there");
        assert_eq!(out.finish, FinishReason::Eos);

        let history = sessions.history(exec_ctx).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, ChatRole::User);
        assert_eq!(history[0].content, "hi");
        assert_eq!(history[1].role, ChatRole::Assistant);
        assert_eq!(history[1].content, "hello there");
    }

    #[test]
    fn test_stop_sequence_truncates() {
        let (mut state, sessions, memory, mut defaults) = setup(2048);
        defaults.stopping.stop = vec!["\n\n".to_string()];
        let (exec_ctx, _) = sessions.open(None, SamplingParams::default()).unwrap();
        stub(&mut state).queue_reply("Hello there END tail");

        let rt = RuntimeParams {
            stop: Some(vec!["END".to_string()]),
            ..RuntimeParams::default()
        };
        let out = run(
            &mut state, &sessions, &memory, &defaults, exec_ctx, "hi", Some(&rt), far_deadline(),
        )
        .unwrap();
        assert_eq!(out.text, "Hello there ");
        assert_eq!(out.finish, FinishReason::StopSequence);
    }

    #[test]
    fn test_max_tokens_budget() {
        let (mut state, sessions, memory, defaults) = setup(2048);
        let (exec_ctx, _) = sessions.open(None, SamplingParams::default()).unwrap();
        stub(&mut state).queue_reply("abcdefghij");

        let rt = RuntimeParams {
            max_tokens: Some(4),
            ..RuntimeParams::default()
        };
        let out = run(
            &mut state, &sessions, &memory, &defaults, exec_ctx, "hi", Some(&rt), far_deadline(),
        )
        .unwrap();
        assert_eq!(out.text, "abcd");
        assert_eq!(out.finish, FinishReason::Length);
    }

    #[test]
    fn test_deadline_returns_partial() {
        let (mut state, sessions, memory, defaults) = setup(2048);
        let (exec_ctx, _) = sessions.open(None, SamplingParams::default()).unwrap();
        {
            let stub = stub(&mut state);
            stub.queue_reply("a".repeat(500));
            stub.set_delay_per_token(Duration::from_millis(5));
        }

        let out = run(
            &mut state,
            &sessions,
            &memory,
            &defaults,
            exec_ctx,
            "hi",
            None,
            Instant::now() + Duration::from_millis(50),
        )
        .unwrap();
        assert_eq!(out.finish, FinishReason::Timeout);
        assert!(!out.text.is_empty());
        assert!(out.text.len() < 500);
    }

    #[test]
    fn test_prompt_too_large() {
        let (mut state, sessions, memory, defaults) = setup(128);
        let (exec_ctx, _) = sessions.open(None, SamplingParams::default()).unwrap();

        let long_prompt = "x".repeat(500);
        let err = run(
            &mut state, &sessions, &memory, &defaults, exec_ctx, &long_prompt, None, far_deadline(),
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::PromptTooLarge { .. }));
    }

    #[test]
    fn test_sampler_reused_when_params_unchanged() {
        let (mut state, sessions, memory, defaults) = setup(2048);
        let (exec_ctx, _) = sessions.open(None, SamplingParams::default()).unwrap();
        stub(&mut state).queue_reply("one");
        stub(&mut state).queue_reply("two");

        run(&mut state, &sessions, &memory, &defaults, exec_ctx, "a", None, far_deadline()).unwrap();
        let first = sessions.sampler(exec_ctx).unwrap().0.unwrap();
        run(&mut state, &sessions, &memory, &defaults, exec_ctx, "b", None, far_deadline()).unwrap();
        let second = sessions.sampler(exec_ctx).unwrap().0.unwrap();
        assert_eq!(first, second);
        assert_eq!(stub(&mut state).live_samplers(), 1);
    }

    #[test]
    fn test_sampler_rebuilt_on_override() {
        let (mut state, sessions, memory, defaults) = setup(2048);
        let (exec_ctx, _) = sessions.open(None, SamplingParams::default()).unwrap();
        stub(&mut state).queue_reply("one");
        stub(&mut state).queue_reply("two");

        run(&mut state, &sessions, &memory, &defaults, exec_ctx, "a", None, far_deadline()).unwrap();
        let first = sessions.sampler(exec_ctx).unwrap().0.unwrap();

        let rt = RuntimeParams {
            temperature: Some(0.0),
            ..RuntimeParams::default()
        };
        run(&mut state, &sessions, &memory, &defaults, exec_ctx, "b", Some(&rt), far_deadline()).unwrap();
        let second = sessions.sampler(exec_ctx).unwrap().0.unwrap();
        assert_ne!(first, second);
        // The replaced sampler was freed.
        assert_eq!(stub(&mut state).live_samplers(), 1);
    }

    #[test]
    fn test_kv_cleared_before_prefill() {
        let (mut state, sessions, memory, defaults) = setup(2048);
        let (exec_ctx, _) = sessions.open(None, SamplingParams::default()).unwrap();
        stub(&mut state).queue_reply("first");
        stub(&mut state).queue_reply("second");

        run(&mut state, &sessions, &memory, &defaults, exec_ctx, "a", None, far_deadline()).unwrap();
        run(&mut state, &sessions, &memory, &defaults, exec_ctx, "b", None, far_deadline()).unwrap();

        // Cells reflect only the second turn's prefill + decode, all
        // contiguous from zero.
        let (_, ctx) = state.loaded().unwrap();
        let cells = stub(&mut state).seq_cells(ctx, exec_ctx);
        assert_eq!(cells[0], 0);
        assert_eq!(*cells.last().unwrap() as usize, cells.len() - 1);
    }
}
