//! The public gateway API.
//!
//! [`Gateway`] is the single owned root of the backend: configuration,
//! engine state, session store, memory manager, task queue, and the worker
//! task. There are no process-wide singletons; dropping every clone of the
//! handle after [`Gateway::shutdown`] releases everything.

pub mod swap;
pub mod tensor;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{Config, LoggingConfig, RuntimeParams};
use crate::engine::{EngineState, ModelMeta, StubEngine};
use crate::engine::Engine;
use crate::error::{GatewayError, Result};
use crate::infer::{sampler, GenerationDefaults};
use crate::memory::{MemoryManager, MemoryStats};
use crate::scheduler::worker::{self, WorkerContext};
use crate::scheduler::{Priority, QueueSettings, QueueStats, TaskQueue};
use crate::session::store::SessionCaps;
use crate::session::{ExecCtx, SessionStats, SessionStore};

pub use tensor::{Tensor, TensorType};

/// Whether the backend can still serve requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendCondition {
    Ready,
    /// Both model loads failed during a swap; only `shutdown` is useful now.
    Unrecoverable,
}

/// Result of a `compute` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeStatus {
    /// The request ran to completion; the output is ready.
    Completed,
    /// Capacity was saturated; the task is queued and the output will land
    /// in the session once the worker gets to it.
    Queued,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GatewayStats {
    pub queue: QueueStats,
    pub sessions: SessionStats,
    pub memory: MemoryStats,
}

pub(crate) struct GatewayInner {
    pub config: Config,
    pub defaults: Arc<Mutex<GenerationDefaults>>,
    pub engine: Arc<tokio::sync::Mutex<EngineState>>,
    pub sessions: Arc<SessionStore>,
    pub memory: Arc<MemoryManager>,
    pub queue: Arc<TaskQueue>,
    pub worker: Mutex<Option<JoinHandle<()>>>,
    pub swap_lock: tokio::sync::Mutex<()>,
    pub swapping: AtomicBool,
    pub condition: Mutex<BackendCondition>,
    pub swap_grace: Duration,
}

/// The backend handle. Cheap to clone; all clones share one backend.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    /// Initialize a backend with the stub engine. Must be called inside a
    /// tokio runtime (the worker task is spawned here).
    ///
    /// An unparseable configuration document is logged and ignored;
    /// defaults remain in effect.
    pub fn new(config_json: Option<&str>) -> Result<Self> {
        Self::with_engine(config_json, Box::new(StubEngine::new()))
    }

    /// Initialize a backend around a caller-supplied engine.
    pub fn with_engine(config_json: Option<&str>, engine: Box<dyn Engine>) -> Result<Self> {
        let config = match config_json {
            None => Config::default(),
            Some(json) => match Config::from_json(json) {
                Ok(cfg) => cfg,
                Err(e) => {
                    init_logging(&LoggingConfig::default());
                    warn!(error = %e, "configuration unparseable, using defaults");
                    Config::default()
                }
            },
        };
        init_logging(&config.logging);

        let sessions = Arc::new(SessionStore::new(SessionCaps::from(&config.backend)));
        let queue = Arc::new(TaskQueue::new(QueueSettings::from(&config.backend)));
        let memory = Arc::new(MemoryManager::new(config.memory.clone()));
        let defaults = Arc::new(Mutex::new(GenerationDefaults {
            sampling: config.sampling.clone(),
            stopping: config.stopping.clone(),
        }));
        let mut engine_state = EngineState::new(engine);
        engine_state.params = config.model.clone();
        let engine = Arc::new(tokio::sync::Mutex::new(engine_state));

        let worker = worker::spawn(WorkerContext {
            queue: queue.clone(),
            engine: engine.clone(),
            sessions: sessions.clone(),
            memory: memory.clone(),
            defaults: defaults.clone(),
        });

        info!(
            max_sessions = config.backend.max_sessions,
            max_concurrent = config.backend.max_concurrent,
            queue_size = config.backend.queue_size,
            "gateway initialized"
        );

        Ok(Self {
            inner: Arc::new(GatewayInner {
                config,
                defaults,
                engine,
                sessions,
                memory,
                queue,
                worker: Mutex::new(Some(worker)),
                swap_lock: tokio::sync::Mutex::new(()),
                swapping: AtomicBool::new(false),
                condition: Mutex::new(BackendCondition::Ready),
                swap_grace: Duration::from_secs(30),
            }),
        })
    }

    /// Deinitialize: stop the worker, join it, free engine resources.
    pub async fn shutdown(self) -> Result<()> {
        self.inner.queue.shutdown();
        let handle = self.inner.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let mut state = self.inner.engine.lock().await;
        for sampler in self.inner.sessions.take_all_samplers() {
            state.engine.sampler_free(sampler);
        }
        self.inner.sessions.clear_all();
        if let Some(ctx) = state.ctx.take() {
            state.engine.kv_clear(ctx, true);
            state.engine.free_context(ctx);
        }
        if let Some(model) = state.model.take() {
            state.engine.free_model(model);
        }
        state.meta = None;

        info!("gateway deinitialized");
        Ok(())
    }

    /// Load a model. The first call performs the initial load; later calls
    /// hot-swap (quiesce, teardown, load, rollback on failure).
    pub async fn load_model(&self, path: impl AsRef<Path>, config_json: Option<&str>) -> Result<()> {
        self.ensure_recoverable()?;
        let loaded = self.inner.engine.lock().await.model.is_some();
        if loaded {
            swap::swap_model(&self.inner, path.as_ref(), config_json).await
        } else {
            swap::initial_load(&self.inner, path.as_ref(), config_json).await
        }
    }

    /// Open a session, evicting idle/LRU sessions as configured. The new
    /// slot gets a sampler built from the current defaults.
    pub async fn open_session(&self, session_id: Option<&str>) -> Result<ExecCtx> {
        self.ensure_ready()?;
        let default_params = self.inner.defaults.lock().unwrap().sampling.clone();
        let (exec_ctx, evicted) = self.inner.sessions.open(session_id, default_params.clone())?;

        let mut state = self.inner.engine.lock().await;
        if let Some(ctx) = state.ctx {
            for ev in &evicted {
                self.inner.memory.clear(state.engine.as_mut(), ctx, ev.exec_ctx);
                if let Some(s) = ev.sampler {
                    state.engine.sampler_free(s);
                }
            }
        }

        if let (Some(model), Some(ctx)) = (state.model, state.ctx) {
            let capacity = state.engine.ctx_capacity(ctx);
            match sampler::build(state.engine.as_mut(), model, capacity, &default_params) {
                Ok(handle) => {
                    self.inner.sessions.set_sampler(exec_ctx, handle, default_params)?;
                }
                Err(e) => {
                    let _ = self.inner.sessions.close(exec_ctx);
                    return Err(e);
                }
            }
        }
        Ok(exec_ctx)
    }

    /// Close a session and release its KV sequence. Permitted during a
    /// swap, where it touches only the session store.
    pub async fn close_session(&self, exec_ctx: ExecCtx) -> Result<()> {
        let closed = self.inner.sessions.close(exec_ctx)?;
        if self.inner.swapping.load(Ordering::SeqCst) {
            // The swap clears all engine state anyway.
            return Ok(());
        }

        let mut state = self.inner.engine.lock().await;
        if let Some(ctx) = state.ctx {
            self.inner.memory.clear(state.engine.as_mut(), ctx, closed.exec_ctx);
            if let Some(s) = closed.sampler {
                state.engine.sampler_free(s);
            }
            if closed.store_empty {
                self.inner.memory.clear_all(state.engine.as_mut(), ctx);
            }
        }
        Ok(())
    }

    /// Store the tensor's text as the session's pending prompt.
    pub fn set_input(&self, exec_ctx: ExecCtx, tensor: &Tensor<'_>) -> Result<()> {
        let text = tensor.read_text()?;
        self.inner.sessions.set_pending(exec_ctx, text)
    }

    /// Run the pending prompt. Under capacity the call drives the request
    /// to completion; when saturated the task is queued and the call
    /// returns immediately.
    pub async fn compute(&self, exec_ctx: ExecCtx) -> Result<ComputeStatus> {
        self.ensure_ready()?;
        let prompt = self
            .inner
            .sessions
            .take_pending(exec_ctx)?
            .ok_or_else(|| GatewayError::InvalidArgument("no input set for execution context".into()))?;

        let saturated = !self.inner.queue.is_idle();
        let (_id, rx) = self.inner.queue.enqueue(exec_ctx, prompt, None, Priority::Normal)?;
        if saturated {
            return Ok(ComputeStatus::Queued);
        }
        match rx.await {
            Ok(outcome) => {
                outcome?;
                Ok(ComputeStatus::Completed)
            }
            Err(_) => Err(GatewayError::SessionClosed),
        }
    }

    /// Copy the last completed response into `buffer`; returns the number
    /// of bytes written.
    pub fn get_output(&self, exec_ctx: ExecCtx, buffer: &mut [u8]) -> Result<usize> {
        let output = self.inner.sessions.output(exec_ctx)?;
        let n = output.len().min(buffer.len());
        buffer[..n].copy_from_slice(&output[..n]);
        Ok(n)
    }

    /// set_input + compute + get_output in one call, with per-request
    /// runtime parameters. Waits for completion even when queued behind
    /// other work.
    pub async fn run_inference(
        &self,
        exec_ctx: ExecCtx,
        input: &Tensor<'_>,
        output: &mut [u8],
        runtime_json: Option<&str>,
    ) -> Result<usize> {
        self.ensure_ready()?;
        if !self.inner.sessions.exists(exec_ctx) {
            return Err(GatewayError::NotFound(exec_ctx));
        }

        let runtime = match runtime_json {
            Some(json) => Some(RuntimeParams::from_json(json)?),
            None => None,
        };
        let priority = runtime
            .as_ref()
            .and_then(|rt| rt.priority)
            .unwrap_or(Priority::Normal);
        let prompt = input.read_text()?;

        let (_id, rx) = self.inner.queue.enqueue(exec_ctx, prompt, runtime, priority)?;
        let body = match rx.await {
            Ok(outcome) => outcome?,
            Err(_) => return Err(GatewayError::SessionClosed),
        };

        let n = body.len().min(output.len());
        output[..n].copy_from_slice(&body[..n]);
        Ok(n)
    }

    /// Metadata recorded when the current model was loaded.
    pub async fn model_meta(&self) -> Option<ModelMeta> {
        self.inner.engine.lock().await.meta.clone()
    }

    pub fn condition(&self) -> BackendCondition {
        *self.inner.condition.lock().unwrap()
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            queue: self.inner.queue.stats(),
            sessions: self.inner.sessions.stats(),
            memory: self.inner.memory.stats(),
        }
    }

    fn ensure_recoverable(&self) -> Result<()> {
        match *self.inner.condition.lock().unwrap() {
            BackendCondition::Unrecoverable => Err(GatewayError::Unrecoverable),
            BackendCondition::Ready => Ok(()),
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        self.ensure_recoverable()?;
        if self.inner.swapping.load(Ordering::SeqCst) {
            return Err(GatewayError::Busy);
        }
        Ok(())
    }
}

/// Configure the global tracing subscriber from the logging section.
/// Idempotent: later calls (or an already-installed subscriber) are no-ops.
fn init_logging(cfg: &LoggingConfig) {
    let level = if cfg.enable_debug {
        "debug"
    } else {
        cfg.level.as_filter()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("nn_gateway={level}").into());

    match &cfg.file {
        Some(path) => match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                let builder = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file));
                let _ = if cfg.timestamps {
                    builder.try_init()
                } else {
                    builder.without_time().try_init()
                };
            }
            Err(e) => {
                let builder = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_target(true)
                    .with_ansi(cfg.colors);
                let _ = builder.try_init();
                warn!(file = %path.display(), error = %e, "log file unavailable, logging to console");
            }
        },
        None => {
            let builder = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_ansi(cfg.colors);
            let _ = if cfg.timestamps {
                builder.try_init()
            } else {
                builder.without_time().try_init()
            };
        }
    }
}
