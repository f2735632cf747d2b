//! Model loading and hot-swap.
//!
//! A swap is a compound operation behind a single lock: quiesce the queue,
//! snapshot the current parameters, tear the engine state down, try the new
//! model, and on failure restore the old one. Sessions are wiped only when
//! the new model actually loads; a failed swap leaves them untouched. When
//! both the new and the backup load fail the backend goes `Unrecoverable`.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::config::{Config, ModelParams};
use crate::engine::{EngineState, ModelMeta};
use crate::error::{GatewayError, Result};
use crate::gateway::{BackendCondition, GatewayInner};
use crate::infer::GenerationDefaults;

/// Best-effort wait for queued and in-flight work to end.
async fn quiesce(inner: &GatewayInner) {
    let deadline = Instant::now() + inner.swap_grace;
    loop {
        if inner.queue.is_idle() {
            return;
        }
        if Instant::now() >= deadline {
            warn!(
                queued = inner.queue.current_size(),
                "quiesce grace period elapsed, proceeding with swap"
            );
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Load a model and context into the engine state. On context failure the
/// model is freed again so no handle leaks.
fn load_into(state: &mut EngineState, path: &Path, params: &ModelParams) -> Result<ModelMeta> {
    let model = state.engine.load_model(path, params)?;
    let ctx = match state.engine.create_context(model, params) {
        Ok(ctx) => ctx,
        Err(e) => {
            state.engine.free_model(model);
            return Err(e.into());
        }
    };
    state
        .engine
        .attach_threadpool(ctx, params.threads as i32, params.threads_batch as i32);

    let meta = ModelMeta::probe(state.engine.as_ref(), model, path)?;
    state.model = Some(model);
    state.ctx = Some(ctx);

    info!(
        model = %meta.name,
        architecture = %meta.architecture,
        vocab = meta.vocab_size,
        trained_ctx = meta.trained_ctx,
        version = %meta.version,
        "model loaded"
    );
    Ok(meta)
}

/// The full current configuration, reconstructed from the immutable init
/// config plus the swappable model/sampling/stopping state.
fn current_config(inner: &GatewayInner, state: &EngineState) -> Config {
    let defaults = inner.defaults.lock().unwrap();
    Config {
        backend: inner.config.backend.clone(),
        model: state.params.clone(),
        sampling: defaults.sampling.clone(),
        stopping: defaults.stopping.clone(),
        memory: inner.config.memory.clone(),
        logging: inner.config.logging.clone(),
        performance: inner.config.performance.clone(),
    }
}

fn install_defaults(inner: &GatewayInner, cfg: &Config) {
    *inner.defaults.lock().unwrap() = GenerationDefaults {
        sampling: cfg.sampling.clone(),
        stopping: cfg.stopping.clone(),
    };
}

/// First-time model load: no teardown, no session wipe, nothing to roll
/// back to.
pub(crate) async fn initial_load(inner: &GatewayInner, path: &Path, config_json: Option<&str>) -> Result<()> {
    let _guard = inner.swap_lock.try_lock().map_err(|_| GatewayError::Busy)?;

    let mut state = inner.engine.lock().await;
    if state.model.is_some() {
        // Raced with another load; treat as a swap request.
        return Err(GatewayError::Busy);
    }

    let new_cfg = match config_json {
        Some(json) => current_config(inner, &state).layered(json)?,
        None => current_config(inner, &state),
    };

    let meta = load_into(&mut state, path, &new_cfg.model)
        .map_err(|e| GatewayError::ModelLoadFailed(e.to_string()))?;
    state.params = new_cfg.model.clone();
    state.meta = Some(meta);
    install_defaults(inner, &new_cfg);
    Ok(())
}

/// Replace the loaded model, rolling back to the previous one on failure.
pub(crate) async fn swap_model(inner: &GatewayInner, path: &Path, config_json: Option<&str>) -> Result<()> {
    let _guard = inner.swap_lock.try_lock().map_err(|_| GatewayError::Busy)?;

    inner.swapping.store(true, Ordering::SeqCst);
    let result = do_swap(inner, path, config_json).await;
    inner.swapping.store(false, Ordering::SeqCst);
    result
}

async fn do_swap(inner: &GatewayInner, path: &Path, config_json: Option<&str>) -> Result<()> {
    quiesce(inner).await;

    let mut state = inner.engine.lock().await;

    // Snapshot for rollback, and parse the new configuration before any
    // teardown so a bad document cannot leave the backend modelless.
    let backup_params = state.params.clone();
    let backup_meta = state
        .meta
        .clone()
        .ok_or_else(|| GatewayError::InvalidArgument("no model loaded".into()))?;
    let new_cfg = match config_json {
        Some(json) => current_config(inner, &state).layered(json)?,
        None => current_config(inner, &state),
    };

    info!(from = %backup_meta.name, to = %path.display(), "model swap starting");

    // Teardown: slot samplers, KV cache, context, model.
    for sampler in inner.sessions.take_all_samplers() {
        state.engine.sampler_free(sampler);
    }
    if let Some(ctx) = state.ctx.take() {
        state.engine.kv_clear(ctx, true);
        state.engine.free_context(ctx);
    }
    if let Some(model) = state.model.take() {
        state.engine.free_model(model);
    }
    state.meta = None;

    match load_into(&mut state, path, &new_cfg.model) {
        Ok(meta) => {
            state.params = new_cfg.model.clone();
            state.meta = Some(meta);
            install_defaults(inner, &new_cfg);

            // All conversational state belongs to the old model.
            let removed = inner.sessions.clear_all();
            info!(sessions_dropped = removed.len(), "model swap complete");
            Ok(())
        }
        Err(swap_err) => {
            warn!(error = %swap_err, "new model failed to load, restoring previous model");
            match load_into(&mut state, &backup_meta.path, &backup_params) {
                Ok(meta) => {
                    state.params = backup_params;
                    state.meta = Some(meta);
                    info!(model = %backup_meta.name, "previous model restored");
                    Err(GatewayError::ModelLoadFailed(swap_err.to_string()))
                }
                Err(restore_err) => {
                    error!(
                        swap_error = %swap_err,
                        restore_error = %restore_err,
                        "both new and backup model loads failed"
                    );
                    *inner.condition.lock().unwrap() = BackendCondition::Unrecoverable;
                    Err(GatewayError::ModelLoadFailed(format!(
                        "{swap_err}; recovery also failed: {restore_err}"
                    )))
                }
            }
        }
    }
}
