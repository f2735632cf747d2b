//! The single background worker that owns the decode path.
//!
//! It dequeues continuously, checks that the task's session still exists
//! (close invalidates queued work), drives the orchestrator, and answers
//! through the task's completion channel. A failing task never takes the
//! loop down with it.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::EngineState;
use crate::error::GatewayError;
use crate::infer::{orchestrator, GenerationDefaults};
use crate::memory::MemoryManager;
use crate::scheduler::{Task, TaskOutcome, TaskQueue, TaskState};
use crate::session::SessionStore;

/// Everything the worker needs to run tasks.
pub(crate) struct WorkerContext {
    pub queue: Arc<TaskQueue>,
    pub engine: Arc<tokio::sync::Mutex<EngineState>>,
    pub sessions: Arc<SessionStore>,
    pub memory: Arc<MemoryManager>,
    pub defaults: Arc<Mutex<GenerationDefaults>>,
}

pub(crate) fn spawn(wctx: WorkerContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("inference worker started");
        while let Some(mut task) = wctx.queue.dequeue().await {
            wctx.queue.set_busy(true);
            let outcome = run_one(&wctx, &mut task).await;
            wctx.queue.mark_completed();

            match &outcome {
                Ok(body) => debug!(task = task.id, bytes = body.len(), "task completed"),
                Err(e) => warn!(task = task.id, error = %e, "task failed"),
            }
            task.state = TaskState::Completed;
            if let Some(tx) = task.responder.take() {
                let _ = tx.send(outcome);
            }
            wctx.queue.set_busy(false);
        }

        // Shutdown: drain without processing.
        for mut task in wctx.queue.drain() {
            if let Some(tx) = task.responder.take() {
                let _ = tx.send(Err(GatewayError::SessionClosed));
            }
        }
        info!("inference worker stopped");
    })
}

async fn run_one(wctx: &WorkerContext, task: &mut Task) -> TaskOutcome {
    // A closed session invalidates its outstanding tasks.
    if !wctx.sessions.exists(task.exec_ctx) {
        return Err(GatewayError::SessionClosed);
    }

    let prompt = String::from_utf8_lossy(&task.prompt).into_owned();
    let defaults = wctx.defaults.lock().unwrap().clone();

    let mut engine = wctx.engine.lock().await;
    let outcome = orchestrator::run(
        &mut engine,
        &wctx.sessions,
        &wctx.memory,
        &defaults,
        task.exec_ctx,
        &prompt,
        task.runtime.as_ref(),
        task.timeout_at,
    )?;

    Ok(Bytes::from(outcome.text))
}
