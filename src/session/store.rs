//! The session store: id allocation, caps, idle-timeout and LRU eviction.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{BackendConfig, SamplingParams};
use crate::engine::{ChatMessage, SamplerHandle};
use crate::error::{GatewayError, Result};
use crate::session::ExecCtx;

struct Session {
    session_id: String,
    history: Vec<ChatMessage>,
    last_activity: Instant,
    pending_input: Option<Bytes>,
    last_output: Bytes,
    sampler: Option<SamplerHandle>,
    /// Effective (unresolved) parameters the current sampler was built
    /// from; compared against each request's merge result.
    sampler_params: SamplingParams,
}

/// A session removed by idle-timeout or LRU pressure. The gateway still has
/// to clear its KV sequence and free its sampler.
#[derive(Debug)]
pub struct EvictedSession {
    pub exec_ctx: ExecCtx,
    pub session_id: String,
    pub sampler: Option<SamplerHandle>,
}

/// Result of an explicit close.
#[derive(Debug)]
pub struct ClosedSession {
    pub exec_ctx: ExecCtx,
    pub sampler: Option<SamplerHandle>,
    /// True when this was the last active session; the gateway then clears
    /// the whole KV cache.
    pub store_empty: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    pub sessions: usize,
    pub active: u32,
    pub next_exec_ctx: u64,
}

#[derive(Debug, Clone)]
pub struct SessionCaps {
    pub max_sessions: usize,
    pub max_concurrent: u32,
    pub idle_timeout: Duration,
    pub auto_cleanup: bool,
}

impl From<&BackendConfig> for SessionCaps {
    fn from(cfg: &BackendConfig) -> Self {
        Self {
            max_sessions: cfg.max_sessions as usize,
            max_concurrent: cfg.max_concurrent,
            idle_timeout: Duration::from_millis(cfg.idle_timeout_ms),
            auto_cleanup: cfg.auto_cleanup,
        }
    }
}

struct StoreState {
    sessions: HashMap<ExecCtx, Session>,
    by_id: HashMap<String, ExecCtx>,
    next_exec_ctx: u64,
    active: u32,
}

pub struct SessionStore {
    caps: SessionCaps,
    state: Mutex<StoreState>,
}

impl SessionStore {
    pub fn new(caps: SessionCaps) -> Self {
        Self {
            caps,
            state: Mutex::new(StoreState {
                sessions: HashMap::new(),
                by_id: HashMap::new(),
                next_exec_ctx: 1,
                active: 0,
            }),
        }
    }

    /// Open a session: run auto-cleanup, enforce the concurrency cap,
    /// assign the next exec-ctx. Returns the new id plus any sessions the
    /// cleanup pass evicted (their KV sequences still need clearing).
    pub fn open(
        &self,
        session_id: Option<&str>,
        default_params: SamplingParams,
    ) -> Result<(ExecCtx, Vec<EvictedSession>)> {
        let mut state = self.state.lock().unwrap();
        let mut evicted = self.auto_cleanup(&mut state);

        if state.active + 1 > self.caps.max_concurrent {
            return Err(GatewayError::Capacity(format!(
                "max_concurrent ({}) sessions already active",
                self.caps.max_concurrent
            )));
        }

        let session_id = match session_id {
            Some(id) => {
                if state.by_id.contains_key(id) {
                    return Err(GatewayError::InvalidArgument(format!(
                        "session id {id:?} is already open"
                    )));
                }
                id.to_string()
            }
            None => Uuid::new_v4().to_string(),
        };

        // Opening at max_sessions evicts the oldest to make room.
        if state.sessions.len() >= self.caps.max_sessions {
            let overflow = state.sessions.len() + 1 - self.caps.max_sessions;
            evicted.extend(self.evict_oldest(&mut state, overflow));
        }

        let exec_ctx = state.next_exec_ctx;
        state.next_exec_ctx += 1;

        state.sessions.insert(
            exec_ctx,
            Session {
                session_id: session_id.clone(),
                history: Vec::new(),
                last_activity: Instant::now(),
                pending_input: None,
                last_output: Bytes::new(),
                sampler: None,
                sampler_params: default_params,
            },
        );
        state.by_id.insert(session_id.clone(), exec_ctx);
        state.active += 1;

        info!(exec_ctx, session_id = %session_id, active = state.active, "session opened");
        Ok((exec_ctx, evicted))
    }

    pub fn close(&self, exec_ctx: ExecCtx) -> Result<ClosedSession> {
        let mut state = self.state.lock().unwrap();
        let session = state
            .sessions
            .remove(&exec_ctx)
            .ok_or(GatewayError::NotFound(exec_ctx))?;
        state.by_id.remove(&session.session_id);
        state.active = state.active.saturating_sub(1);

        info!(exec_ctx, active = state.active, "session closed");
        Ok(ClosedSession {
            exec_ctx,
            sampler: session.sampler,
            store_empty: state.active == 0,
        })
    }

    pub fn touch(&self, exec_ctx: ExecCtx) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let session = state
            .sessions
            .get_mut(&exec_ctx)
            .ok_or(GatewayError::NotFound(exec_ctx))?;
        session.last_activity = Instant::now();
        Ok(())
    }

    pub fn exists(&self, exec_ctx: ExecCtx) -> bool {
        self.state.lock().unwrap().sessions.contains_key(&exec_ctx)
    }

    pub fn find(&self, session_id: &str) -> Option<ExecCtx> {
        self.state.lock().unwrap().by_id.get(session_id).copied()
    }

    pub fn append_message(&self, exec_ctx: ExecCtx, message: ChatMessage) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let session = state
            .sessions
            .get_mut(&exec_ctx)
            .ok_or(GatewayError::NotFound(exec_ctx))?;
        session.history.push(message);
        Ok(())
    }

    /// Copy-out of the chat history.
    pub fn history(&self, exec_ctx: ExecCtx) -> Result<Vec<ChatMessage>> {
        let state = self.state.lock().unwrap();
        state
            .sessions
            .get(&exec_ctx)
            .map(|s| s.history.clone())
            .ok_or(GatewayError::NotFound(exec_ctx))
    }

    pub fn set_pending(&self, exec_ctx: ExecCtx, input: Bytes) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let session = state
            .sessions
            .get_mut(&exec_ctx)
            .ok_or(GatewayError::NotFound(exec_ctx))?;
        session.pending_input = Some(input);
        session.last_activity = Instant::now();
        Ok(())
    }

    pub fn take_pending(&self, exec_ctx: ExecCtx) -> Result<Option<Bytes>> {
        let mut state = self.state.lock().unwrap();
        let session = state
            .sessions
            .get_mut(&exec_ctx)
            .ok_or(GatewayError::NotFound(exec_ctx))?;
        Ok(session.pending_input.take())
    }

    pub fn set_output(&self, exec_ctx: ExecCtx, output: Bytes) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let session = state
            .sessions
            .get_mut(&exec_ctx)
            .ok_or(GatewayError::NotFound(exec_ctx))?;
        session.last_output = output;
        Ok(())
    }

    pub fn output(&self, exec_ctx: ExecCtx) -> Result<Bytes> {
        let state = self.state.lock().unwrap();
        state
            .sessions
            .get(&exec_ctx)
            .map(|s| s.last_output.clone())
            .ok_or(GatewayError::NotFound(exec_ctx))
    }

    /// The slot sampler and the parameters it was built from.
    pub fn sampler(&self, exec_ctx: ExecCtx) -> Result<(Option<SamplerHandle>, SamplingParams)> {
        let state = self.state.lock().unwrap();
        state
            .sessions
            .get(&exec_ctx)
            .map(|s| (s.sampler, s.sampler_params.clone()))
            .ok_or(GatewayError::NotFound(exec_ctx))
    }

    /// Install a rebuilt sampler; returns the previous handle for freeing.
    pub fn set_sampler(
        &self,
        exec_ctx: ExecCtx,
        sampler: SamplerHandle,
        params: SamplingParams,
    ) -> Result<Option<SamplerHandle>> {
        let mut state = self.state.lock().unwrap();
        let session = state
            .sessions
            .get_mut(&exec_ctx)
            .ok_or(GatewayError::NotFound(exec_ctx))?;
        let old = session.sampler.replace(sampler);
        session.sampler_params = params;
        Ok(old)
    }

    /// Detach every slot sampler (model swap teardown). Sessions survive;
    /// samplers are rebuilt lazily on their next request.
    pub fn take_all_samplers(&self) -> Vec<SamplerHandle> {
        let mut state = self.state.lock().unwrap();
        state
            .sessions
            .values_mut()
            .filter_map(|s| s.sampler.take())
            .collect()
    }

    /// Wipe the store and restart exec-ctx assignment at 1 (successful
    /// model swap). Returns the removed sessions for KV/sampler cleanup.
    pub fn clear_all(&self) -> Vec<EvictedSession> {
        let mut state = self.state.lock().unwrap();
        let removed: Vec<EvictedSession> = state
            .sessions
            .drain()
            .map(|(exec_ctx, s)| EvictedSession {
                exec_ctx,
                session_id: s.session_id,
                sampler: s.sampler,
            })
            .collect();
        state.by_id.clear();
        state.active = 0;
        state.next_exec_ctx = 1;
        if !removed.is_empty() {
            info!(count = removed.len(), "all sessions cleared");
        }
        removed
    }

    pub fn stats(&self) -> SessionStats {
        let state = self.state.lock().unwrap();
        SessionStats {
            sessions: state.sessions.len(),
            active: state.active,
            next_exec_ctx: state.next_exec_ctx,
        }
    }

    /// Idle-timeout sweep plus LRU eviction down to below `max_sessions`.
    fn auto_cleanup(&self, state: &mut StoreState) -> Vec<EvictedSession> {
        if !self.caps.auto_cleanup {
            return Vec::new();
        }

        let now = Instant::now();
        let idle: Vec<ExecCtx> = state
            .sessions
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_activity) > self.caps.idle_timeout)
            .map(|(&ctx, _)| ctx)
            .collect();

        let mut evicted = Vec::new();
        for ctx in idle {
            if let Some(s) = state.sessions.remove(&ctx) {
                state.by_id.remove(&s.session_id);
                state.active = state.active.saturating_sub(1);
                debug!(exec_ctx = ctx, session_id = %s.session_id, "idle session evicted");
                evicted.push(EvictedSession {
                    exec_ctx: ctx,
                    session_id: s.session_id,
                    sampler: s.sampler,
                });
            }
        }

        if state.sessions.len() >= self.caps.max_sessions {
            let n = state.sessions.len() - self.caps.max_sessions + 1;
            evicted.extend(self.evict_oldest(state, n));
        }
        evicted
    }

    /// Evict `count` sessions, oldest `last_activity` first; ties break on
    /// the smaller exec-ctx so the order is deterministic.
    fn evict_oldest(&self, state: &mut StoreState, count: usize) -> Vec<EvictedSession> {
        let mut candidates: Vec<(Instant, ExecCtx)> = state
            .sessions
            .iter()
            .map(|(&ctx, s)| (s.last_activity, ctx))
            .collect();
        candidates.sort();

        let mut evicted = Vec::with_capacity(count);
        for (_, ctx) in candidates.into_iter().take(count) {
            if let Some(s) = state.sessions.remove(&ctx) {
                state.by_id.remove(&s.session_id);
                state.active = state.active.saturating_sub(1);
                debug!(exec_ctx = ctx, session_id = %s.session_id, "lru session evicted");
                evicted.push(EvictedSession {
                    exec_ctx: ctx,
                    session_id: s.session_id,
                    sampler: s.sampler,
                });
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ChatRole;

    fn caps(max_sessions: usize, max_concurrent: u32) -> SessionCaps {
        SessionCaps {
            max_sessions,
            max_concurrent,
            idle_timeout: Duration::from_secs(300),
            auto_cleanup: true,
        }
    }

    fn open(store: &SessionStore) -> ExecCtx {
        store.open(None, SamplingParams::default()).unwrap().0
    }

    #[test]
    fn test_exec_ctx_monotonic_from_one() {
        let store = SessionStore::new(caps(10, 10));
        assert_eq!(open(&store), 1);
        assert_eq!(open(&store), 2);
        store.close(1).unwrap();
        // Ids are never reused.
        assert_eq!(open(&store), 3);
    }

    #[test]
    fn test_concurrency_cap() {
        let store = SessionStore::new(caps(3, 2));
        let a = open(&store);
        let _b = open(&store);
        let err = store.open(None, SamplingParams::default()).unwrap_err();
        assert!(matches!(err, GatewayError::Capacity(_)));

        store.close(a).unwrap();
        assert!(store.open(None, SamplingParams::default()).is_ok());
    }

    #[test]
    fn test_idle_sessions_swept_on_open() {
        let store = SessionStore::new(SessionCaps {
            idle_timeout: Duration::from_millis(20),
            ..caps(10, 10)
        });
        let stale = open(&store);
        std::thread::sleep(Duration::from_millis(40));

        let (fresh, evicted) = store.open(None, SamplingParams::default()).unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].exec_ctx, stale);
        assert!(!store.exists(stale));
        assert!(store.exists(fresh));
    }

    #[test]
    fn test_lru_eviction_at_max_sessions() {
        let store = SessionStore::new(caps(2, 10));
        let s1 = open(&store);
        std::thread::sleep(Duration::from_millis(5));
        let s2 = open(&store);
        std::thread::sleep(Duration::from_millis(5));
        store.touch(s1).unwrap();

        // s2 now has the oldest activity and is evicted to make room.
        let (s3, evicted) = store.open(None, SamplingParams::default()).unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].exec_ctx, s2);
        assert!(store.exists(s1));
        assert!(store.exists(s3));
    }

    #[test]
    fn test_close_reports_store_empty() {
        let store = SessionStore::new(caps(10, 10));
        let a = open(&store);
        let b = open(&store);

        assert!(!store.close(a).unwrap().store_empty);
        assert!(store.close(b).unwrap().store_empty);
    }

    #[test]
    fn test_duplicate_session_id_rejected() {
        let store = SessionStore::new(caps(10, 10));
        store.open(Some("alpha"), SamplingParams::default()).unwrap();
        let err = store.open(Some("alpha"), SamplingParams::default()).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidArgument(_)));
    }

    #[test]
    fn test_history_copy_out() {
        let store = SessionStore::new(caps(10, 10));
        let ctx = open(&store);
        store
            .append_message(ctx, ChatMessage::new(ChatRole::User, "hi"))
            .unwrap();
        store
            .append_message(ctx, ChatMessage::new(ChatRole::Assistant, "hello"))
            .unwrap();

        let history = store.history(ctx).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, ChatRole::User);
        assert_eq!(history[1].role, ChatRole::Assistant);
    }

    #[test]
    fn test_clear_all_resets_exec_ctx() {
        let store = SessionStore::new(caps(10, 10));
        open(&store);
        open(&store);
        let removed = store.clear_all();
        assert_eq!(removed.len(), 2);
        assert_eq!(store.stats().sessions, 0);
        assert_eq!(open(&store), 1);
    }

    #[test]
    fn test_missing_session_is_not_found() {
        let store = SessionStore::new(caps(10, 10));
        assert!(matches!(store.touch(42), Err(GatewayError::NotFound(42))));
        assert!(matches!(store.close(42), Err(GatewayError::NotFound(42))));
    }
}
