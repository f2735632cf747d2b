//! The bounded three-level task queue.
//!
//! Urgent, normal (High folds in) and low tasks each keep FIFO order within
//! their level. Admission is bounded by `min(queue_size,
//! queue_reject_threshold)`; the warning threshold is advisory. A single
//! `Notify` is the only wake-up path for the worker, and a `running` flag
//! doubles as the shutdown sentinel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

use crate::config::{BackendConfig, RuntimeParams};
use crate::error::GatewayError;
use crate::scheduler::{Priority, Task, TaskId, TaskOutcome, TaskState};
use crate::session::ExecCtx;

#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Enforced admission cap: `min(queue_size, queue_reject_threshold)`.
    pub max_size: usize,
    pub warning_threshold: usize,
    pub task_timeout: Duration,
    pub priority_enabled: bool,
    pub fair_enabled: bool,
    /// Consecutive same-level pops before a non-empty lower level gets one.
    pub fairness_window: u32,
    pub auto_cleanup: bool,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from(&BackendConfig::default())
    }
}

impl From<&BackendConfig> for QueueSettings {
    fn from(cfg: &BackendConfig) -> Self {
        Self {
            max_size: cfg.queue_size.min(cfg.queue_reject_threshold) as usize,
            warning_threshold: cfg.queue_warning_threshold as usize,
            task_timeout: Duration::from_millis(cfg.default_task_timeout_ms),
            priority_enabled: cfg.priority_scheduling_enabled,
            fair_enabled: cfg.fair_scheduling_enabled,
            fairness_window: 4,
            auto_cleanup: cfg.auto_queue_cleanup,
        }
    }
}

/// Queue accounting snapshot. `accepted` counts every enqueue attempt, so
/// `accepted == completed + expired + rejected + current_size + running`.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub accepted: u64,
    pub completed: u64,
    pub expired: u64,
    pub rejected: u64,
    pub current_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Urgent,
    Normal,
    Low,
}

struct QueueState {
    urgent: VecDeque<Task>,
    normal: VecDeque<Task>,
    low: VecDeque<Task>,
    /// False once shutdown starts; the dequeue loop then returns `None`.
    running: bool,
    /// Fairness rotation state: the level of the last pop and how many
    /// consecutive pops it has had.
    last_level: Option<Level>,
    consecutive: u32,
}

impl QueueState {
    fn len(&self) -> usize {
        self.urgent.len() + self.normal.len() + self.low.len()
    }

    fn deque(&mut self, level: Level) -> &mut VecDeque<Task> {
        match level {
            Level::Urgent => &mut self.urgent,
            Level::Normal => &mut self.normal,
            Level::Low => &mut self.low,
        }
    }

    fn first_nonempty(&self) -> Option<Level> {
        if !self.urgent.is_empty() {
            Some(Level::Urgent)
        } else if !self.normal.is_empty() {
            Some(Level::Normal)
        } else if !self.low.is_empty() {
            Some(Level::Low)
        } else {
            None
        }
    }

    /// Highest non-empty level strictly below `level`.
    fn lower_nonempty(&self, level: Level) -> Option<Level> {
        match level {
            Level::Urgent if !self.normal.is_empty() => Some(Level::Normal),
            Level::Urgent if !self.low.is_empty() => Some(Level::Low),
            Level::Normal if !self.low.is_empty() => Some(Level::Low),
            _ => None,
        }
    }
}

pub struct TaskQueue {
    settings: QueueSettings,
    state: Mutex<QueueState>,
    notify: Notify,
    next_task_id: AtomicU64,
    accepted: AtomicU64,
    completed: AtomicU64,
    expired: AtomicU64,
    rejected: AtomicU64,
    /// Set by the worker around each task so quiesce can see in-flight work.
    busy: AtomicBool,
}

impl TaskQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(QueueState {
                urgent: VecDeque::new(),
                normal: VecDeque::new(),
                low: VecDeque::new(),
                running: true,
                last_level: None,
                consecutive: 0,
            }),
            notify: Notify::new(),
            next_task_id: AtomicU64::new(1),
            accepted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            busy: AtomicBool::new(false),
        }
    }

    /// Admit a task. Returns its id and the completion channel, or
    /// `Capacity` when the queue is full.
    pub fn enqueue(
        &self,
        exec_ctx: ExecCtx,
        prompt: Bytes,
        runtime: Option<RuntimeParams>,
        priority: Priority,
    ) -> crate::error::Result<(TaskId, oneshot::Receiver<TaskOutcome>)> {
        self.accepted.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock().unwrap();
        if !state.running {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(GatewayError::Capacity("queue is shut down".into()));
        }
        if self.settings.auto_cleanup {
            self.sweep_expired(&mut state, Instant::now());
        }

        let size = state.len();
        if size >= self.settings.max_size {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(GatewayError::Capacity(format!(
                "task queue full ({size} queued)"
            )));
        }
        if size >= self.settings.warning_threshold {
            warn!(size, threshold = self.settings.warning_threshold, "task queue above warning threshold");
        }

        let priority = if self.settings.priority_enabled {
            priority
        } else {
            Priority::Normal
        };

        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let (tx, rx) = oneshot::channel();
        let task = Task {
            id,
            exec_ctx,
            priority,
            created_at: now,
            timeout_at: now + self.settings.task_timeout,
            prompt,
            runtime,
            state: TaskState::Queued,
            responder: Some(tx),
        };

        let level = match priority {
            Priority::Urgent => Level::Urgent,
            Priority::High | Priority::Normal => Level::Normal,
            Priority::Low => Level::Low,
        };
        state.deque(level).push_back(task);
        debug!(task = id, ?priority, size = state.len(), "task enqueued");
        drop(state);

        self.notify.notify_one();
        Ok((id, rx))
    }

    /// Block until a task is available or shutdown. Expired tasks are swept
    /// on every wake-up before a level is chosen.
    pub async fn dequeue(&self) -> Option<Task> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                self.sweep_expired(&mut state, Instant::now());
                if !state.running {
                    return None;
                }
                if let Some(mut task) = self.pick(&mut state) {
                    task.state = TaskState::Running;
                    return Some(task);
                }
            }
            self.notify.notified().await;
        }
    }

    fn pick(&self, state: &mut QueueState) -> Option<Task> {
        let highest = state.first_nonempty()?;

        let chosen = if self.settings.fair_enabled
            && state.last_level == Some(highest)
            && state.consecutive >= self.settings.fairness_window
        {
            state.lower_nonempty(highest).unwrap_or(highest)
        } else {
            highest
        };

        if state.last_level == Some(chosen) {
            state.consecutive += 1;
        } else {
            state.last_level = Some(chosen);
            state.consecutive = 1;
        }

        state.deque(chosen).pop_front()
    }

    /// Drop tasks whose deadline passed while queued; their callers get a
    /// `Timeout` error.
    fn sweep_expired(&self, state: &mut QueueState, now: Instant) {
        for level in [Level::Urgent, Level::Normal, Level::Low] {
            let deque = state.deque(level);
            let before = deque.len();
            let mut kept = VecDeque::with_capacity(before);
            for mut task in deque.drain(..) {
                if now > task.timeout_at {
                    task.state = TaskState::Expired;
                    self.expired.fetch_add(1, Ordering::Relaxed);
                    debug!(task = task.id, "task expired in queue");
                    if let Some(tx) = task.responder.take() {
                        let _ = tx.send(Err(GatewayError::Timeout(task.id)));
                    }
                } else {
                    kept.push_back(task);
                }
            }
            *state.deque(level) = kept;
        }
    }

    /// Stop admitting and wake the worker so it can exit and drain.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.running = false;
        drop(state);
        self.notify.notify_one();
        self.notify.notify_waiters();
    }

    /// Remove every queued task (used by the worker after shutdown).
    pub fn drain(&self) -> Vec<Task> {
        let mut state = self.state.lock().unwrap();
        let mut all = Vec::with_capacity(state.len());
        for level in [Level::Urgent, Level::Normal, Level::Low] {
            all.extend(state.deque(level).drain(..));
        }
        all
    }

    pub fn current_size(&self) -> usize {
        self.state.lock().unwrap().len()
    }

    pub fn is_idle(&self) -> bool {
        self.current_size() == 0 && !self.busy.load(Ordering::Acquire)
    }

    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Release);
    }

    pub fn worker_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn mark_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            current_size: self.current_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> QueueSettings {
        QueueSettings {
            max_size: 10,
            warning_threshold: 8,
            task_timeout: Duration::from_secs(30),
            priority_enabled: true,
            fair_enabled: false,
            fairness_window: 4,
            auto_cleanup: true,
        }
    }

    fn push(queue: &TaskQueue, priority: Priority) -> TaskId {
        let (id, _rx) = queue
            .enqueue(1, Bytes::from_static(b"x"), None, priority)
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_fifo_within_level() {
        let queue = TaskQueue::new(settings());
        let a = push(&queue, Priority::Normal);
        let b = push(&queue, Priority::Normal);

        assert_eq!(queue.dequeue().await.unwrap().id, a);
        assert_eq!(queue.dequeue().await.unwrap().id, b);
    }

    #[tokio::test]
    async fn test_strict_priority_order() {
        let queue = TaskQueue::new(settings());
        let low = push(&queue, Priority::Low);
        let normal = push(&queue, Priority::Normal);
        let urgent = push(&queue, Priority::Urgent);
        let high = push(&queue, Priority::High);

        assert_eq!(queue.dequeue().await.unwrap().id, urgent);
        // High folds into the normal level, FIFO after the earlier Normal.
        assert_eq!(queue.dequeue().await.unwrap().id, normal);
        assert_eq!(queue.dequeue().await.unwrap().id, high);
        assert_eq!(queue.dequeue().await.unwrap().id, low);
    }

    #[tokio::test]
    async fn test_fairness_rotation() {
        let mut cfg = settings();
        cfg.fair_enabled = true;
        cfg.max_size = 20;
        let queue = TaskQueue::new(cfg);

        for _ in 0..5 {
            push(&queue, Priority::Normal);
        }
        push(&queue, Priority::Urgent);
        for _ in 0..4 {
            push(&queue, Priority::Low);
        }

        let mut order = Vec::new();
        for _ in 0..10 {
            order.push(queue.dequeue().await.unwrap().priority);
        }
        use Priority::*;
        assert_eq!(
            order,
            vec![Urgent, Normal, Normal, Normal, Normal, Low, Normal, Low, Low, Low]
        );
    }

    #[tokio::test]
    async fn test_rejection_at_cap() {
        let queue = TaskQueue::new(settings());
        for _ in 0..10 {
            push(&queue, Priority::Normal);
        }
        let err = queue
            .enqueue(1, Bytes::from_static(b"x"), None, Priority::Normal)
            .unwrap_err();
        assert!(matches!(err, GatewayError::Capacity(_)));
        assert_eq!(queue.stats().rejected, 1);
        assert_eq!(queue.stats().current_size, 10);
    }

    #[tokio::test]
    async fn test_priority_disabled_coerces_to_normal() {
        let mut cfg = settings();
        cfg.priority_enabled = false;
        let queue = TaskQueue::new(cfg);

        let first = push(&queue, Priority::Low);
        let second = push(&queue, Priority::Urgent);
        assert_eq!(queue.dequeue().await.unwrap().id, first);
        assert_eq!(queue.dequeue().await.unwrap().id, second);
    }

    #[tokio::test]
    async fn test_expiry_sweep() {
        let mut cfg = settings();
        cfg.task_timeout = Duration::from_millis(10);
        let queue = TaskQueue::new(cfg);

        let (_, mut rx) = queue
            .enqueue(1, Bytes::from_static(b"x"), None, Priority::Normal)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Wake-up sweeps before picking; the queue is then empty.
        queue.shutdown();
        assert!(queue.dequeue().await.is_none());
        assert_eq!(queue.stats().expired, 1);
        assert!(matches!(rx.try_recv().unwrap(), Err(GatewayError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_shutdown_returns_none() {
        let queue = std::sync::Arc::new(TaskQueue::new(settings()));
        let q = queue.clone();
        let waiter = tokio::spawn(async move { q.dequeue().await.is_none() });
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.shutdown();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_accounting_invariant() {
        let queue = TaskQueue::new(settings());
        for _ in 0..10 {
            push(&queue, Priority::Normal);
        }
        let _ = queue.enqueue(1, Bytes::from_static(b"x"), None, Priority::Normal);
        let _task = queue.dequeue().await.unwrap();
        queue.mark_completed();

        let stats = queue.stats();
        assert_eq!(
            stats.accepted,
            stats.completed + stats.expired + stats.rejected + stats.current_size as u64
        );
    }
}
