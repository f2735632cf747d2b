//! Context shifting, partial KV-cache eviction, and memory-pressure
//! handling.
//!
//! The manager acts on an `(engine context, sequence)` pair and never touches
//! session state. `n_past`, the logical number of cached tokens for a
//! sequence, is tracked by the caller from decode arithmetic, so it is
//! monotonic in actual usage and can only undercount the engine's true cell
//! count.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use crate::config::{CacheStrategy, MemoryConfig};
use crate::engine::{ContextHandle, Engine, SeqId};

/// Cache maintenance counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStats {
    /// Times `optimize` found the sequence over budget and evicted.
    pub cache_hits: u64,
    /// Times `optimize` found the sequence within budget.
    pub cache_misses: u64,
}

pub struct MemoryManager {
    policy: MemoryConfig,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl MemoryManager {
    pub fn new(policy: MemoryConfig) -> Self {
        Self {
            policy,
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &MemoryConfig {
        &self.policy
    }

    /// Drop every cell of one sequence.
    pub fn clear(&self, engine: &mut dyn Engine, ctx: ContextHandle, seq: SeqId) {
        engine.kv_seq_remove(ctx, seq, -1, -1);
        debug!(seq, "cleared sequence kv cache");
    }

    /// Drop the whole cache, all sequences.
    pub fn clear_all(&self, engine: &mut dyn Engine, ctx: ContextHandle) {
        engine.kv_clear(ctx, true);
        info!("cleared kv cache for all sequences");
    }

    /// Context shift: keep the first `n_keep_tokens` cells, discard a run
    /// after them, slide the tail left over the gap.
    ///
    /// Returns the new `n_past`, or `None` when shifting is disabled or the
    /// sequence has nothing movable (`n_past <= n_keep`).
    pub fn shift(&self, engine: &mut dyn Engine, ctx: ContextHandle, seq: SeqId, n_past: u32) -> Option<u32> {
        if !self.policy.context_shifting {
            return None;
        }
        let n_keep = self.policy.n_keep_tokens.min(n_past);
        let n_left = n_past - n_keep;
        if n_left == 0 {
            return None;
        }

        let n_discard = if self.policy.n_discard_tokens == 0 {
            n_left / 2
        } else {
            self.policy.n_discard_tokens.min(n_left)
        };
        if n_discard == 0 {
            return None;
        }

        let from = n_keep as i64;
        let to = (n_keep + n_discard) as i64;
        engine.kv_seq_remove(ctx, seq, from, to);
        engine.kv_seq_shift(ctx, seq, to, n_past as i64, -(n_discard as i64));

        let new_past = n_past - n_discard;
        debug!(seq, n_past, n_keep, n_discard, new_past, "context shift");
        Some(new_past)
    }

    /// Remove one quarter of a sequence according to `strategy`.
    ///
    /// Head and middle removals compact the remaining tail left so the
    /// sequence stays a contiguous `[0, n_past)` range. Returns the new
    /// `n_past`; a no-op when partial deletion is disabled or the sequence
    /// is too short to quarter.
    pub fn partial_evict(
        &self,
        engine: &mut dyn Engine,
        ctx: ContextHandle,
        seq: SeqId,
        n_past: u32,
        strategy: CacheStrategy,
    ) -> u32 {
        if !self.policy.enable_partial_cache_deletion {
            return n_past;
        }
        let quarter = n_past / 4;
        if quarter == 0 {
            return n_past;
        }

        let (from, to) = match strategy {
            // Oldest cells sit at the start of the sequence.
            CacheStrategy::Lru => (0u32, quarter),
            // Newest cells sit at the end.
            CacheStrategy::Fifo => (n_past - quarter, n_past),
            // Preserve the head (prompt/system context) and the tail
            // (recent turns); remove a middle run past the keep window.
            CacheStrategy::Smart => {
                let keep = self.policy.n_keep_tokens.min(n_past.saturating_sub(quarter));
                let span = n_past - keep;
                let start = keep + (span - quarter) / 2;
                (start, start + quarter)
            }
        };

        engine.kv_seq_remove(ctx, seq, from as i64, to as i64);
        if to < n_past {
            engine.kv_seq_shift(ctx, seq, to as i64, n_past as i64, -((to - from) as i64));
        }

        let new_past = n_past - (to - from);
        info!(seq, ?strategy, from, to, n_past, new_past, "partial cache eviction");
        new_past
    }

    /// Size-triggered cache maintenance: evict a quarter when the logical
    /// token estimate exceeds `max_cache_tokens`. Gated on
    /// `enable_token_cache_reuse`.
    pub fn optimize(&self, engine: &mut dyn Engine, ctx: ContextHandle, seq: SeqId, n_past: u32) -> u32 {
        if !self.policy.enable_token_cache_reuse {
            return n_past;
        }
        if n_past > self.policy.max_cache_tokens {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            self.partial_evict(engine, ctx, seq, n_past, self.policy.cache_deletion_strategy)
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
            n_past
        }
    }

    /// Whether resident memory has crossed the configured pressure
    /// threshold. Always false when `max_memory_mb` is 0 (unlimited).
    pub fn pressure_detected(&self) -> bool {
        if self.policy.max_memory_mb == 0 {
            return false;
        }
        let rss = resident_mb();
        rss as f64 / self.policy.max_memory_mb as f64 >= self.policy.memory_pressure_threshold
    }

    /// Respond to memory pressure: partial-evict the given sequence first;
    /// when that frees nothing, drop the whole cache. Returns the new
    /// `n_past` for the sequence.
    pub fn handle_pressure(&self, engine: &mut dyn Engine, ctx: ContextHandle, seq: SeqId, n_past: u32) -> u32 {
        warn!(
            rss_mb = resident_mb(),
            limit_mb = self.policy.max_memory_mb,
            "memory pressure detected"
        );
        let evicted = self.partial_evict(engine, ctx, seq, n_past, self.policy.cache_strategy);
        if evicted < n_past {
            evicted
        } else {
            self.clear_all(engine, ctx);
            0
        }
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }
}

/// Resident set size in MiB, from `/proc/self/statm`. Returns 0 where the
/// proc filesystem is unavailable; the safe direction is undercounting.
fn resident_mb() -> u64 {
    #[cfg(target_os = "linux")]
    {
        let statm = match std::fs::read_to_string("/proc/self/statm") {
            Ok(s) => s,
            Err(_) => return 0,
        };
        let resident_pages: u64 = statm
            .split_whitespace()
            .nth(1)
            .and_then(|f| f.parse().ok())
            .unwrap_or(0);
        resident_pages * 4096 / (1024 * 1024)
    }
    #[cfg(not(target_os = "linux"))]
    {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelParams;
    use crate::engine::stub::StubEngine;
    use crate::engine::{Batch, ContextHandle, ModelHandle};

    fn setup(n_tokens: u32) -> (StubEngine, ModelHandle, ContextHandle) {
        let mut engine = StubEngine::new();
        let file = std::env::temp_dir().join("nn-gateway-memory-test.gguf");
        std::fs::write(&file, b"stub").unwrap();
        let params = ModelParams::default();
        let model = engine.load_model(&file, &params).unwrap();
        let ctx = engine.create_context(model, &params).unwrap();
        engine
            .decode(
                ctx,
                &Batch {
                    seq: 1,
                    pos: 0,
                    tokens: (0..n_tokens as i32).map(|i| 3 + i % 256).collect(),
                },
            )
            .unwrap();
        (engine, model, ctx)
    }

    fn policy() -> MemoryConfig {
        MemoryConfig {
            n_keep_tokens: 64,
            n_discard_tokens: 128,
            ..MemoryConfig::default()
        }
    }

    #[test]
    fn test_shift_keeps_head_and_compacts() {
        let (mut engine, _model, ctx) = setup(512);
        let mgr = MemoryManager::new(policy());

        let new_past = mgr.shift(&mut engine, ctx, 1, 512).unwrap();
        assert_eq!(new_past, 512 - 128);

        let cells = engine.seq_cells(ctx, 1);
        assert_eq!(cells.len(), 384);
        // Contiguous from zero after the compaction.
        assert_eq!(cells[0], 0);
        assert_eq!(*cells.last().unwrap(), 383);
    }

    #[test]
    fn test_shift_auto_discards_half() {
        let (mut engine, _model, ctx) = setup(512);
        let mut cfg = policy();
        cfg.n_discard_tokens = 0;
        let mgr = MemoryManager::new(cfg);

        // Movable window is 512 - 64 = 448; half is 224.
        let new_past = mgr.shift(&mut engine, ctx, 1, 512).unwrap();
        assert_eq!(new_past, 512 - 224);
    }

    #[test]
    fn test_shift_disabled_or_nothing_movable() {
        let (mut engine, _model, ctx) = setup(512);
        let mut cfg = policy();
        cfg.context_shifting = false;
        assert!(MemoryManager::new(cfg).shift(&mut engine, ctx, 1, 512).is_none());

        let mgr = MemoryManager::new(policy());
        assert!(mgr.shift(&mut engine, ctx, 1, 32).is_none());
    }

    #[test]
    fn test_partial_evict_lru_removes_oldest_quarter() {
        let (mut engine, _model, ctx) = setup(400);
        let mgr = MemoryManager::new(policy());

        let new_past = mgr.partial_evict(&mut engine, ctx, 1, 400, CacheStrategy::Lru);
        assert_eq!(new_past, 300);
        let cells = engine.seq_cells(ctx, 1);
        assert_eq!(cells[0], 0);
        assert_eq!(*cells.last().unwrap(), 299);
    }

    #[test]
    fn test_partial_evict_fifo_removes_newest_quarter() {
        let (mut engine, _model, ctx) = setup(400);
        let mgr = MemoryManager::new(policy());

        let new_past = mgr.partial_evict(&mut engine, ctx, 1, 400, CacheStrategy::Fifo);
        assert_eq!(new_past, 300);
        assert_eq!(*engine.seq_cells(ctx, 1).last().unwrap(), 299);
    }

    #[test]
    fn test_partial_evict_smart_keeps_head_and_tail() {
        let (mut engine, _model, ctx) = setup(400);
        let mgr = MemoryManager::new(policy());

        let new_past = mgr.partial_evict(&mut engine, ctx, 1, 400, CacheStrategy::Smart);
        assert_eq!(new_past, 300);
        let cells = engine.seq_cells(ctx, 1);
        assert_eq!(cells.len(), 300);
        // The keep window survives untouched.
        assert_eq!(cells[0], 0);
        assert_eq!(cells[63], 63);
    }

    #[test]
    fn test_partial_evict_disabled_is_noop() {
        let (mut engine, _model, ctx) = setup(400);
        let mut cfg = policy();
        cfg.enable_partial_cache_deletion = false;
        let mgr = MemoryManager::new(cfg);

        assert_eq!(mgr.partial_evict(&mut engine, ctx, 1, 400, CacheStrategy::Lru), 400);
        assert_eq!(engine.seq_cells(ctx, 1).len(), 400);
    }

    #[test]
    fn test_optimize_counts_hits_and_misses() {
        let (mut engine, _model, ctx) = setup(400);
        let mut cfg = policy();
        cfg.max_cache_tokens = 1024;
        let mgr = MemoryManager::new(cfg);

        // Under budget: miss, no eviction.
        assert_eq!(mgr.optimize(&mut engine, ctx, 1, 400), 400);
        // Over budget: hit, a quarter goes.
        assert_eq!(mgr.optimize(&mut engine, ctx, 1, 2000), 1500);

        let stats = mgr.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);
    }

    #[test]
    fn test_clear_sequence_only() {
        let (mut engine, _model, ctx) = setup(100);
        engine
            .decode(ctx, &Batch { seq: 2, pos: 0, tokens: vec![3, 4, 5] })
            .unwrap();
        let mgr = MemoryManager::new(policy());

        mgr.clear(&mut engine, ctx, 1);
        assert!(engine.seq_cells(ctx, 1).is_empty());
        assert_eq!(engine.seq_cells(ctx, 2).len(), 3);

        mgr.clear_all(&mut engine, ctx);
        assert!(engine.seq_cells(ctx, 2).is_empty());
    }

    #[test]
    fn test_pressure_unlimited_never_fires() {
        let mgr = MemoryManager::new(MemoryConfig::default());
        assert!(!mgr.pressure_detected());
    }
}
