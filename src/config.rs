//! Gateway configuration.
//!
//! One JSON document configures the whole backend: session and queue caps,
//! model parameters, default sampling, stopping, memory policy, logging and
//! performance sections. Both the nested form (`{"backend":{...},...}`) and
//! the legacy flat form are recognized; nested wins when both carry the same
//! key. Unknown keys are ignored. Out-of-range values are corrected to their
//! documented default with a warning, never surfaced as errors.
//!
//! Per-request runtime parameters use the same grammar with every field
//! optional; "absent" stays distinct from "zero" all the way to the sampler.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::engine::TokenId;
use crate::error::GatewayError;
use crate::scheduler::Priority;

/// NUMA placement strategy forwarded to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumaStrategy {
    Disabled,
    Distribute,
    Isolate,
    Numactl,
}

/// Which part of a sequence partial cache deletion removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    /// Remove the oldest quarter.
    Lru,
    /// Remove the newest quarter.
    Fifo,
    /// Keep head and tail, remove the middle quarter.
    Smart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            // tracing has no level above error.
            LogLevel::Error | LogLevel::Fatal => "error",
        }
    }
}

/// Session and queue caps. Immutable from init to deinit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub max_sessions: u32,
    pub idle_timeout_ms: u64,
    pub auto_cleanup: bool,
    pub max_concurrent: u32,
    pub queue_size: u32,
    pub default_task_timeout_ms: u64,
    pub priority_scheduling_enabled: bool,
    pub fair_scheduling_enabled: bool,
    pub auto_queue_cleanup: bool,
    pub queue_warning_threshold: u32,
    pub queue_reject_threshold: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            idle_timeout_ms: 300_000,
            auto_cleanup: true,
            max_concurrent: 10,
            queue_size: 500,
            default_task_timeout_ms: 30_000,
            priority_scheduling_enabled: true,
            fair_scheduling_enabled: true,
            auto_queue_cleanup: true,
            queue_warning_threshold: 400,
            queue_reject_threshold: 500,
        }
    }
}

/// Static engine/model parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub ctx_size: u32,
    pub batch_size: u32,
    pub ubatch_size: u32,
    pub n_gpu_layers: u32,
    pub threads: u32,
    pub threads_batch: u32,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub numa: NumaStrategy,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            ctx_size: 2048,
            batch_size: 512,
            ubatch_size: 512,
            n_gpu_layers: 0,
            threads: 4,
            threads_batch: 4,
            use_mmap: true,
            use_mlock: false,
            numa: NumaStrategy::Disabled,
        }
    }
}

/// DRY repetition-suppression layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DryParams {
    pub multiplier: f32,
    pub base: f32,
    pub allowed_length: u32,
    /// `-1` resolves to the context size at sampler build time.
    pub penalty_last_n: i32,
    pub sequence_breakers: Vec<String>,
}

impl Default for DryParams {
    fn default() -> Self {
        Self {
            multiplier: 0.0,
            base: 1.75,
            allowed_length: 2,
            penalty_last_n: -1,
            sequence_breakers: vec!["\n".into(), ":".into(), "\"".into(), "*".into()],
        }
    }
}

/// Dynamic temperature range/exponent. A range of 0 disables it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynatempParams {
    pub range: f32,
    pub exponent: f32,
}

impl Default for DynatempParams {
    fn default() -> Self {
        Self { range: 0.0, exponent: 1.0 }
    }
}

/// Mirostat entropy-targeted sampling. Version 0 disables it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirostatParams {
    pub version: u32,
    pub tau: f32,
    pub eta: f32,
}

impl Default for MirostatParams {
    fn default() -> Self {
        Self { version: 0, tau: 5.0, eta: 0.1 }
    }
}

/// Default sampling parameters, merged with per-request overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    /// `-1` disables top-k.
    pub top_k: i32,
    pub min_p: f32,
    pub typical_p: f32,
    pub repeat_penalty: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    /// `-1` resolves to the context size at sampler build time.
    pub penalty_last_n: i32,
    pub dry: DryParams,
    pub dynatemp: DynatempParams,
    pub mirostat: MirostatParams,
    /// `-1` draws a fresh random seed at sampler build time.
    pub seed: i64,
    pub n_probs: u32,
    pub min_keep: u32,
    pub ignore_eos: bool,
    pub grammar: String,
    pub grammar_lazy: bool,
    pub logit_bias: Vec<(TokenId, f32)>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            min_p: 0.05,
            typical_p: 1.0,
            repeat_penalty: 1.1,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            penalty_last_n: 64,
            dry: DryParams::default(),
            dynatemp: DynatempParams::default(),
            mirostat: MirostatParams::default(),
            seed: -1,
            n_probs: 0,
            min_keep: 0,
            ignore_eos: false,
            grammar: String::new(),
            grammar_lazy: false,
            logit_bias: Vec::new(),
        }
    }
}

/// Generation stopping defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoppingParams {
    pub max_tokens: u32,
    pub stop: Vec<String>,
}

impl Default for StoppingParams {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            stop: Vec::new(),
        }
    }
}

/// KV-cache memory policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub context_shifting: bool,
    pub n_keep_tokens: u32,
    /// Tokens discarded by a context shift; `0` discards half of the
    /// movable window.
    pub n_discard_tokens: u32,
    pub cache_strategy: CacheStrategy,
    pub max_cache_tokens: u32,
    pub enable_partial_cache_deletion: bool,
    pub enable_token_cache_reuse: bool,
    pub cache_deletion_strategy: CacheStrategy,
    /// `0` = unlimited (pressure detection off).
    pub max_memory_mb: u64,
    pub memory_pressure_threshold: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            context_shifting: true,
            n_keep_tokens: 128,
            n_discard_tokens: 256,
            cache_strategy: CacheStrategy::Lru,
            max_cache_tokens: 65_536,
            enable_partial_cache_deletion: true,
            enable_token_cache_reuse: true,
            cache_deletion_strategy: CacheStrategy::Lru,
            max_memory_mb: 0,
            memory_pressure_threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub enable_debug: bool,
    pub timestamps: bool,
    pub colors: bool,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            enable_debug: false,
            timestamps: true,
            colors: true,
            file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub batch_processing: bool,
    pub batch_size: u32,
    pub batch_timeout_ms: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            batch_processing: false,
            batch_size: 512,
            batch_timeout_ms: 100,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub backend: BackendConfig,
    pub model: ModelParams,
    pub sampling: SamplingParams,
    pub stopping: StoppingParams,
    pub memory: MemoryConfig,
    pub logging: LoggingConfig,
    pub performance: PerformanceConfig,
}

impl Config {
    /// Parse a configuration document, falling back to documented defaults
    /// for every missing or out-of-range field.
    pub fn from_json(json: &str) -> Result<Self, GatewayError> {
        Config::default().layered(json)
    }

    /// Parse a configuration document layered on top of `self`: fields the
    /// document does not set keep their current value. Used by model swap.
    pub fn layered(&self, json: &str) -> Result<Self, GatewayError> {
        let root: Value =
            serde_json::from_str(json).map_err(|e| GatewayError::Configuration(e.to_string()))?;
        let obj = root
            .as_object()
            .ok_or_else(|| GatewayError::Configuration("top-level must be a JSON object".into()))?;
        Ok(apply(obj, self))
    }
}

// ---------------------------------------------------------------------------
// Value-tree walking
// ---------------------------------------------------------------------------

/// Lookup scope for one configuration section: the section's nested object
/// (if present) first, then the legacy flat top level.
struct Section<'a> {
    nested: Option<&'a Map<String, Value>>,
    root: &'a Map<String, Value>,
}

impl<'a> Section<'a> {
    fn new(root: &'a Map<String, Value>, name: &str) -> Self {
        Self {
            nested: root.get(name).and_then(Value::as_object),
            root,
        }
    }

    /// A sub-block inside this section (e.g. `sampling.dry`), falling back
    /// to prefixed keys in the section itself.
    fn block(&self, name: &str) -> Section<'a> {
        Section {
            nested: self
                .nested
                .and_then(|n| n.get(name))
                .and_then(Value::as_object),
            root: self.nested.unwrap_or(self.root),
        }
    }

    fn value(&self, keys: &[&str]) -> Option<&'a Value> {
        if let Some(nested) = self.nested {
            for k in keys {
                if let Some(v) = nested.get(*k) {
                    return Some(v);
                }
            }
        }
        for k in keys {
            if let Some(v) = self.root.get(*k) {
                return Some(v);
            }
        }
        None
    }

    fn f64_in(&self, keys: &[&str], min: f64, max: f64, default: f64) -> f64 {
        self.opt_f64_in(keys, min, max).unwrap_or(default)
    }

    fn f32_in(&self, keys: &[&str], min: f32, max: f32, default: f32) -> f32 {
        self.opt_f32_in(keys, min, max).unwrap_or(default)
    }

    fn u32_in(&self, keys: &[&str], min: u32, max: u32, default: u32) -> u32 {
        self.opt_u32_in(keys, min, max).unwrap_or(default)
    }

    fn u64_in(&self, keys: &[&str], min: u64, max: u64, default: u64) -> u64 {
        match self.value(keys).map(|v| (v, v.as_u64())) {
            None => default,
            Some((_, Some(n))) if (min..=max).contains(&n) => n,
            Some((raw, _)) => {
                warn!(field = keys[0], value = %raw, default, "out of range, reverting to default");
                default
            }
        }
    }

    fn i32_in(&self, keys: &[&str], min: i32, max: i32, default: i32) -> i32 {
        self.opt_i32_in(keys, min, max).unwrap_or(default)
    }

    fn i64_in(&self, keys: &[&str], min: i64, max: i64, default: i64) -> i64 {
        self.opt_i64_in(keys, min, max).unwrap_or(default)
    }

    fn flag(&self, keys: &[&str], default: bool) -> bool {
        self.opt_flag(keys).unwrap_or(default)
    }

    fn opt_f64_in(&self, keys: &[&str], min: f64, max: f64) -> Option<f64> {
        match self.value(keys).map(|v| (v, v.as_f64())) {
            None => None,
            Some((_, Some(n))) if n >= min && n <= max => Some(n),
            Some((raw, _)) => {
                warn!(field = keys[0], value = %raw, "out of range, ignoring");
                None
            }
        }
    }

    fn opt_f32_in(&self, keys: &[&str], min: f32, max: f32) -> Option<f32> {
        self.opt_f64_in(keys, min as f64, max as f64).map(|v| v as f32)
    }

    fn opt_u32_in(&self, keys: &[&str], min: u32, max: u32) -> Option<u32> {
        match self.value(keys).map(|v| (v, v.as_u64())) {
            None => None,
            Some((_, Some(n))) if n >= min as u64 && n <= max as u64 => Some(n as u32),
            Some((raw, _)) => {
                warn!(field = keys[0], value = %raw, "out of range, ignoring");
                None
            }
        }
    }

    fn opt_i32_in(&self, keys: &[&str], min: i32, max: i32) -> Option<i32> {
        match self.value(keys).map(|v| (v, v.as_i64())) {
            None => None,
            Some((_, Some(n))) if n >= min as i64 && n <= max as i64 => Some(n as i32),
            Some((raw, _)) => {
                warn!(field = keys[0], value = %raw, "out of range, ignoring");
                None
            }
        }
    }

    fn opt_i64_in(&self, keys: &[&str], min: i64, max: i64) -> Option<i64> {
        match self.value(keys).map(|v| (v, v.as_i64())) {
            None => None,
            Some((_, Some(n))) if n >= min && n <= max => Some(n),
            Some((raw, _)) => {
                warn!(field = keys[0], value = %raw, "out of range, ignoring");
                None
            }
        }
    }

    fn opt_flag(&self, keys: &[&str]) -> Option<bool> {
        match self.value(keys).map(|v| (v, v.as_bool())) {
            None => None,
            Some((_, Some(b))) => Some(b),
            Some((raw, _)) => {
                warn!(field = keys[0], value = %raw, "expected a boolean, ignoring");
                None
            }
        }
    }

    fn string(&self, keys: &[&str]) -> Option<String> {
        self.value(keys).and_then(Value::as_str).map(str::to_owned)
    }

    fn str_list(&self, keys: &[&str]) -> Option<Vec<String>> {
        let arr = self.value(keys)?.as_array()?;
        Some(
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect(),
        )
    }

    fn choice<T: Copy>(&self, keys: &[&str], table: &[(&str, T)], default: T) -> T {
        match self.string(keys) {
            None => default,
            Some(s) => {
                let lower = s.to_lowercase();
                match table.iter().find(|(name, _)| *name == lower) {
                    Some((_, v)) => *v,
                    None => {
                        warn!(field = keys[0], value = %s, "unrecognized value, reverting to default");
                        default
                    }
                }
            }
        }
    }
}

fn apply(root: &Map<String, Value>, base: &Config) -> Config {
    let backend = parse_backend(root, &base.backend);
    let model = parse_model(root, &base.model);
    let mut sampling = parse_sampling(root, &base.sampling);
    let stopping = parse_stopping(root, &base.stopping, &mut sampling);
    Config {
        backend,
        model,
        sampling,
        stopping,
        memory: parse_memory(root, &base.memory),
        logging: parse_logging(root, &base.logging),
        performance: parse_performance(root, &base.performance),
    }
}

fn parse_backend(root: &Map<String, Value>, base: &BackendConfig) -> BackendConfig {
    let sec = Section::new(root, "backend");
    let queue_size = sec.u32_in(&["queue_size"], 1, 10_000, base.queue_size);

    let cap = |field: &str, value: u32| -> u32 {
        if value > queue_size {
            warn!(field, value, queue_size, "threshold above queue size, capping");
            queue_size
        } else {
            value
        }
    };

    let warning = sec.u32_in(&["queue_warning_threshold"], 1, 10_000, base.queue_warning_threshold);
    let reject = sec.u32_in(&["queue_reject_threshold"], 1, 10_000, base.queue_reject_threshold);

    BackendConfig {
        max_sessions: sec.u32_in(&["max_sessions"], 1, 10_000, base.max_sessions),
        idle_timeout_ms: sec.u64_in(&["idle_timeout_ms"], 1_000, 86_400_000, base.idle_timeout_ms),
        auto_cleanup: sec.flag(&["auto_cleanup"], base.auto_cleanup),
        max_concurrent: sec.u32_in(&["max_concurrent"], 1, 256, base.max_concurrent),
        queue_size,
        default_task_timeout_ms: sec.u64_in(
            &["default_task_timeout_ms", "task_timeout_ms"],
            1_000,
            600_000,
            base.default_task_timeout_ms,
        ),
        priority_scheduling_enabled: sec.flag(&["priority_scheduling_enabled"], base.priority_scheduling_enabled),
        fair_scheduling_enabled: sec.flag(&["fair_scheduling_enabled"], base.fair_scheduling_enabled),
        auto_queue_cleanup: sec.flag(&["auto_queue_cleanup"], base.auto_queue_cleanup),
        queue_warning_threshold: cap("queue_warning_threshold", warning),
        queue_reject_threshold: cap("queue_reject_threshold", reject),
    }
}

fn parse_model(root: &Map<String, Value>, base: &ModelParams) -> ModelParams {
    let sec = Section::new(root, "model");
    let threads = sec.u32_in(&["threads", "n_threads"], 1, 64, base.threads);
    ModelParams {
        ctx_size: sec.u32_in(&["n_ctx", "ctx_size"], 128, 32_768, base.ctx_size),
        batch_size: sec.u32_in(&["n_batch", "batch_size"], 1, 2_048, base.batch_size),
        ubatch_size: sec.u32_in(&["n_ubatch", "ubatch_size"], 1, 2_048, base.ubatch_size),
        n_gpu_layers: sec.u32_in(&["n_gpu_layers"], 0, 999, base.n_gpu_layers),
        threads,
        threads_batch: sec.u32_in(&["threads_batch", "n_threads_batch"], 1, 64, threads),
        use_mmap: sec.flag(&["use_mmap"], base.use_mmap),
        use_mlock: sec.flag(&["use_mlock"], base.use_mlock),
        numa: sec.choice(
            &["numa", "numa_strategy"],
            &[
                ("disabled", NumaStrategy::Disabled),
                ("distribute", NumaStrategy::Distribute),
                ("isolate", NumaStrategy::Isolate),
                ("numactl", NumaStrategy::Numactl),
            ],
            base.numa,
        ),
    }
}

fn parse_sampling(root: &Map<String, Value>, base: &SamplingParams) -> SamplingParams {
    let sec = Section::new(root, "sampling");
    let dry = sec.block("dry");
    let dynatemp = sec.block("dynatemp");

    // `mirostat` may be a bare version number (flat form) or a block.
    let mirostat_block = sec.block("mirostat");
    let mirostat_version = match sec.value(&["mirostat"]) {
        Some(Value::Number(_)) => sec.u32_in(&["mirostat"], 0, 2, base.mirostat.version),
        Some(Value::Object(_)) => mirostat_block.u32_in(&["version"], 0, 2, base.mirostat.version),
        _ => base.mirostat.version,
    };

    let mut dry_base = dry.f32_in(&["base", "dry_base"], 0.0, 10.0, base.dry.base);
    if dry_base < 1.0 {
        warn!(value = dry_base, "dry base below 1.0, resetting to 1.75");
        dry_base = 1.75;
    }

    SamplingParams {
        temperature: sec.f32_in(&["temperature", "temp"], 0.0, 2.0, base.temperature),
        top_p: sec.f32_in(&["top_p"], 0.0, 1.0, base.top_p),
        top_k: sec.i32_in(&["top_k"], -1, 200, base.top_k),
        min_p: sec.f32_in(&["min_p"], 0.0, 1.0, base.min_p),
        typical_p: sec.f32_in(&["typical_p"], 0.0, 1.0, base.typical_p),
        repeat_penalty: sec.f32_in(&["repeat_penalty"], 0.0, 2.0, base.repeat_penalty),
        presence_penalty: sec.f32_in(&["presence_penalty"], -2.0, 2.0, base.presence_penalty),
        frequency_penalty: sec.f32_in(&["frequency_penalty"], -2.0, 2.0, base.frequency_penalty),
        penalty_last_n: sec.i32_in(&["penalty_last_n", "repeat_last_n"], -1, 2_048, base.penalty_last_n),
        dry: DryParams {
            multiplier: dry.f32_in(&["multiplier", "dry_multiplier"], 0.0, 5.0, base.dry.multiplier),
            base: dry_base,
            allowed_length: dry.u32_in(&["allowed_length", "dry_allowed_length"], 0, 512, base.dry.allowed_length),
            penalty_last_n: dry.i32_in(&["penalty_last_n", "dry_penalty_last_n"], -1, 32_768, base.dry.penalty_last_n),
            sequence_breakers: dry
                .str_list(&["sequence_breakers", "dry_sequence_breakers"])
                .unwrap_or_else(|| base.dry.sequence_breakers.clone()),
        },
        dynatemp: DynatempParams {
            range: dynatemp.f32_in(&["range", "dynatemp_range"], 0.0, 10.0, base.dynatemp.range),
            exponent: dynatemp.f32_in(&["exponent", "dynatemp_exponent"], 0.0, 10.0, base.dynatemp.exponent),
        },
        mirostat: MirostatParams {
            version: mirostat_version,
            tau: mirostat_block.f32_in(&["tau", "mirostat_tau"], 0.0, 20.0, base.mirostat.tau),
            eta: mirostat_block.f32_in(&["eta", "mirostat_eta"], 0.0, 1.0, base.mirostat.eta),
        },
        seed: sec.i64_in(&["seed"], -1, i32::MAX as i64, base.seed),
        n_probs: sec.u32_in(&["n_probs", "logprobs"], 0, 100, base.n_probs),
        min_keep: sec.u32_in(&["min_keep"], 0, 256, base.min_keep),
        ignore_eos: sec.flag(&["ignore_eos"], base.ignore_eos),
        grammar: sec.string(&["grammar"]).unwrap_or_else(|| base.grammar.clone()),
        grammar_lazy: sec.flag(&["grammar_lazy"], base.grammar_lazy),
        logit_bias: parse_logit_bias(root, &sec).unwrap_or_else(|| base.logit_bias.clone()),
    }
}

/// `logit_bias` is a sequence of `[token_id, bias]` pairs, accepted at the
/// top level or inside the sampling section.
fn parse_logit_bias(root: &Map<String, Value>, sampling: &Section<'_>) -> Option<Vec<(TokenId, f32)>> {
    let raw = sampling
        .value(&["logit_bias"])
        .or_else(|| root.get("logit_bias"))?
        .as_array()?;

    let mut pairs = Vec::with_capacity(raw.len());
    for entry in raw {
        let parsed = entry.as_array().and_then(|p| {
            let token = p.first()?.as_i64()? as TokenId;
            let bias = p.get(1)?.as_f64()? as f32;
            Some((token, bias))
        });
        match parsed {
            Some(p) => pairs.push(p),
            None => warn!(entry = %entry, "malformed logit_bias entry, skipping"),
        }
    }
    Some(pairs)
}

fn parse_stopping(root: &Map<String, Value>, base: &StoppingParams, sampling: &mut SamplingParams) -> StoppingParams {
    let sec = Section::new(root, "stopping");
    // `ignore_eos` is also honored here for compatibility with flat configs.
    if let Some(ignore) = sec.opt_flag(&["ignore_eos"]) {
        sampling.ignore_eos = ignore;
    }
    StoppingParams {
        max_tokens: sec.u32_in(&["max_tokens", "n_predict"], 1, 4_096, base.max_tokens),
        stop: sec.str_list(&["stop", "stop_sequences"]).unwrap_or_else(|| base.stop.clone()),
    }
}

fn parse_memory(root: &Map<String, Value>, base: &MemoryConfig) -> MemoryConfig {
    let sec = Section::new(root, "memory");

    // 0 is the "discard half" sentinel, otherwise 128..1024.
    let n_discard = match sec.value(&["n_discard_tokens"]).and_then(Value::as_u64) {
        None => base.n_discard_tokens,
        Some(0) => 0,
        Some(n) if (128..=1_024).contains(&n) => n as u32,
        Some(n) => {
            warn!(field = "n_discard_tokens", value = n, "out of range, reverting to default");
            base.n_discard_tokens
        }
    };

    let strategies = [
        ("lru", CacheStrategy::Lru),
        ("fifo", CacheStrategy::Fifo),
        ("smart", CacheStrategy::Smart),
    ];

    MemoryConfig {
        context_shifting: sec.flag(&["context_shifting", "enable_context_shifting"], base.context_shifting),
        n_keep_tokens: sec.u32_in(&["n_keep_tokens", "n_keep"], 64, 2_048, base.n_keep_tokens),
        n_discard_tokens: n_discard,
        cache_strategy: sec.choice(&["cache_strategy"], &strategies, base.cache_strategy),
        max_cache_tokens: sec.u32_in(&["max_cache_tokens"], 1_024, 1_000_000, base.max_cache_tokens),
        enable_partial_cache_deletion: sec.flag(
            &["enable_partial_cache_deletion"],
            base.enable_partial_cache_deletion,
        ),
        enable_token_cache_reuse: sec.flag(&["enable_token_cache_reuse"], base.enable_token_cache_reuse),
        cache_deletion_strategy: sec.choice(&["cache_deletion_strategy"], &strategies, base.cache_deletion_strategy),
        max_memory_mb: sec.u64_in(&["max_memory_mb"], 0, 32_768, base.max_memory_mb),
        memory_pressure_threshold: sec.f64_in(&["memory_pressure_threshold"], 0.5, 0.95, base.memory_pressure_threshold),
    }
}

fn parse_logging(root: &Map<String, Value>, base: &LoggingConfig) -> LoggingConfig {
    let sec = Section::new(root, "logging");
    LoggingConfig {
        level: sec.choice(
            &["level", "log_level"],
            &[
                ("debug", LogLevel::Debug),
                ("info", LogLevel::Info),
                ("warn", LogLevel::Warn),
                ("error", LogLevel::Error),
                ("fatal", LogLevel::Fatal),
            ],
            base.level,
        ),
        enable_debug: sec.flag(&["enable_debug", "debug"], base.enable_debug),
        timestamps: sec.flag(&["timestamps"], base.timestamps),
        colors: sec.flag(&["colors"], base.colors),
        file: sec.string(&["file", "log_file"]).map(PathBuf::from).or_else(|| base.file.clone()),
    }
}

fn parse_performance(root: &Map<String, Value>, base: &PerformanceConfig) -> PerformanceConfig {
    let sec = Section::new(root, "performance");
    PerformanceConfig {
        batch_processing: sec.flag(&["batch_processing", "batch_processing_enabled"], base.batch_processing),
        batch_size: sec.u32_in(&["batch_size"], 1, 2_048, base.batch_size),
        batch_timeout_ms: sec.u64_in(&["batch_timeout_ms"], 10, 1_000, base.batch_timeout_ms),
    }
}

// ---------------------------------------------------------------------------
// Per-request runtime parameters
// ---------------------------------------------------------------------------

/// Per-request overrides. Every field is optional; set fields override the
/// static defaults, unset fields inherit them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeParams {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<i32>,
    pub min_p: Option<f32>,
    pub typical_p: Option<f32>,
    pub repeat_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub penalty_last_n: Option<i32>,
    pub dry_multiplier: Option<f32>,
    pub dry_base: Option<f32>,
    pub dry_allowed_length: Option<u32>,
    pub dry_penalty_last_n: Option<i32>,
    pub dry_sequence_breakers: Option<Vec<String>>,
    pub dynatemp_range: Option<f32>,
    pub dynatemp_exponent: Option<f32>,
    pub mirostat: Option<u32>,
    pub mirostat_tau: Option<f32>,
    pub mirostat_eta: Option<f32>,
    pub seed: Option<i64>,
    pub n_probs: Option<u32>,
    pub min_keep: Option<u32>,
    pub ignore_eos: Option<bool>,
    pub grammar: Option<String>,
    pub grammar_lazy: Option<bool>,
    pub logit_bias: Option<Vec<(TokenId, f32)>>,
    pub max_tokens: Option<u32>,
    pub stop: Option<Vec<String>>,
    pub priority: Option<Priority>,
}

impl RuntimeParams {
    /// Parse a per-request parameter document. Out-of-range values are
    /// warned about and left unset (the static default applies).
    pub fn from_json(json: &str) -> Result<Self, GatewayError> {
        let root: Value =
            serde_json::from_str(json).map_err(|e| GatewayError::Configuration(e.to_string()))?;
        let obj = root
            .as_object()
            .ok_or_else(|| GatewayError::Configuration("runtime config must be a JSON object".into()))?;

        let sec = Section::new(obj, "sampling");
        let dry = sec.block("dry");
        let dynatemp = sec.block("dynatemp");
        let mirostat_block = sec.block("mirostat");
        let stopping = Section::new(obj, "stopping");

        let mirostat = match sec.value(&["mirostat"]) {
            Some(Value::Number(_)) => sec.opt_u32_in(&["mirostat"], 0, 2),
            Some(Value::Object(_)) => mirostat_block.opt_u32_in(&["version"], 0, 2),
            _ => None,
        };

        let priority = match sec.string(&["priority"]) {
            None => None,
            Some(s) => match Priority::parse(&s) {
                Some(p) => Some(p),
                None => {
                    warn!(value = %s, "unrecognized priority, ignoring");
                    None
                }
            },
        };

        Ok(Self {
            temperature: sec.opt_f32_in(&["temperature", "temp"], 0.0, 2.0),
            top_p: sec.opt_f32_in(&["top_p"], 0.0, 1.0),
            top_k: sec.opt_i32_in(&["top_k"], -1, 200),
            min_p: sec.opt_f32_in(&["min_p"], 0.0, 1.0),
            typical_p: sec.opt_f32_in(&["typical_p"], 0.0, 1.0),
            repeat_penalty: sec.opt_f32_in(&["repeat_penalty"], 0.0, 2.0),
            presence_penalty: sec.opt_f32_in(&["presence_penalty"], -2.0, 2.0),
            frequency_penalty: sec.opt_f32_in(&["frequency_penalty"], -2.0, 2.0),
            penalty_last_n: sec.opt_i32_in(&["penalty_last_n", "repeat_last_n"], -1, 2_048),
            dry_multiplier: dry.opt_f32_in(&["multiplier", "dry_multiplier"], 0.0, 5.0),
            dry_base: dry.opt_f32_in(&["base", "dry_base"], 1.0, 10.0),
            dry_allowed_length: dry.opt_u32_in(&["allowed_length", "dry_allowed_length"], 0, 512),
            dry_penalty_last_n: dry.opt_i32_in(&["penalty_last_n", "dry_penalty_last_n"], -1, 32_768),
            dry_sequence_breakers: dry.str_list(&["sequence_breakers", "dry_sequence_breakers"]),
            dynatemp_range: dynatemp.opt_f32_in(&["range", "dynatemp_range"], 0.0, 10.0),
            dynatemp_exponent: dynatemp.opt_f32_in(&["exponent", "dynatemp_exponent"], 0.0, 10.0),
            mirostat,
            mirostat_tau: mirostat_block.opt_f32_in(&["tau", "mirostat_tau"], 0.0, 20.0),
            mirostat_eta: mirostat_block.opt_f32_in(&["eta", "mirostat_eta"], 0.0, 1.0),
            seed: sec.opt_i64_in(&["seed"], -1, i32::MAX as i64),
            n_probs: sec.opt_u32_in(&["n_probs", "logprobs"], 0, 100),
            min_keep: sec.opt_u32_in(&["min_keep"], 0, 256),
            ignore_eos: sec.opt_flag(&["ignore_eos"]).or_else(|| stopping.opt_flag(&["ignore_eos"])),
            grammar: sec.string(&["grammar"]),
            grammar_lazy: sec.opt_flag(&["grammar_lazy"]),
            logit_bias: parse_logit_bias(obj, &sec),
            max_tokens: stopping
                .opt_u32_in(&["max_tokens", "n_predict"], 1, 4_096)
                .or_else(|| sec.opt_u32_in(&["max_tokens", "n_predict"], 1, 4_096)),
            stop: stopping
                .str_list(&["stop", "stop_sequences"])
                .or_else(|| sec.str_list(&["stop", "stop_sequences"])),
            priority,
        })
    }

    /// True when no field is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
