//! Sampler factory.
//!
//! Builds the per-slot sampler from a sampling-parameter record and rebuilds
//! it when a request's effective parameters differ from what the current
//! sampler was built from. Sentinel values are expanded only at build time
//! so the stored record still compares equal across identical requests.

use rand::Rng;
use tracing::debug;

use crate::config::{RuntimeParams, SamplingParams};
use crate::engine::{Engine, ModelHandle, SamplerHandle};
use crate::error::Result;

/// Merge static defaults with per-request overrides: every set field
/// overrides, every unset field inherits.
pub fn effective(defaults: &SamplingParams, runtime: Option<&RuntimeParams>) -> SamplingParams {
    let Some(rt) = runtime else {
        return defaults.clone();
    };

    let mut p = defaults.clone();
    if let Some(v) = rt.temperature {
        p.temperature = v;
    }
    if let Some(v) = rt.top_p {
        p.top_p = v;
    }
    if let Some(v) = rt.top_k {
        p.top_k = v;
    }
    if let Some(v) = rt.min_p {
        p.min_p = v;
    }
    if let Some(v) = rt.typical_p {
        p.typical_p = v;
    }
    if let Some(v) = rt.repeat_penalty {
        p.repeat_penalty = v;
    }
    if let Some(v) = rt.presence_penalty {
        p.presence_penalty = v;
    }
    if let Some(v) = rt.frequency_penalty {
        p.frequency_penalty = v;
    }
    if let Some(v) = rt.penalty_last_n {
        p.penalty_last_n = v;
    }
    if let Some(v) = rt.dry_multiplier {
        p.dry.multiplier = v;
    }
    if let Some(v) = rt.dry_base {
        p.dry.base = v;
    }
    if let Some(v) = rt.dry_allowed_length {
        p.dry.allowed_length = v;
    }
    if let Some(v) = rt.dry_penalty_last_n {
        p.dry.penalty_last_n = v;
    }
    if let Some(ref v) = rt.dry_sequence_breakers {
        p.dry.sequence_breakers = v.clone();
    }
    if let Some(v) = rt.dynatemp_range {
        p.dynatemp.range = v;
    }
    if let Some(v) = rt.dynatemp_exponent {
        p.dynatemp.exponent = v;
    }
    if let Some(v) = rt.mirostat {
        p.mirostat.version = v;
    }
    if let Some(v) = rt.mirostat_tau {
        p.mirostat.tau = v;
    }
    if let Some(v) = rt.mirostat_eta {
        p.mirostat.eta = v;
    }
    if let Some(v) = rt.seed {
        p.seed = v;
    }
    if let Some(v) = rt.n_probs {
        p.n_probs = v;
    }
    if let Some(v) = rt.min_keep {
        p.min_keep = v;
    }
    if let Some(v) = rt.ignore_eos {
        p.ignore_eos = v;
    }
    if let Some(ref v) = rt.grammar {
        p.grammar = v.clone();
    }
    if let Some(v) = rt.grammar_lazy {
        p.grammar_lazy = v;
    }
    if let Some(ref v) = rt.logit_bias {
        p.logit_bias = v.clone();
    }
    p
}

/// Expand sentinels for the engine: `penalty_last_n = -1` becomes the
/// context size (same for the DRY window), negative temperature clamps to
/// greedy, and `seed = -1` draws a fresh random seed.
pub fn resolve(params: &SamplingParams, ctx_size: u32) -> SamplingParams {
    let mut p = params.clone();
    if p.temperature < 0.0 {
        p.temperature = 0.0;
    }
    if p.penalty_last_n < 0 {
        p.penalty_last_n = ctx_size as i32;
    }
    if p.dry.penalty_last_n < 0 {
        p.dry.penalty_last_n = ctx_size as i32;
    }
    if p.seed < 0 {
        p.seed = rand::thread_rng().gen_range(0..=i32::MAX as i64);
    }
    p
}

/// Build a sampler from an unresolved record.
pub fn build(
    engine: &mut dyn Engine,
    model: ModelHandle,
    ctx_size: u32,
    params: &SamplingParams,
) -> Result<SamplerHandle> {
    let resolved = resolve(params, ctx_size);
    let handle = engine.sampler_build(model, &resolved)?;
    debug!(
        temperature = resolved.temperature,
        top_k = resolved.top_k,
        top_p = resolved.top_p,
        seed = resolved.seed,
        "sampler built"
    );
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_without_runtime_is_identity() {
        let defaults = SamplingParams::default();
        assert_eq!(effective(&defaults, None), defaults);
    }

    #[test]
    fn test_effective_overrides_only_set_fields() {
        let defaults = SamplingParams::default();
        let rt = RuntimeParams {
            temperature: Some(0.0),
            top_k: Some(-1),
            ..RuntimeParams::default()
        };
        let merged = effective(&defaults, Some(&rt));
        assert_eq!(merged.temperature, 0.0);
        assert_eq!(merged.top_k, -1);
        assert_eq!(merged.top_p, defaults.top_p);
        assert_eq!(merged.penalty_last_n, defaults.penalty_last_n);
    }

    #[test]
    fn test_runtime_repeating_defaults_compares_equal() {
        let defaults = SamplingParams::default();
        let rt = RuntimeParams {
            temperature: Some(defaults.temperature),
            top_p: Some(defaults.top_p),
            ..RuntimeParams::default()
        };
        assert_eq!(effective(&defaults, Some(&rt)), defaults);
    }

    #[test]
    fn test_resolve_expands_sentinels() {
        let params = SamplingParams {
            penalty_last_n: -1,
            temperature: -0.5,
            ..SamplingParams::default()
        };
        let resolved = resolve(&params, 4096);
        assert_eq!(resolved.penalty_last_n, 4096);
        assert_eq!(resolved.dry.penalty_last_n, 4096);
        assert_eq!(resolved.temperature, 0.0);
        assert!(resolved.seed >= 0);
    }

    #[test]
    fn test_resolve_keeps_explicit_seed() {
        let params = SamplingParams {
            seed: 1234,
            ..SamplingParams::default()
        };
        assert_eq!(resolve(&params, 2048).seed, 1234);
    }
}
