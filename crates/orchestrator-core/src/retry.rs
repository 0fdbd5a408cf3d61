//! Retry/backoff scheduler (§4.3): a pure, side-effect-free delay computation.

use rand::Rng;

/// Defaults applied when a step omits a field of its retry policy (§6).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// Computes the delay, in milliseconds, before the next attempt following the
/// failure at `attempt` (1-based). `rng` supplies the jitter draw so callers can
/// pin it in tests.
///
/// ```text
/// exp      = base_ms * multiplier^(attempt-1)
/// capped   = min(exp, max_ms)
/// jitter   = uniform(0, 0.2) * capped
/// delay_ms = floor(capped + jitter)
/// ```
///
/// `attempt` values `<= 0` are normalized to 1. Jitter is strictly additive, up to
/// +20% of the capped value — this is not the symmetric `+/-` jitter a naive port
/// of an exponential-backoff helper would reach for; the additive bound is load
/// bearing for the `next_delay` upper bound tested in property 5.
pub fn next_delay(attempt: i64, base_ms: u64, multiplier: f64, max_ms: u64, rng: &mut impl Rng) -> u64 {
    let attempt = attempt.max(1);
    let exp = base_ms as f64 * multiplier.powi((attempt - 1) as i32);
    let capped = exp.min(max_ms as f64);
    let jitter = rng.gen_range(0.0..0.2) * capped;
    (capped + jitter).floor() as u64
}

/// Bundles the per-step retry configuration, falling back to the §6 defaults for
/// any field a step definition omits.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    /// Resolves a step's optional retry policy against the configured defaults.
    pub fn resolve(policy: Option<&crate::model::RetryPolicy>, defaults: &RetryPolicy) -> Self {
        match policy {
            None => *defaults,
            Some(p) => Self {
                max_attempts: p.max_attempts.unwrap_or(defaults.max_attempts),
                base_delay_ms: p.base_delay_ms.unwrap_or(defaults.base_delay_ms),
                backoff_multiplier: p.backoff_multiplier.unwrap_or(defaults.backoff_multiplier),
                max_delay_ms: p.max_delay_ms.unwrap_or(defaults.max_delay_ms),
            },
        }
    }

    /// Delay before the attempt following `attempt`, drawing jitter from the
    /// thread-local RNG. Production callers use this; tests pin the RNG via
    /// [`next_delay`] directly.
    pub fn delay_for_attempt(&self, attempt: i64) -> u64 {
        next_delay(
            attempt,
            self.base_delay_ms,
            self.backoff_multiplier,
            self.max_delay_ms,
            &mut rand::thread_rng(),
        )
    }

    pub fn has_attempts_remaining(&self, attempts_so_far: u32) -> bool {
        attempts_so_far < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    /// An RNG that always draws the low end of its range, isolating the
    /// exponential/cap computation from jitter.
    fn zero_rng() -> StepRng {
        StepRng::new(0, 0)
    }

    #[test]
    fn exponential_growth_before_cap() {
        let mut rng = zero_rng();
        assert_eq!(next_delay(1, 1000, 2.0, 30_000, &mut rng), 1000);
        assert_eq!(next_delay(2, 1000, 2.0, 30_000, &mut rng), 2000);
        assert_eq!(next_delay(3, 1000, 2.0, 30_000, &mut rng), 4000);
    }

    #[test]
    fn caps_at_max_delay() {
        let mut rng = zero_rng();
        assert_eq!(next_delay(10, 1000, 2.0, 30_000, &mut rng), 30_000);
    }

    #[test]
    fn non_positive_attempt_normalizes_to_one() {
        let mut rng = zero_rng();
        assert_eq!(next_delay(0, 1000, 2.0, 30_000, &mut rng), next_delay(1, 1000, 2.0, 30_000, &mut rng));
        assert_eq!(next_delay(-5, 1000, 2.0, 30_000, &mut rng), next_delay(1, 1000, 2.0, 30_000, &mut rng));
    }

    #[test]
    fn jitter_is_additive_within_twenty_percent() {
        let mut rng = rand::thread_rng();
        for attempt in 1..=6 {
            let capped = (1000.0 * 2f64.powi(attempt - 1)).min(30_000.0);
            let delay = next_delay(attempt as i64, 1000, 2.0, 30_000, &mut rng) as f64;
            assert!(delay >= capped, "delay {delay} below capped {capped}");
            assert!(delay <= capped * 1.2 + 1.0, "delay {delay} above capped*1.2 {}", capped * 1.2);
        }
    }

    #[test]
    fn resolve_falls_back_to_defaults_per_field() {
        let defaults = RetryPolicy::default();
        let partial = crate::model::RetryPolicy {
            max_attempts: Some(7),
            base_delay_ms: None,
            backoff_multiplier: None,
            max_delay_ms: None,
        };
        let resolved = RetryPolicy::resolve(Some(&partial), &defaults);
        assert_eq!(resolved.max_attempts, 7);
        assert_eq!(resolved.base_delay_ms, defaults.base_delay_ms);
    }

    #[test]
    fn has_attempts_remaining() {
        let policy = RetryPolicy { max_attempts: 3, ..Default::default() };
        assert!(policy.has_attempts_remaining(0));
        assert!(policy.has_attempts_remaining(2));
        assert!(!policy.has_attempts_remaining(3));
    }
}
