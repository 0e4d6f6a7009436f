//! Per-model circuit breaker for the completion provider.
//!
//! A model that keeps failing is disabled for a cool-down period so we stop
//! burning requests on it; a disabled model whose cool-down elapsed is
//! re-enabled lazily on the next availability probe.

use chrono::Utc;
use dashmap::DashMap;

const MAX_CONSECUTIVE_FAILURES: u32 = 4;

/// 24 hours.
const DISABLE_DURATION_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Default)]
struct ModelState {
    consecutive_failures: u32,
    /// Epoch millis; 0 = not disabled.
    disabled_until_ms: i64,
}

pub struct ModelHealth {
    models: DashMap<String, ModelState>,
}

impl ModelHealth {
    pub fn new() -> Self {
        Self {
            models: DashMap::new(),
        }
    }

    /// False while the model is inside its disable window. Clears stale
    /// bookkeeping (and the failure count with it) once the window elapsed.
    pub fn is_available(&self, model: &str) -> bool {
        self.is_available_at(model, Utc::now().timestamp_millis())
    }

    fn is_available_at(&self, model: &str, now_ms: i64) -> bool {
        match self.models.get(model) {
            Some(state) if now_ms < state.disabled_until_ms => return false,
            Some(_) => {}
            None => return true,
        }
        self.models.remove_if(model, |_, state| {
            state.disabled_until_ms != 0 && now_ms >= state.disabled_until_ms
        });
        true
    }

    pub fn record_failure(&self, model: &str) {
        self.record_failure_at(model, Utc::now().timestamp_millis());
    }

    fn record_failure_at(&self, model: &str, now_ms: i64) {
        let mut state = self.models.entry(model.to_string()).or_default();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            state.disabled_until_ms = now_ms + DISABLE_DURATION_MS;
            tracing::warn!(
                "Model '{}' disabled for 24h after {} consecutive failures",
                model,
                state.consecutive_failures
            );
        }
    }

    /// A success clears the consecutive-failure count. It does not touch an
    /// already-set disable window; calls are gated by `is_available`, so a
    /// success cannot be observed while a model is disabled.
    pub fn record_success(&self, model: &str) {
        if let Some(mut state) = self.models.get_mut(model) {
            state.consecutive_failures = 0;
        }
    }

    #[cfg(test)]
    fn failures(&self, model: &str) -> u32 {
        self.models
            .get(model)
            .map(|state| state.consecutive_failures)
            .unwrap_or(0)
    }
}

impl Default for ModelHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODEL: &str = "deepseek/deepseek-r1-distill-llama-70b:free";

    #[test]
    fn fourth_consecutive_failure_disables() {
        let health = ModelHealth::new();
        for t in 0..3 {
            health.record_failure_at(MODEL, t);
            assert!(health.is_available_at(MODEL, t + 1));
        }
        health.record_failure_at(MODEL, 3);
        assert!(!health.is_available_at(MODEL, 4));
    }

    #[test]
    fn cooldown_elapsing_reenables_and_clears_count() {
        let health = ModelHealth::new();
        for t in 0..4 {
            health.record_failure_at(MODEL, t);
        }
        assert!(!health.is_available_at(MODEL, 4));
        // Disabled at t=3 for 24h; probe just past the window.
        assert!(health.is_available_at(MODEL, DISABLE_DURATION_MS + 5));
        assert_eq!(health.failures(MODEL), 0);
    }

    #[test]
    fn still_disabled_just_before_cooldown_ends() {
        let health = ModelHealth::new();
        for t in 0..4 {
            health.record_failure_at(MODEL, t);
        }
        assert!(!health.is_available_at(MODEL, DISABLE_DURATION_MS + 2));
    }

    #[test]
    fn success_resets_count_without_touching_disable_window() {
        let health = ModelHealth::new();
        health.record_failure_at(MODEL, 0);
        health.record_failure_at(MODEL, 1);
        health.record_success(MODEL);
        assert_eq!(health.failures(MODEL), 0);

        // Three more failures after the reset must not trip the breaker.
        for t in 2..5 {
            health.record_failure_at(MODEL, t);
        }
        assert!(health.is_available_at(MODEL, 6));

        health.record_failure_at(MODEL, 6);
        assert!(!health.is_available_at(MODEL, 7));

        // A success while disabled clears the count but the window stands.
        health.record_success(MODEL);
        assert!(!health.is_available_at(MODEL, 8));
    }

    #[test]
    fn unknown_model_is_available() {
        let health = ModelHealth::new();
        assert!(health.is_available_at("meta-llama/llama-3.2-3b-instruct", 0));
    }

    #[test]
    fn models_are_tracked_independently() {
        let health = ModelHealth::new();
        for t in 0..4 {
            health.record_failure_at(MODEL, t);
        }
        assert!(!health.is_available_at(MODEL, 5));
        assert!(health.is_available_at("meta-llama/llama-3.2-3b-instruct", 5));
    }
}
