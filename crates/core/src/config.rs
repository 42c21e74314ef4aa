//! Engine configuration with env overrides (`FLEETVIEW_*`).

#![forbid(unsafe_code)]

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the batch scheduler, change detector, grace-period removal
/// and the search debouncer. All knobs have stated defaults; `from_env`
/// applies `FLEETVIEW_*` overrides on top of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum coalescing window: a flush happens no later than this after
    /// the first dirty mark of the cycle.
    pub batch_interval: Duration,
    /// If no new dirty keys arrive within this window, flush early instead of
    /// waiting out the full interval.
    pub idle_threshold: Duration,
    /// Quiet period before a filter recomputation runs.
    pub debounce: Duration,
    /// Consecutive snapshot rounds a key may be absent before its row is
    /// removed (tolerates a transient missed poll without UI flicker).
    pub grace_misses: u32,
    /// Consecutive dispatch failures before flushing halts.
    pub max_dispatch_failures: u32,
    /// Numeric tolerance applied when no per-field epsilon is configured.
    pub default_epsilon: f64,
    /// Per-field numeric tolerances, e.g. `("cpu", 0.1)`.
    pub epsilon_by_field: Vec<(String, f64)>,
    /// Volatile fields ignored entirely by change detection.
    pub excluded_fields: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_interval: Duration::from_millis(50),
            idle_threshold: Duration::from_millis(50),
            debounce: Duration::from_millis(300),
            grace_misses: 2,
            max_dispatch_failures: 5,
            default_epsilon: 0.001,
            epsilon_by_field: Vec::new(),
            excluded_fields: vec!["pid".to_string(), "last_seen".to_string()],
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
}

impl EngineConfig {
    /// Defaults with `FLEETVIEW_*` env overrides applied.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(ms) = env_parse::<u64>("FLEETVIEW_BATCH_INTERVAL_MS") {
            cfg.batch_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("FLEETVIEW_IDLE_THRESHOLD_MS") {
            cfg.idle_threshold = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("FLEETVIEW_DEBOUNCE_MS") {
            cfg.debounce = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<u32>("FLEETVIEW_GRACE_MISSES") {
            cfg.grace_misses = n.max(1);
        }
        if let Some(n) = env_parse::<u32>("FLEETVIEW_MAX_DISPATCH_FAILURES") {
            cfg.max_dispatch_failures = n.max(1);
        }
        if let Some(e) = env_parse::<f64>("FLEETVIEW_EPSILON") {
            cfg.default_epsilon = e;
        }
        if let Ok(list) = std::env::var("FLEETVIEW_EXCLUDED_FIELDS") {
            cfg.excluded_fields = list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.batch_interval, Duration::from_millis(50));
        assert_eq!(cfg.idle_threshold, Duration::from_millis(50));
        assert_eq!(cfg.debounce, Duration::from_millis(300));
        assert_eq!(cfg.grace_misses, 2);
        assert_eq!(cfg.max_dispatch_failures, 5);
        assert_eq!(cfg.default_epsilon, 0.001);
        assert!(cfg.excluded_fields.contains(&"pid".to_string()));
    }
}
