//! Runtime Configuration
//!
//! Every runtime carries a [`RuntimeConfig`]. It can be built in code or
//! loaded from JSON; missing fields fall back to their defaults.
//!
//! ```json
//! { "reentrancy_limit": 32, "derived_policy": "eager", "flush_mode": "manual" }
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{ReactiveError, Result};

/// Default number of flush rounds before a flush is aborted.
pub const DEFAULT_REENTRANCY_LIMIT: usize = 100;

/// When derived computations recompute after being invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivedPolicy {
    /// Recompute on the next read (or when a pending effect needs the value).
    #[default]
    Lazy,
    /// Recompute during the flush that follows the invalidating write.
    Eager,
}

/// When pending work is flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Flush as soon as the outermost write or batch returns.
    #[default]
    Auto,
    /// Only flush on explicit [`Runtime::flush`](crate::Runtime::flush) calls.
    Manual,
}

/// Configuration for a [`Runtime`](crate::Runtime).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum number of rounds one flush may take. Each write made by an
    /// effect during a flush schedules another round.
    pub reentrancy_limit: usize,

    /// Default recompute policy for derived computations.
    pub derived_policy: DerivedPolicy,

    /// Whether writes flush automatically.
    pub flush_mode: FlushMode,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            reentrancy_limit: DEFAULT_REENTRANCY_LIMIT,
            derived_policy: DerivedPolicy::Lazy,
            flush_mode: FlushMode::Auto,
        }
    }
}

impl RuntimeConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ReactiveError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ReactiveError::InvalidConfig(e.to_string()))
    }

    /// Check the configuration for values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.reentrancy_limit == 0 {
            return Err(ReactiveError::InvalidConfig(
                "reentrancy_limit must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Set the flush round limit.
    pub fn with_reentrancy_limit(mut self, limit: usize) -> Self {
        self.reentrancy_limit = limit;
        self
    }

    /// Set the default derived policy.
    pub fn with_derived_policy(mut self, policy: DerivedPolicy) -> Self {
        self.derived_policy = policy;
        self
    }

    /// Set the flush mode.
    pub fn with_flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.reentrancy_limit, DEFAULT_REENTRANCY_LIMIT);
        assert_eq!(config.derived_policy, DerivedPolicy::Lazy);
        assert_eq!(config.flush_mode, FlushMode::Auto);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = RuntimeConfig::from_json(r#"{ "derived_policy": "eager" }"#).unwrap();
        assert_eq!(config.derived_policy, DerivedPolicy::Eager);
        assert_eq!(config.reentrancy_limit, DEFAULT_REENTRANCY_LIMIT);
    }

    #[test]
    fn json_round_trip_keeps_values() {
        let config = RuntimeConfig::default()
            .with_reentrancy_limit(8)
            .with_flush_mode(FlushMode::Manual);
        let json = config.to_json().unwrap();
        assert_eq!(RuntimeConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn zero_limit_is_rejected() {
        let error = RuntimeConfig::from_json(r#"{ "reentrancy_limit": 0 }"#).unwrap_err();
        assert!(matches!(error, ReactiveError::InvalidConfig(_)));
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(matches!(
            RuntimeConfig::from_json("{ not json"),
            Err(ReactiveError::InvalidConfig(_))
        ));
    }
}
