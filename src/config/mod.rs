//! # Transaction Core Configuration
//!
//! This module centralizes all configuration for the transaction core.
//! Numeric constants live in [`constants`] where interdependent values are
//! co-located and checked at compile time. Runtime knobs that callers pick per
//! pool live in [`PoolConfig`].
//!
//! ## Exhaustion Policy
//!
//! The segment pool is bounded. What happens when the bound is reached is a
//! configuration choice, not a code path callers must handle specially:
//!
//! ```text
//! ExhaustionPolicy::Fail                 -> acquire() returns PoolExhausted now
//! ExhaustionPolicy::Block { timeout }    -> acquire() waits for a release,
//!                                           PoolExhausted once timeout passes
//! ```
//!
//! Both are deterministic: `Fail` never waits, `Block` never fails before its
//! timeout while segments are being released.

pub mod constants;
pub use constants::*;

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustionPolicy {
    #[default]
    Fail,
    Block {
        timeout: Option<Duration>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub size_limit: usize,
    pub exhaustion: ExhaustionPolicy,
}

impl PoolConfig {
    pub fn new() -> Self {
        Self {
            size_limit: DEFAULT_SEGMENT_LIMIT,
            exhaustion: ExhaustionPolicy::Fail,
        }
    }

    /// Caps the number of live segments. Clamped to `1..=MAX_SEGMENT_LIMIT`.
    pub fn size_limit(mut self, limit: usize) -> Self {
        self.size_limit = limit.clamp(1, MAX_SEGMENT_LIMIT);
        self
    }

    pub fn fail_when_exhausted(mut self) -> Self {
        self.exhaustion = ExhaustionPolicy::Fail;
        self
    }

    pub fn block_when_exhausted(mut self, timeout: Option<Duration>) -> Self {
        self.exhaustion = ExhaustionPolicy::Block { timeout };
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_fails_fast() {
        let config = PoolConfig::default();
        assert_eq!(config.size_limit, DEFAULT_SEGMENT_LIMIT);
        assert_eq!(config.exhaustion, ExhaustionPolicy::Fail);
    }

    #[test]
    fn test_size_limit_is_clamped() {
        assert_eq!(PoolConfig::new().size_limit(0).size_limit, 1);
        assert_eq!(
            PoolConfig::new().size_limit(usize::MAX).size_limit,
            MAX_SEGMENT_LIMIT
        );
    }

    #[test]
    fn test_blocking_policy_keeps_timeout() {
        let config = PoolConfig::new().block_when_exhausted(Some(Duration::from_millis(5)));
        assert_eq!(
            config.exhaustion,
            ExhaustionPolicy::Block {
                timeout: Some(Duration::from_millis(5))
            }
        );
    }
}
