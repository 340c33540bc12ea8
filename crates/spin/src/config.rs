use std::time::Duration;

use loyalty_core::config::env_or;
use loyalty_core::CoreError;

use crate::machine::{LockPolicy, DEFAULT_SAFETY_MULTIPLIER, DEFAULT_VISIBILITY_MARGIN_MS};

/// Default period of the recurring elapsed-time check.
pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 250;

/// Spin lock configuration.
#[derive(Debug, Clone)]
pub struct SpinLockConfig {
    /// Unlock-path timing (visibility margin, safety multiplier).
    pub policy: LockPolicy,
    /// How often a held lock is checked for an elapsed expected duration.
    pub check_interval: Duration,
}

impl SpinLockConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default |
    /// |-----------------------------|---------|
    /// | `SPIN_VISIBILITY_MARGIN_MS` | `5000`  |
    /// | `SPIN_CHECK_INTERVAL_MS`    | `250`   |
    /// | `SPIN_SAFETY_MULTIPLIER`    | `2`     |
    pub fn from_env() -> Result<Self, CoreError> {
        let visibility_margin_ms = env_or("SPIN_VISIBILITY_MARGIN_MS", DEFAULT_VISIBILITY_MARGIN_MS)?;
        let check_interval_ms: u64 = env_or("SPIN_CHECK_INTERVAL_MS", DEFAULT_CHECK_INTERVAL_MS)?;
        let safety_multiplier: u32 = env_or("SPIN_SAFETY_MULTIPLIER", DEFAULT_SAFETY_MULTIPLIER)?;

        if check_interval_ms == 0 {
            return Err(CoreError::Validation("SPIN_CHECK_INTERVAL_MS must be greater than zero".into()));
        }
        if safety_multiplier == 0 {
            return Err(CoreError::Validation("SPIN_SAFETY_MULTIPLIER must be at least 1".into()));
        }

        Ok(Self {
            policy: LockPolicy {
                visibility_margin_ms,
                safety_multiplier,
            },
            check_interval: Duration::from_millis(check_interval_ms),
        })
    }
}

impl Default for SpinLockConfig {
    fn default() -> Self {
        Self {
            policy: LockPolicy::default(),
            check_interval: Duration::from_millis(DEFAULT_CHECK_INTERVAL_MS),
        }
    }
}
