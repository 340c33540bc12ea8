use std::time::Duration;

use loyalty_core::config::{env_or, required_env};
use loyalty_core::types::UserId;
use loyalty_core::CoreError;
use loyalty_realtime::ReconnectConfig;
use loyalty_spin::SpinLockConfig;

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the change-notification WebSocket endpoint.
    pub ws_url: String,
    /// The signed-in user whose changes are followed.
    pub user_id: UserId,
    pub spin: SpinLockConfig,
    pub reconnect: ReconnectConfig,
}

impl ClientConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                      | Default                        |
    /// |------------------------------|--------------------------------|
    /// | `REALTIME_WS_URL`            | `ws://localhost:4000/realtime` |
    /// | `LOYALTY_USER_ID`            | required (UUID)                |
    /// | `RECONNECT_INITIAL_DELAY_MS` | `1000`                         |
    /// | `RECONNECT_MAX_DELAY_MS`     | `30000`                        |
    ///
    /// Spin lock settings are read by [`SpinLockConfig::from_env`].
    pub fn from_env() -> Result<Self, CoreError> {
        let ws_url = env_or("REALTIME_WS_URL", "ws://localhost:4000/realtime".to_string())?;
        let user_id = required_env("LOYALTY_USER_ID")?;
        let reconnect = reconnect_config(
            env_or("RECONNECT_INITIAL_DELAY_MS", 1000)?,
            env_or("RECONNECT_MAX_DELAY_MS", 30_000)?,
        )?;

        Ok(Self {
            ws_url,
            user_id,
            spin: SpinLockConfig::from_env()?,
            reconnect,
        })
    }
}

/// Backoff settings with the default growth factor.
pub fn reconnect_config(initial_ms: u64, max_ms: u64) -> Result<ReconnectConfig, CoreError> {
    if initial_ms == 0 {
        return Err(CoreError::Validation("RECONNECT_INITIAL_DELAY_MS must be greater than zero".into()));
    }
    if max_ms < initial_ms {
        return Err(CoreError::Validation(format!(
            "RECONNECT_MAX_DELAY_MS ({max_ms}) must not be below RECONNECT_INITIAL_DELAY_MS ({initial_ms})"
        )));
    }
    Ok(ReconnectConfig {
        initial_delay: Duration::from_millis(initial_ms),
        max_delay: Duration::from_millis(max_ms),
        ..ReconnectConfig::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_config_keeps_default_multiplier() {
        let config = reconnect_config(500, 10_000).unwrap();
        assert_eq!(config.initial_delay, Duration::from_millis(500));
        assert_eq!(config.max_delay, Duration::from_secs(10));
        assert_eq!(config.multiplier, 2.0);
    }

    #[test]
    fn reconnect_config_rejects_inverted_bounds() {
        let err = reconnect_config(5000, 1000).unwrap_err();
        assert!(err.to_string().contains("RECONNECT_MAX_DELAY_MS"));
    }

    #[test]
    fn reconnect_config_rejects_zero_delay() {
        assert!(reconnect_config(0, 1000).is_err());
    }
}
