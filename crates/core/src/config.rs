//! Helpers for reading typed settings from environment variables.
//!
//! Binaries call `dotenvy::dotenv()` first; these helpers only read the
//! process environment.

use std::str::FromStr;

use crate::error::CoreError;

/// Read `key` and parse it, falling back to `default` when unset.
///
/// A set-but-unparsable value is an error rather than a silent default.
pub fn env_or<T>(key: &str, default: T) -> Result<T, CoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => parse_setting(key, &raw),
        Err(_) => Ok(default),
    }
}

/// Read and parse `key`, which must be set.
pub fn required_env<T>(key: &str) -> Result<T, CoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(key)
        .map_err(|_| CoreError::Config(format!("{key} environment variable is required")))?;
    parse_setting(key, &raw)
}

/// Parse one raw setting value, naming the key in the error.
pub fn parse_setting<T>(key: &str, raw: &str) -> Result<T, CoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| CoreError::Config(format!("{key} is invalid ({raw:?}): {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_trimmed_value() {
        let port: u16 = parse_setting("PORT", " 8080 ").unwrap();
        assert_eq!(port, 8080);
    }

    #[test]
    fn invalid_value_names_the_key() {
        let err = parse_setting::<u64>("SPIN_CHECK_INTERVAL_MS", "soon").unwrap_err();
        assert!(err.to_string().contains("SPIN_CHECK_INTERVAL_MS"));
    }

    #[test]
    fn unset_key_uses_default() {
        let value: u64 = env_or("LOYALTY_TEST_SURELY_UNSET_KEY", 42).unwrap();
        assert_eq!(value, 42);
    }
}
