//! Environment variable helpers used by the runtime configuration
//!
//! ```ignore
//! use rfiber_core::env::{env_get, env_get_bool};
//!
//! let groups: usize = env_get("RFB_NUM_GROUPS", 1);
//! let stealing = env_get_bool("RFB_CROSS_GROUP_STEALING", true);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Get environment variable parsed as type T, or return default
///
/// Unset or unparsable values fall back to `default`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as boolean
///
/// "1", "true", "yes", "on" (case-insensitive) are true, any other value
/// is false. Unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Get environment variable as optional value
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Get a millisecond count as a `Duration`
#[inline]
pub fn env_get_millis(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__RFB_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        assert!(env_get_bool("__RFB_TEST_UNSET__", true));
        assert!(env_get_opt::<u32>("__RFB_TEST_UNSET__").is_none());
    }

    #[test]
    fn test_env_get_parses_trimmed() {
        std::env::set_var("__RFB_TEST_NUM__", " 123 ");
        let val: usize = env_get("__RFB_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__RFB_TEST_NUM__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        for (raw, expected) in [("1", true), ("TRUE", true), ("on", true), ("0", false), ("garbage", false)] {
            std::env::set_var("__RFB_TEST_BOOL__", raw);
            assert_eq!(env_get_bool("__RFB_TEST_BOOL__", !expected), expected, "{}", raw);
        }
        std::env::remove_var("__RFB_TEST_BOOL__");
    }

    #[test]
    fn test_env_get_millis() {
        std::env::set_var("__RFB_TEST_MS__", "250");
        assert_eq!(env_get_millis("__RFB_TEST_MS__", Duration::ZERO), Duration::from_millis(250));
        std::env::set_var("__RFB_TEST_MS__", "soon");
        assert_eq!(env_get_millis("__RFB_TEST_MS__", Duration::from_secs(1)), Duration::from_secs(1));
        std::env::remove_var("__RFB_TEST_MS__");
    }
}
