//! Environment variable helpers used by the engine configuration.
//!
//! ```ignore
//! use questnet_core::env::{env_get, env_get_bool, env_get_ms};
//!
//! let sockets: usize = env_get("QNET_MAX_SOCKETS", 4096);
//! let timeout = env_get_ms("QNET_QUEST_TIMEOUT_MS", Duration::from_secs(5));
//! let quiet = env_get_bool("QNET_IGNORE_SIGPIPE", true);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, falling back to `default` when unset or unparsable.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Boolean flag. "1", "true", "yes", "on" (any case) are true, "0", "false",
/// "no", "off" are false; anything else yields `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// `Some(T)` if the variable is set and parses.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Millisecond count as a `Duration`.
#[inline]
pub fn env_get_ms(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var(key).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__QNET_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        assert!(!env_is_set("__QNET_TEST_UNSET__"));
    }

    #[test]
    fn test_env_get_parsed() {
        std::env::set_var("__QNET_TEST_NUM__", " 123 ");
        let val: u32 = env_get("__QNET_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__QNET_TEST_NUM__");
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__QNET_TEST_BAD__", "many");
        let val: usize = env_get("__QNET_TEST_BAD__", 9);
        assert_eq!(val, 9);
        std::env::remove_var("__QNET_TEST_BAD__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        std::env::set_var("__QNET_TEST_BOOL__", "ON");
        assert!(env_get_bool("__QNET_TEST_BOOL__", false));
        std::env::set_var("__QNET_TEST_BOOL__", "no");
        assert!(!env_get_bool("__QNET_TEST_BOOL__", true));
        std::env::set_var("__QNET_TEST_BOOL__", "maybe");
        assert!(env_get_bool("__QNET_TEST_BOOL__", true));
        std::env::remove_var("__QNET_TEST_BOOL__");
    }

    #[test]
    fn test_env_get_ms() {
        std::env::set_var("__QNET_TEST_MS__", "250");
        assert_eq!(
            env_get_ms("__QNET_TEST_MS__", Duration::ZERO),
            Duration::from_millis(250)
        );
        std::env::remove_var("__QNET_TEST_MS__");
        assert_eq!(
            env_get_ms("__QNET_TEST_MS__", Duration::from_secs(1)),
            Duration::from_secs(1)
        );
    }
}
