//! Environment variable helpers
//!
//! Every runtime knob can be overridden with a `WEAVE_*` variable; these
//! helpers parse them with a fallback to the compile-time default.
//!
//! ```ignore
//! use weave_core::env::{env_get, env_get_bool, env_get_micros};
//!
//! let contexts: usize = env_get("WEAVE_CONTEXTS", 4);
//! let ceiling = env_get_micros("WEAVE_POLL_TIMEOUT_US", 10_000);
//! let verbose = env_get_bool("WEAVE_VERBOSE", false);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, or return `default` when unset or unparsable.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// `Some(T)` only if the variable is set and parses.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean variable: "1", "true", "yes", "on" (any case) are true,
/// anything else that is set is false.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Microsecond count as a `Duration`
#[inline]
pub fn env_get_micros(key: &str, default_us: u64) -> Duration {
    Duration::from_micros(env_get(key, default_us))
}

#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var(key).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_returns_default() {
        let val: usize = env_get("__WEAVE_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        assert!(env_get_bool("__WEAVE_TEST_UNSET__", true));
        assert!(env_get_opt::<u32>("__WEAVE_TEST_UNSET__").is_none());
        assert_eq!(env_get_str("__WEAVE_TEST_UNSET__", "x"), "x");
        assert!(!env_is_set("__WEAVE_TEST_UNSET__"));
    }

    #[test]
    fn test_parse_with_whitespace() {
        std::env::set_var("__WEAVE_TEST_NUM__", " 123 ");
        let val: usize = env_get("__WEAVE_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__WEAVE_TEST_NUM__");
    }

    #[test]
    fn test_invalid_falls_back() {
        std::env::set_var("__WEAVE_TEST_BAD__", "many");
        let val: u64 = env_get("__WEAVE_TEST_BAD__", 7);
        assert_eq!(val, 7);
        std::env::remove_var("__WEAVE_TEST_BAD__");
    }

    #[test]
    fn test_bool_variants() {
        for (raw, want) in [("1", true), ("TRUE", true), ("on", true), ("0", false), ("nope", false)] {
            std::env::set_var("__WEAVE_TEST_BOOL__", raw);
            assert_eq!(env_get_bool("__WEAVE_TEST_BOOL__", !want), want, "{raw}");
        }
        std::env::remove_var("__WEAVE_TEST_BOOL__");
    }

    #[test]
    fn test_micros() {
        std::env::set_var("__WEAVE_TEST_US__", "2500");
        assert_eq!(env_get_micros("__WEAVE_TEST_US__", 1), Duration::from_micros(2500));
        std::env::remove_var("__WEAVE_TEST_US__");
        assert_eq!(env_get_micros("__WEAVE_TEST_US__", 1), Duration::from_micros(1));
    }
}
