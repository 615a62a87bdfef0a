//! Environment variable utilities
//!
//! Typed lookups with defaults, used by `EngineConfig::from_env` and the
//! ring configuration.
//!
//! # Usage
//!
//! ```ignore
//! use diow_core::env::{env_get, env_get_bool};
//!
//! let depth: u32 = env_get("DIOW_QUEUE_DEPTH", 64);
//! let sqpoll = env_get_bool("DIOW_SQPOLL", true);
//! ```

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default
///
/// Unset variables and values that fail to parse both fall back to
/// `default`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as boolean
///
/// Accepts: "1", "true", "yes", "on" (case-insensitive) as true.
/// Any other value is false; unset returns the default.
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

/// Get environment variable as string, or return default
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
