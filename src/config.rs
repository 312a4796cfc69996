//! Runtime configuration knobs.
//!
//! A small set of named values with hard-coded defaults, overridable as a
//! whole from a JSON document or field by field before the runtime starts.
//! The global snapshot is read at fiber/stack allocation time and by the
//! event loop, so changes made after a manager has started only affect
//! objects created afterwards.

use std::sync::RwLock;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Bytes of stack given to a fiber when the builder does not override it.
pub const DEFAULT_FIBER_STACK_SIZE: usize = 1024 * 1024;

/// Upper bound on a single `epoll_wait` sleep in the event loop.
pub const DEFAULT_IO_IDLE_TIMEOUT_MS: u64 = 5_000;

/// Default per-connection read timeout handed to accepted streams.
pub const DEFAULT_STREAM_READ_TIMEOUT_MS: u64 = 120_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// `fiber.stack.size`
    pub fiber_stack_size: usize,
    /// `io.idle_timeout_ms`
    pub io_idle_timeout_ms: u64,
    /// `stream.read_timeout_ms`
    pub stream_read_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fiber_stack_size: DEFAULT_FIBER_STACK_SIZE,
            io_idle_timeout_ms: DEFAULT_IO_IDLE_TIMEOUT_MS,
            stream_read_timeout_ms: DEFAULT_STREAM_READ_TIMEOUT_MS,
        }
    }
}

impl Config {
    /// Parse a configuration from a JSON document. Missing fields keep their
    /// defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let cfg = serde_json::from_str(json)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(cfg)
    }
}

static GLOBAL: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::default()));

/// Snapshot of the process-wide configuration.
#[inline]
pub fn global() -> Config {
    GLOBAL.read().expect("config lock poisoned").clone()
}

/// Replace the process-wide configuration.
#[inline]
pub fn set_global(cfg: Config) {
    *GLOBAL.write().expect("config lock poisoned") = cfg;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.fiber_stack_size, 1024 * 1024);
        assert_eq!(cfg.io_idle_timeout_ms, 5_000);
        assert_eq!(cfg.stream_read_timeout_ms, 120_000);
    }

    #[test]
    fn from_json_partial() {
        let cfg = Config::from_json(r#"{"io_idle_timeout_ms": 100}"#).unwrap();
        assert_eq!(cfg.io_idle_timeout_ms, 100);
        assert_eq!(cfg.fiber_stack_size, DEFAULT_FIBER_STACK_SIZE);
    }

    #[test]
    fn from_json_rejects_garbage() {
        assert!(Config::from_json("not json").is_err());
    }
}
