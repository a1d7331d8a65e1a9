//! Worker pool configuration.
//!
//! Defaults can be overridden from the environment:
//!
//! | Variable                   | Field           |
//! |----------------------------|-----------------|
//! | `RPOLARS_WORKERS`          | `capacity`      |
//! | `RPOLARS_SPAWN_TIMEOUT_MS` | `spawn_timeout` |
//! | `RPOLARS_WORKER_PATH`      | `worker_path`   |
//! | `RPOLARS_SOCKET_DIR`       | `socket_dir`    |
//! | `RPOLARS_SHM_THRESHOLD`    | `shm_threshold` |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RPolarsErr, RResult, Rctx, WithRctx};

/// Configuration of a [`WorkerPool`](crate::pool::WorkerPool).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of live worker processes.
    pub capacity: usize,
    /// How long a new worker may take to complete its handshake.
    pub spawn_timeout_ms: u64,
    /// Explicit path of the `rpolars-worker` binary.
    pub worker_path: Option<PathBuf>,
    /// Directory for rendezvous and job sockets.
    pub socket_dir: PathBuf,
    /// Columns encoding to more bytes than this go through shared memory.
    pub shm_threshold: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: std::thread::available_parallelism()
                .map(std::num::NonZero::get)
                .unwrap_or(1),
            spawn_timeout_ms: 10_000,
            worker_path: None,
            socket_dir: std::env::temp_dir(),
            shm_threshold: 1024 * 1024,
        }
    }
}

impl PoolConfig {
    /// Defaults overridden by `RPOLARS_*` environment variables.
    pub fn from_env() -> RResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> RResult<Self> {
        let mut config = Self::default();
        if let Some(capacity) = parse_var(&lookup, "RPOLARS_WORKERS")? {
            config.capacity = capacity;
        }
        if let Some(ms) = parse_var(&lookup, "RPOLARS_SPAWN_TIMEOUT_MS")? {
            config.spawn_timeout_ms = ms;
        }
        if let Some(path) = lookup("RPOLARS_WORKER_PATH") {
            config.worker_path = Some(PathBuf::from(path));
        }
        if let Some(dir) = lookup("RPOLARS_SOCKET_DIR") {
            config.socket_dir = PathBuf::from(dir);
        }
        if let Some(threshold) = parse_var(&lookup, "RPOLARS_SHM_THRESHOLD")? {
            config.shm_threshold = threshold;
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON object of overrides, e.g. from host-side options.
    pub fn from_json(json: &str) -> RResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(RPolarsErr::from)
            .when("parsing pool options")?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_worker_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker_path = Some(path.into());
        self
    }

    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_timeout_ms)
    }

    pub fn validate(&self) -> RResult<()> {
        if self.capacity == 0 {
            return Err(RPolarsErr::new(Rctx::BadVal("0".to_string()))
                .push(Rctx::Misvalued("is at least 1".to_string()))
                .push(Rctx::BadArgument("capacity".to_string())));
        }
        if self.spawn_timeout_ms == 0 {
            return Err(RPolarsErr::new(Rctx::BadVal("0".to_string()))
                .push(Rctx::Misvalued("is a positive number of milliseconds".to_string()))
                .push(Rctx::BadArgument("spawn_timeout_ms".to_string())));
        }
        Ok(())
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> RResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|e| {
            RPolarsErr::lift(e)
                .push(Rctx::BadVal(raw.clone()))
                .push(Rctx::When(format!("reading environment variable {key}")))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RctxKind;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = PoolConfig::default();
        assert!(config.capacity >= 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let config = PoolConfig::from_lookup(lookup(&[
            ("RPOLARS_WORKERS", "3"),
            ("RPOLARS_SPAWN_TIMEOUT_MS", " 2500 "),
            ("RPOLARS_WORKER_PATH", "/opt/rpolars/rpolars-worker"),
            ("RPOLARS_SHM_THRESHOLD", "0"),
        ]))
        .unwrap();

        assert_eq!(config.capacity, 3);
        assert_eq!(config.spawn_timeout(), Duration::from_millis(2500));
        assert_eq!(
            config.worker_path.as_deref(),
            Some(std::path::Path::new("/opt/rpolars/rpolars-worker"))
        );
        assert_eq!(config.shm_threshold, 0);
    }

    #[test]
    fn test_unparsable_env_value() {
        let err = PoolConfig::from_lookup(lookup(&[("RPOLARS_WORKERS", "many")])).unwrap_err();
        let contexts = err.contexts();
        assert_eq!(contexts[0].kind, RctxKind::When);
        assert!(contexts[0].message.contains("RPOLARS_WORKERS"));
        assert_eq!(contexts[1].kind, RctxKind::BadVal);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = PoolConfig::from_lookup(lookup(&[("RPOLARS_WORKERS", "0")])).unwrap_err();
        assert_eq!(err.last_pushed(), &Rctx::BadArgument("capacity".to_string()));
    }

    #[test]
    fn test_from_json_partial() {
        let config = PoolConfig::from_json(r#"{"capacity": 2, "shm_threshold": 64}"#).unwrap();
        assert_eq!(config.capacity, 2);
        assert_eq!(config.shm_threshold, 64);
        assert_eq!(config.spawn_timeout_ms, PoolConfig::default().spawn_timeout_ms);
    }
}
