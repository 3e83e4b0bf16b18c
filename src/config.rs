//! Process configuration.
//!
//! Config is one JSON document: a handful of global sections plus one node
//! per endpoint, keyed by endpoint name. The framework only interprets the
//! global sections; each endpoint node is handed verbatim to that
//! endpoint's construction.
//!
//! ```json
//! {
//!   "log": { "level": "info" },
//!   "runtime": { "maxWorkers": 262144, "workerMaxIdleSeconds": 60, "handleTimeoutSeconds": 10 },
//!   "transport": { "port": 18080, "documents": true },
//!   "users": { "cacheSize": 1024 }
//! }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::errors::CodeError;
use crate::workers;

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub runtime: RuntimeConfig,
    pub transport: TransportConfig,
    /// Per-endpoint nodes keyed by endpoint name.
    #[serde(flatten)]
    pub endpoints: HashMap<String, Value>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// One of `trace`, `debug`, `info`, `warn`, `error`, `off`.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeConfig {
    pub max_workers: usize,
    pub worker_max_idle_seconds: u64,
    pub handle_timeout_seconds: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_workers: workers::DEFAULT_MAX_WORKERS,
            worker_max_idle_seconds: workers::DEFAULT_MAX_IDLE.as_secs(),
            handle_timeout_seconds: 10,
        }
    }
}

impl RuntimeConfig {
    pub fn worker_max_idle(&self) -> Duration {
        Duration::from_secs(self.worker_max_idle_seconds.max(1))
    }

    pub fn handle_timeout(&self) -> Duration {
        Duration::from_secs(self.handle_timeout_seconds.max(1))
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub port: u16,
    /// Enables the `GET /documents` route.
    pub documents: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 18080,
            documents: false,
        }
    }
}

impl Config {
    /// Parses the JSON document.
    pub fn from_str(text: &str) -> Result<Self, CodeError> {
        serde_json::from_str(text)
            .map_err(|err| CodeError::internal(format!("config parsing failed: {err}")))
    }

    /// The config node for one endpoint; absent nodes construct with null.
    pub fn node(&self, endpoint: &str) -> Value {
        self.endpoints.get(endpoint).cloned().unwrap_or(Value::Null)
    }
}
