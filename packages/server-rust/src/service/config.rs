use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use super::executor::PoolConfig;

/// Well-known keys of `ServerConfig::parameters`.
pub mod params {
    /// Let the transport drop responses whose client already timed out.
    pub const TIMEOUT_DISCARD_IN_SERVER: &str = "timeout.discard.in.server";
    /// Let the transport run the pipeline on its I/O thread.
    pub const PROCESS_IN_IO_THREAD: &str = "process.in.io.thread";
}

/// Server-level configuration for the dispatch pipeline.
///
/// Loaded by the embedding application; every field has a default so partial
/// JSON documents deserialize.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host, used for diagnostics.
    pub host: String,
    /// Bind port, used for diagnostics.
    pub port: u16,
    /// Application name used for log attribution when the request names none.
    pub app_name: Option<String>,
    /// Sizing of the default business worker pool.
    pub biz_pool: PoolConfig,
    /// How long `stop()` waits for in-flight requests.
    pub drain_timeout_ms: u64,
    /// Free-form transport policy parameters (see [`params`]).
    pub parameters: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 12200,
            app_name: None,
            biz_pool: PoolConfig::default(),
            drain_timeout_ms: 10_000,
            parameters: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// Parse a JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns an error if `json` is not a valid configuration document.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Reads a boolean parameter. Only a case-insensitive `"true"` is true;
    /// absent or unparsable values are false.
    #[must_use]
    pub fn parameter_flag(&self, key: &str) -> bool {
        self.parameters
            .get(key)
            .is_some_and(|value| value.eq_ignore_ascii_case("true"))
    }

    #[must_use]
    pub fn timeout_discard(&self) -> bool {
        self.parameter_flag(params::TIMEOUT_DISCARD_IN_SERVER)
    }

    #[must_use]
    pub fn process_in_io_thread(&self) -> bool {
        self.parameter_flag(params::PROCESS_IN_IO_THREAD)
    }

    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}
