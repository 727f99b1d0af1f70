use crate::utils::error::{HttpCoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Result of [`ServerConfig::validate`]: hard errors versus soft warnings,
/// mirroring the `ValidationResult{isValid,errors,warnings}` split of the
/// pool manager this crate's config layer is descended from — a config
/// can be usable (no errors) while still carrying warnings worth logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Top-level configuration wrapper, kept separate from [`ServerConfig`] so
/// that future ambient sections (logging format, TLS-adjacent toggles, ...)
/// have somewhere to live without growing the validated core struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_bind_port() -> u16 {
    8080
}

/// Structured server configuration, per the spec's field table: bounds on
/// pool size, idle/connection/request timeouts, the request body cap, and
/// the acquire waiter queue. Defaults, warn-thresholds, and the
/// `validate`/`apply_defaults` contract follow the original implementation's
/// `ServerConfig` one-for-one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_request_body")]
    pub max_request_body: usize,
    #[serde(default = "default_enable_metrics")]
    pub enable_metrics: bool,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_max_queue_wait_secs")]
    pub max_queue_wait_secs: u64,
}

fn default_min_connections() -> usize {
    10
}
fn default_max_connections() -> usize {
    100
}
fn default_idle_timeout_secs() -> u64 {
    300
}
fn default_connection_timeout_secs() -> u64 {
    30
}
fn default_request_timeout_secs() -> u64 {
    60
}
fn default_max_request_body() -> usize {
    10 * 1024 * 1024
}
fn default_enable_metrics() -> bool {
    true
}
fn default_max_queue_size() -> usize {
    100
}
fn default_max_queue_wait_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
            idle_timeout_secs: default_idle_timeout_secs(),
            connection_timeout_secs: default_connection_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            max_request_body: default_max_request_body(),
            enable_metrics: default_enable_metrics(),
            max_queue_size: default_max_queue_size(),
            max_queue_wait_secs: default_max_queue_wait_secs(),
        }
    }
}

impl ServerConfig {
    /// Convenience factory mirroring the original's `ServerConfig::create`
    /// static factory: build from explicit values then repair via
    /// `apply_defaults`.
    pub fn create(
        min_connections: usize,
        max_connections: usize,
        idle_timeout_secs: u64,
        connection_timeout_secs: u64,
        request_timeout_secs: u64,
        max_request_body: usize,
        enable_metrics: bool,
    ) -> Self {
        let mut cfg = Self {
            min_connections,
            max_connections,
            idle_timeout_secs,
            connection_timeout_secs,
            request_timeout_secs,
            max_request_body,
            enable_metrics,
            max_queue_size: default_max_queue_size(),
            max_queue_wait_secs: default_max_queue_wait_secs(),
        };
        cfg.apply_defaults();
        cfg
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn max_queue_wait(&self) -> Duration {
        Duration::from_secs(self.max_queue_wait_secs)
    }

    /// Validate fields per the spec §6 table. Returns both hard errors
    /// (the config cannot be used as-is) and soft warnings (usable but
    /// probably a mistake), matching the original `ValidationResult` split
    /// rather than failing fast on the first problem found.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.min_connections == 0 {
            result
                .errors
                .push("min_connections must be greater than 0".to_string());
        }
        if self.max_connections == 0 {
            result
                .errors
                .push("max_connections must be greater than 0".to_string());
        }
        if self.min_connections > self.max_connections {
            result
                .errors
                .push("min_connections must not exceed max_connections".to_string());
        }
        if self.max_connections > 1000 {
            result.warnings.push(format!(
                "max_connections ({}) is unusually high (>1000)",
                self.max_connections
            ));
        }

        if self.connection_timeout_secs == 0 {
            result
                .errors
                .push("connection_timeout must be greater than 0".to_string());
        }
        if self.request_timeout_secs == 0 {
            result
                .errors
                .push("request_timeout must be greater than 0".to_string());
        }
        if self.idle_timeout_secs == 0 {
            result
                .errors
                .push("idle_timeout must be greater than 0".to_string());
        }
        if self.connection_timeout_secs > self.request_timeout_secs {
            result.warnings.push(format!(
                "connection_timeout ({}s) exceeds request_timeout ({}s)",
                self.connection_timeout_secs, self.request_timeout_secs
            ));
        }
        if self.idle_timeout_secs < 60 {
            result.warnings.push(format!(
                "idle_timeout ({}s) is unusually low (<60s)",
                self.idle_timeout_secs
            ));
        }

        if self.max_request_body == 0 {
            result
                .errors
                .push("max_request_body must be greater than 0".to_string());
        }
        if self.max_request_body > 100 * 1024 * 1024 {
            result.warnings.push(format!(
                "max_request_body ({} bytes) is unusually high (>100MiB)",
                self.max_request_body
            ));
        }

        if self.max_queue_size == 0 {
            result
                .errors
                .push("max_queue_size must be greater than 0".to_string());
        }
        if self.max_queue_wait_secs == 0 {
            result
                .errors
                .push("max_queue_wait must be greater than 0".to_string());
        }

        result
    }

    /// Repair fields that fail their minimum constraints in place.
    /// Idempotent: `apply_defaults(apply_defaults(c)) == apply_defaults(c)`.
    pub fn apply_defaults(&mut self) {
        if self.min_connections == 0 {
            self.min_connections = default_min_connections();
        }
        if self.max_connections == 0 {
            self.max_connections = default_max_connections();
        }
        if self.min_connections > self.max_connections {
            self.max_connections = self.min_connections;
        }
        if self.connection_timeout_secs == 0 {
            self.connection_timeout_secs = default_connection_timeout_secs();
        }
        if self.request_timeout_secs == 0 {
            self.request_timeout_secs = default_request_timeout_secs();
        }
        if self.idle_timeout_secs == 0 {
            self.idle_timeout_secs = default_idle_timeout_secs();
        }
        if self.max_request_body == 0 {
            self.max_request_body = default_max_request_body();
        }
        if self.max_queue_size == 0 {
            self.max_queue_size = default_max_queue_size();
        }
        if self.max_queue_wait_secs == 0 {
            self.max_queue_wait_secs = default_max_queue_wait_secs();
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            bind_address: default_bind_address(),
            bind_port: default_bind_port(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then validate. Hard errors fail
    /// the load; warnings are returned alongside the parsed config for the
    /// caller to log.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<(Self, Vec<String>)> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            HttpCoreError::InvalidArgument(format!("failed to read config file: {}", e))
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| {
            HttpCoreError::InvalidArgument(format!("failed to parse config: {}", e))
        })?;

        let validation = config.server.validate();
        if !validation.is_valid() {
            return Err(HttpCoreError::InvalidArgument(validation.errors.join("; ")));
        }

        Ok((config, validation.warnings))
    }

    /// Write an example configuration file to disk.
    pub fn create_example<P: AsRef<Path>>(path: P) -> Result<()> {
        let example = r#"bind_address = "127.0.0.1"
bind_port = 8080

[server]
min_connections = 10
max_connections = 100
idle_timeout_secs = 300
connection_timeout_secs = 30
request_timeout_secs = 60
max_request_body = 10485760
enable_metrics = true
max_queue_size = 100
max_queue_wait_secs = 30

[logging]
level = "info"
"#;

        std::fs::write(path.as_ref(), example).map_err(|e| {
            HttpCoreError::InvalidArgument(format!("failed to write example config: {}", e))
        })?;

        Ok(())
    }
}
