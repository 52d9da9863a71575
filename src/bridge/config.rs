// ABOUTME: Configuration for the office bridge pool and the supervised service
//
// BridgeConfig is loaded from TOML with every field defaulted, then adjusted by
// environment overrides:
// - pool: capacity, reuse limit, probe backoff, restart-on-destroy
// - service: program, command line, transport, connect retry and shutdown timings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::transport::{Endpoint, DEFAULT_HOST, DEFAULT_PORT};

/// Overrides the service program path
pub const ENV_PROGRAM: &str = "OFFICE_BRIDGE_PROGRAM";

/// Overrides the pool capacity
pub const ENV_CAPACITY: &str = "OFFICE_BRIDGE_CAPACITY";

/// Directory searched for `config.toml`, relative to the working and home directories
pub const CONFIG_DIR: &str = ".office-bridge";

/// Switches passed when the service runs headless
pub const HEADLESS_FLAGS: &[&str] = &[
    "--headless",
    "--nologo",
    "--nodefault",
    "--norestore",
    "--nolockcheck",
];

/// Switches passed when the service shows its UI
pub const DESKTOP_FLAGS: &[&str] = &[
    "--nologo",
    "--nodefault",
    "--norestore",
    "--nocrashreport",
    "--nolockcheck",
];

/// Errors raised while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config {path}: {source}")]
    Read {
        /// File that was read
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        /// File that was parsed
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A value is out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Connection pool settings
    pub pool: PoolSettings,

    /// Supervised service settings
    pub service: ServiceSettings,
}

/// Connection pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Maximum number of live connections
    pub capacity: usize,

    /// Uses before a connection is destroyed instead of recycled; `<= 0` is unlimited
    pub reuse_count: i64,

    /// First delay after repeated probe failures
    #[serde(with = "duration_millis")]
    pub probe_backoff_base: Duration,

    /// Cap on the probe failure delay
    #[serde(with = "duration_millis")]
    pub probe_backoff_max: Duration,

    /// Stop the service whenever a connection is destroyed
    pub restart_on_destroy: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            capacity: 1,
            reuse_count: 0,
            probe_backoff_base: Duration::from_millis(100),
            probe_backoff_max: Duration::from_secs(5),
            restart_on_destroy: false,
        }
    }
}

/// How the service is reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportSettings {
    /// Named pipe with a fresh random name per start
    Pipe {
        /// Directory for pipe sockets (default: system temp dir)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dir: Option<PathBuf>,
    },
    /// TCP socket
    Socket {
        /// Host to connect to
        #[serde(default = "default_host")]
        host: String,
        /// Port to connect to
        #[serde(default = "default_port")]
        port: u16,
    },
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

const fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for TransportSettings {
    fn default() -> Self {
        if cfg!(unix) {
            Self::Pipe { dir: None }
        } else {
            Self::Socket {
                host: default_host(),
                port: default_port(),
            }
        }
    }
}

/// Supervised service settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Service executable; `soffice` on the search path when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<PathBuf>,

    /// Arguments placed before the generated ones (for wrapper scripts)
    pub extra_args: Vec<String>,

    /// Run without UI
    pub headless: bool,

    /// Endpoint selection
    pub transport: TransportSettings,

    /// Connection attempts while waiting for startup; 0 retries forever
    pub connect_retries: u32,

    /// Sleep between connection attempts
    #[serde(with = "duration_millis")]
    pub retry_interval: Duration,

    /// Wait for the process to exit after a terminate request
    #[serde(with = "duration_millis")]
    pub terminate_wait: Duration,

    /// Pause after closing a socket connection
    #[serde(with = "duration_millis")]
    pub socket_close_settle: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            program: None,
            extra_args: vec![],
            headless: true,
            transport: TransportSettings::default(),
            connect_retries: 0,
            retry_interval: Duration::from_millis(500),
            terminate_wait: Duration::from_secs(2),
            socket_close_settle: Duration::from_millis(100),
        }
    }
}

impl ServiceSettings {
    /// Program to launch
    pub fn program(&self) -> PathBuf {
        self.program.clone().unwrap_or_else(|| {
            PathBuf::from(if cfg!(windows) {
                "soffice.exe"
            } else {
                "soffice"
            })
        })
    }

    /// Directory used for pipe endpoints
    pub fn pipe_dir(&self) -> PathBuf {
        match &self.transport {
            TransportSettings::Pipe { dir: Some(dir) } => dir.clone(),
            _ => std::env::temp_dir(),
        }
    }

    /// Endpoint for the next start. Pipe names are fresh on every call.
    pub fn next_endpoint(&self) -> Endpoint {
        match &self.transport {
            TransportSettings::Pipe { .. } => Endpoint::random_pipe(self.pipe_dir()),
            TransportSettings::Socket { host, port } => Endpoint::Socket {
                host: host.clone(),
                port: *port,
            },
        }
    }

    /// Full argument list: extra args, UI switches, then the accept argument
    pub fn command_args(&self, endpoint: &Endpoint) -> Vec<String> {
        let flags = if self.headless {
            HEADLESS_FLAGS
        } else {
            DESKTOP_FLAGS
        };

        self.extra_args
            .iter()
            .cloned()
            .chain(flags.iter().map(|f| (*f).to_string()))
            .chain(std::iter::once(endpoint.accept_arg()))
            .collect()
    }

    /// Settle delay for connections to `endpoint`
    pub fn settle_delay(&self, endpoint: &Endpoint) -> Duration {
        match endpoint {
            Endpoint::Pipe { .. } => Duration::ZERO,
            Endpoint::Socket { .. } => self.socket_close_settle,
        }
    }
}

impl BridgeConfig {
    /// Load from the first config file found, or defaults when there is none.
    ///
    /// Searches `./.office-bridge/config.toml` then `~/.office-bridge/config.toml`.
    /// Environment overrides are applied in both cases.
    pub fn load() -> Result<Self, ConfigError> {
        let mut candidates = vec![PathBuf::from(CONFIG_DIR).join("config.toml")];
        if let Some(home) = dirs::home_dir() {
            candidates.push(home.join(CONFIG_DIR).join("config.toml"));
        }

        let mut config = match candidates.iter().find(|p| p.is_file()) {
            Some(path) => Self::read(path)?,
            None => {
                debug!("No config file found, using defaults");
                Self::default()
            }
        };

        config.apply_overrides(&std::env::vars().collect());
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path, then apply environment overrides
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::read(path)?;
        config.apply_overrides(&std::env::vars().collect());
        config.validate()?;
        Ok(config)
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Apply `OFFICE_BRIDGE_*` overrides. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, vars: &HashMap<String, String>) {
        if let Some(program) = vars.get(ENV_PROGRAM).filter(|p| !p.is_empty()) {
            self.service.program = Some(PathBuf::from(program));
        }
        if let Some(capacity) = vars.get(ENV_CAPACITY) {
            match capacity.parse() {
                Ok(capacity) => self.pool.capacity = capacity,
                Err(e) => debug!(value = %capacity, error = %e, "Ignoring invalid capacity override"),
            }
        }
    }

    /// Reject values the pool and supervisor cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.capacity == 0 {
            return Err(ConfigError::Invalid("pool.capacity must be at least 1".to_string()));
        }
        if self.pool.probe_backoff_base > self.pool.probe_backoff_max {
            return Err(ConfigError::Invalid(
                "pool.probe_backoff_base exceeds pool.probe_backoff_max".to_string(),
            ));
        }
        if self.service.retry_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "service.retry_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serde helper for Duration as milliseconds (u64)
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
