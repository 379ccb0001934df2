// Configuration schema for the NAN control plane.
use std::{
    env, fmt, fs,
    io::{self, Read},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

/// Error returned while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error when reading a configuration file from disk.
    #[error("failed to read config '{path}': {source}")]
    Io {
        /// Path that failed to read.
        path: PathBuf,
        /// Source IO error.
        #[source]
        source: io::Error,
    },
    /// Error when parsing the configuration contents.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// The configuration did not pass validation checks.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// High-level configuration loaded at startup.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Bounds on blocking requests and serialized commands.
    pub timeouts: Timeouts,
    /// Concurrency policy variants.
    pub concurrency: Concurrency,
    /// Resource limits.
    pub limits: Limits,
    /// Channel sizing for the event runtime.
    pub runtime: RuntimeSettings,
}

impl Config {
    /// Loads configuration from `NANLINK_CONFIG` if set, otherwise returns defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match env::var("NANLINK_CONFIG") {
            Ok(path) => Self::from_path(path),
            Err(_missing) => {
                let cfg = Self::default();
                cfg.validate()?;
                Ok(cfg)
            }
        }
    }

    /// Loads a configuration file from the provided path.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Loads configuration from any reader implementing [`Read`].
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self, ConfigError> {
        let mut buf = String::new();
        reader
            .read_to_string(&mut buf)
            .map_err(|source| ConfigError::Io {
                path: PathBuf::from("<reader>"),
                source,
            })?;
        Self::from_toml_str(&buf)
    }

    /// Loads configuration from a TOML string slice.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        <Self as FromStr>::from_str(input)
    }

    /// Returns the SAP/NDP concurrency variant, honouring a `NANLINK_SAP_NDP` override.
    pub fn effective_sap_ndp(&self) -> SapNdpConcurrency {
        self.sap_ndp_with_override(env::var("NANLINK_SAP_NDP").ok().as_deref())
    }

    /// Applies an override value to `concurrency.sap_ndp`. Unparsable values are ignored.
    pub fn sap_ndp_with_override(&self, value: Option<&str>) -> SapNdpConcurrency {
        value
            .and_then(|value| SapNdpConcurrency::from_str(value).ok())
            .unwrap_or(self.concurrency.sap_ndp)
    }

    /// Validates the configuration, returning an error when constraints are violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timeouts.validate().map_err(ConfigError::Validation)?;
        self.limits.validate().map_err(ConfigError::Validation)?;
        self.runtime.validate().map_err(ConfigError::Validation)?;
        Ok(())
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Timeouts expressed in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Wait for the discovery enable response.
    pub enable_ms: u64,
    /// Wait for the discovery disable indication.
    pub disable_ms: u64,
    /// Wait for every NDP on an interface to end.
    pub end_all_ms: u64,
    /// Lifetime of an activated serialized command.
    pub command_ms: u64,
}

impl Timeouts {
    pub fn enable(&self) -> Duration {
        Duration::from_millis(self.enable_ms)
    }

    pub fn disable(&self) -> Duration {
        Duration::from_millis(self.disable_ms)
    }

    pub fn end_all(&self) -> Duration {
        Duration::from_millis(self.end_all_ms)
    }

    pub fn command(&self) -> Duration {
        Duration::from_millis(self.command_ms)
    }

    fn validate(&self) -> Result<(), String> {
        if self.enable_ms == 0 || self.disable_ms == 0 || self.end_all_ms == 0 {
            return Err("timeouts must be non-zero".into());
        }
        if self.command_ms == 0 {
            return Err("timeouts.command_ms must be non-zero".into());
        }
        Ok(())
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            enable_ms: DEFAULT_TIMEOUT_MS,
            disable_ms: DEFAULT_TIMEOUT_MS,
            end_all_ms: DEFAULT_TIMEOUT_MS,
            command_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

/// Whether NDPs may be set up while a SAP is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SapNdpConcurrency {
    /// NDP creation is refused while a SAP is active.
    #[default]
    Disallowed,
    /// NDP creation is allowed when the policy engine accepts the channel.
    Allowed,
}

impl FromStr for SapNdpConcurrency {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disallowed" | "off" | "false" => Ok(SapNdpConcurrency::Disallowed),
            "allowed" | "on" | "true" => Ok(SapNdpConcurrency::Allowed),
            other => Err(ConfigError::Validation(format!(
                "unknown sap_ndp mode '{other}'; expected disallowed or allowed"
            ))),
        }
    }
}

impl fmt::Display for SapNdpConcurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SapNdpConcurrency::Disallowed => f.write_str("disallowed"),
            SapNdpConcurrency::Allowed => f.write_str("allowed"),
        }
    }
}

/// Concurrency policy choices.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Concurrency {
    /// SAP + NDP concurrency variant.
    pub sap_ndp: SapNdpConcurrency,
    /// Multiple NDIs may be active at once, each mirrored into the policy engine.
    pub multi_ndi: bool,
}

impl Default for Concurrency {
    fn default() -> Self {
        Self {
            sap_ndp: SapNdpConcurrency::Disallowed,
            multi_ndi: true,
        }
    }
}

/// Resource limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Queued (not yet active) serialized commands per interface.
    pub max_pending_commands: usize,
    /// Peers tracked per NDI.
    pub max_peers_per_ndi: usize,
    /// Entries of the per-interface peer multicast list.
    pub max_peer_multicast: usize,
}

impl Limits {
    fn validate(&self) -> Result<(), String> {
        if self.max_pending_commands == 0 {
            return Err("limits.max_pending_commands must be > 0".into());
        }
        if self.max_peers_per_ndi == 0 {
            return Err("limits.max_peers_per_ndi must be > 0".into());
        }
        if self.max_peer_multicast == 0 {
            return Err("limits.max_peer_multicast must be > 0".into());
        }
        Ok(())
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_pending_commands: 16,
            max_peers_per_ndi: 8,
            max_peer_multicast: 8,
        }
    }
}

/// Event runtime sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub discovery_event_buffer: usize,
    pub datapath_event_buffer: usize,
    pub host_event_buffer: usize,
    pub shutdown_grace_ms: u64,
}

impl RuntimeSettings {
    fn validate(&self) -> Result<(), String> {
        if self.discovery_event_buffer == 0
            || self.datapath_event_buffer == 0
            || self.host_event_buffer == 0
        {
            return Err("runtime buffers must be non-zero".into());
        }
        Ok(())
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            discovery_event_buffer: 64,
            datapath_event_buffer: 256,
            host_event_buffer: 256,
            shutdown_grace_ms: 1000,
        }
    }
}

const DEFAULT_TIMEOUT_MS: u64 = 4000;
