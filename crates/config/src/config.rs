//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Values parsed but are not usable together
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Media library configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaConfig {
    /// Directory holding raw videos and prepared `_stream` directories
    #[serde(default = "default_media_root")]
    pub root: PathBuf,
    /// Allow-listed extensions, without the leading dot
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

fn default_media_root() -> PathBuf {
    PathBuf::from("static/movies")
}

fn default_extensions() -> Vec<String> {
    ["mp4", "webm", "ogg", "mov"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            root: default_media_root(),
            extensions: default_extensions(),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Host the media server binds to
    #[serde(default = "default_host")]
    pub host: String,
    /// First port probed (inclusive)
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    /// Last port probed (inclusive)
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
    /// Address of the JSON control API
    #[serde(default = "default_control_addr")]
    pub control_addr: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port_range_start() -> u16 {
    8000
}

fn default_port_range_end() -> u16 {
    8100
}

fn default_control_addr() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            control_addr: default_control_addr(),
        }
    }
}

/// External encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Encoder binary, looked up on PATH unless absolute
    #[serde(default = "default_encoder_program")]
    pub program: String,
    /// Target HLS segment length in seconds
    #[serde(default = "default_segment_duration_secs")]
    pub segment_duration_secs: u32,
    /// Wall-clock limit for a single encoder run (0 = unlimited)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum concurrent encoder processes (0 = auto-derive)
    #[serde(default)]
    pub max_concurrent_jobs: u32,
}

fn default_encoder_program() -> String {
    "ffmpeg".to_string()
}

fn default_segment_duration_secs() -> u32 {
    4
}

fn default_timeout_secs() -> u64 {
    3600
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: default_encoder_program(),
            segment_duration_secs: default_segment_duration_secs(),
            timeout_secs: default_timeout_secs(),
            max_concurrent_jobs: 0,
        }
    }
}

/// Public tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelConfig {
    /// Whether to attempt opening a public tunnel at startup
    #[serde(default)]
    pub enabled: bool,
    /// Tunnel agent binary
    #[serde(default = "default_tunnel_program")]
    pub program: String,
    /// Local agent API listing the opened tunnels
    #[serde(default = "default_tunnel_api_url")]
    pub api_url: String,
    /// How long to wait for the agent to report a public URL
    #[serde(default = "default_tunnel_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
}

fn default_tunnel_program() -> String {
    "ngrok".to_string()
}

fn default_tunnel_api_url() -> String {
    "http://127.0.0.1:4040/api/tunnels".to_string()
}

fn default_tunnel_startup_timeout_secs() -> u64 {
    15
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            program: default_tunnel_program(),
            api_url: default_tunnel_api_url(),
            startup_timeout_secs: default_tunnel_startup_timeout_secs(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - MEDIA_ROOT -> media.root
    /// - SERVER_HOST -> server.host
    /// - SERVER_PORT_RANGE_START -> server.port_range_start
    /// - SERVER_PORT_RANGE_END -> server.port_range_end
    /// - ENCODER_PROGRAM -> encoder.program
    /// - ENCODER_SEGMENT_DURATION_SECS -> encoder.segment_duration_secs
    /// - ENCODER_MAX_CONCURRENT_JOBS -> encoder.max_concurrent_jobs
    /// - TUNNEL_ENABLED -> tunnel.enabled
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("MEDIA_ROOT") {
            if !val.is_empty() {
                self.media.root = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("SERVER_HOST") {
            if !val.is_empty() {
                self.server.host = val;
            }
        }

        if let Ok(val) = env::var("SERVER_PORT_RANGE_START") {
            if let Ok(port) = val.parse::<u16>() {
                self.server.port_range_start = port;
            }
        }

        if let Ok(val) = env::var("SERVER_PORT_RANGE_END") {
            if let Ok(port) = val.parse::<u16>() {
                self.server.port_range_end = port;
            }
        }

        if let Ok(val) = env::var("ENCODER_PROGRAM") {
            if !val.is_empty() {
                self.encoder.program = val;
            }
        }

        if let Ok(val) = env::var("ENCODER_SEGMENT_DURATION_SECS") {
            if let Ok(secs) = val.parse::<u32>() {
                self.encoder.segment_duration_secs = secs;
            }
        }

        if let Ok(val) = env::var("ENCODER_MAX_CONCURRENT_JOBS") {
            if let Ok(jobs) = val.parse::<u32>() {
                self.encoder.max_concurrent_jobs = jobs;
            }
        }

        if let Ok(val) = env::var("TUNNEL_ENABLED") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.tunnel.enabled = true,
                "false" | "0" | "no" => self.tunnel.enabled = false,
                _ => {} // Invalid value, keep existing
            }
        }
    }

    /// Check that the values can be used together
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port_range_start > self.server.port_range_end {
            return Err(ConfigError::Invalid(format!(
                "port range {}-{} is inverted",
                self.server.port_range_start, self.server.port_range_end
            )));
        }
        if self.encoder.segment_duration_secs == 0 {
            return Err(ConfigError::Invalid(
                "encoder.segment_duration_secs must be at least 1".to_string(),
            ));
        }
        if self
            .server
            .control_addr
            .parse::<std::net::SocketAddr>()
            .is_err()
        {
            return Err(ConfigError::Invalid(format!(
                "server.control_addr '{}' is not a socket address",
                self.server.control_addr
            )));
        }
        if self.media.extensions.iter().all(|e| e.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "media.extensions must list at least one extension".to_string(),
            ));
        }
        Ok(())
    }

    /// Extensions lower-cased with any leading dot removed
    pub fn normalized_extensions(&self) -> Vec<String> {
        self.media
            .extensions
            .iter()
            .map(|e| e.trim().trim_start_matches('.').to_lowercase())
            .filter(|e| !e.is_empty())
            .collect()
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file means "all defaults"
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}
