//! Server configuration: TOML file + CLI overrides.

use frontgate_core::cache::DEFAULT_MAX_ENTRIES;
use frontgate_core::frame::DEFAULT_MAX_MESSAGE_SIZE;
use frontgate_core::{CipherMode, GateError, GateResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub cipher: CipherSection,
    #[serde(default)]
    pub tunnel: TunnelSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub websocket: WebSocketSection,
    #[serde(default)]
    pub log: LogSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Binary protocol port.
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_websocket_port")]
    pub websocket_port: u16,
    /// Hard deadline (seconds) for each read while parsing a front-end protocol.
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            websocket_port: default_websocket_port(),
            read_timeout: default_read_timeout(),
        }
    }
}

/// `[cipher]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CipherSection {
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub mode: CipherMode,
}

/// `[tunnel]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelSection {
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: u64,
    #[serde(default = "default_read_timeout")]
    pub idle_timeout: u64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            dial_timeout: default_dial_timeout(),
            idle_timeout: default_read_timeout(),
            buffer_size: default_buffer_size(),
        }
    }
}

/// `[cache]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
        }
    }
}

/// `[websocket]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketSection {
    #[serde(default = "default_max_message_size")]
    pub max_message_size: u64,
}

impl Default for WebSocketSection {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
        }
    }
}

/// `[log]` section of the config TOML. Unset paths disable the file sink.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogSection {
    pub info_path: Option<String>,
    pub error_path: Option<String>,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    4399
}
fn default_websocket_port() -> u16 {
    4398
}
fn default_read_timeout() -> u64 {
    30
}
fn default_dial_timeout() -> u64 {
    5
}
fn default_buffer_size() -> usize {
    8192
}
fn default_max_entries() -> usize {
    DEFAULT_MAX_ENTRIES
}
fn default_max_message_size() -> u64 {
    DEFAULT_MAX_MESSAGE_SIZE
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub websocket_port: u16,
    pub read_timeout: Duration,
    pub secret: String,
    pub cipher_mode: CipherMode,
    pub dial_timeout: Duration,
    pub idle_timeout: Duration,
    pub buffer_size: usize,
    pub cache_max_entries: usize,
    pub max_message_size: u64,
    pub info_log: Option<PathBuf>,
    pub error_log: Option<PathBuf>,
    /// File the values were read from; `None` when running on defaults.
    pub source: Option<PathBuf>,
}

/// Values given on the command line; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub websocket_port: Option<u16>,
    pub secret: Option<String>,
    pub cipher_mode: Option<CipherMode>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> GateResult<Self> {
        let source = config_path.map(expand_tilde).filter(|p| p.exists());
        let file_config = match &source {
            Some(path) => parse(&std::fs::read_to_string(path)?)?,
            None => ConfigFile::default(),
        };

        let mut config = Self::from_file(file_config, cli)?;
        config.source = source;
        Ok(config)
    }

    /// Merge a parsed file with CLI overrides and validate the result.
    pub fn from_file(file: ConfigFile, cli: CliOverrides) -> GateResult<Self> {
        let port = cli.port.unwrap_or(non_zero(file.server.port, default_port()));
        let websocket_port = cli
            .websocket_port
            .unwrap_or(non_zero(file.server.websocket_port, default_websocket_port()));
        let secret = cli.secret.unwrap_or(file.cipher.secret);
        let cipher_mode = cli.cipher_mode.unwrap_or(file.cipher.mode);

        if secret.is_empty() {
            return Err(GateError::Config(
                "cipher secret is empty; set [cipher] secret or --secret".into(),
            ));
        }
        if file.tunnel.buffer_size == 0 {
            return Err(GateError::Config("tunnel buffer_size must be non-zero".into()));
        }
        for (name, secs) in [
            ("server.read_timeout", file.server.read_timeout),
            ("tunnel.dial_timeout", file.tunnel.dial_timeout),
            ("tunnel.idle_timeout", file.tunnel.idle_timeout),
        ] {
            if secs == 0 {
                return Err(GateError::Config(format!("{name} must be at least 1 second")));
            }
        }

        Ok(Self {
            bind: file.server.bind,
            port,
            websocket_port,
            read_timeout: Duration::from_secs(file.server.read_timeout),
            secret,
            cipher_mode,
            dial_timeout: Duration::from_secs(file.tunnel.dial_timeout),
            idle_timeout: Duration::from_secs(file.tunnel.idle_timeout),
            buffer_size: file.tunnel.buffer_size,
            cache_max_entries: file.cache.max_entries,
            max_message_size: file.websocket.max_message_size,
            info_log: file.log.info_path.as_deref().map(expand_tilde_str),
            error_log: file.log.error_path.as_deref().map(expand_tilde_str),
            source: None,
        })
    }
}

/// Parse TOML text into a [`ConfigFile`].
pub fn parse(content: &str) -> GateResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| GateError::Config(format!("config parse error: {e}")))
}

fn non_zero(port: u16, fallback: u16) -> u16 {
    if port == 0 {
        fallback
    } else {
        port
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
