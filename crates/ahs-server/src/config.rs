//! Server configuration: TOML file + CLI overrides.

use ahs_core::{AhsError, AhsResult, Curve};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::commands::bookmarks::{Bookmark, Category};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub channels: ChannelsSection,
    #[serde(default)]
    pub crypto: CryptoSection,
    #[serde(default)]
    pub commands: CommandsSection,
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub bookmarks: Vec<Bookmark>,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub cert: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "default_true")]
    pub require_authentication: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            cert: None,
            key: None,
            max_frame_bytes: default_max_frame_bytes(),
            require_authentication: true,
        }
    }
}

/// `[channels]` section: demultiplexer and channel layer.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelsSection {
    #[serde(default = "default_true")]
    pub demultiplex: bool,
    #[serde(default = "default_streams")]
    pub streams: Vec<String>,
    #[serde(default = "default_close_timeout")]
    pub close_timeout_secs: u64,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for ChannelsSection {
    fn default() -> Self {
        Self {
            demultiplex: true,
            streams: default_streams(),
            close_timeout_secs: default_close_timeout(),
            capacity: default_capacity(),
        }
    }
}

/// `[crypto]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct CryptoSection {
    #[serde(default = "default_curve")]
    pub curve: String,
    #[serde(default = "default_root_key")]
    pub root_key: String,
    #[serde(default = "default_key_store")]
    pub key_store: String,
    #[serde(default = "default_ttl")]
    pub token_ttl: u64,
    #[serde(default = "default_ttl")]
    pub session_max_age: u64,
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
}

impl Default for CryptoSection {
    fn default() -> Self {
        Self {
            curve: default_curve(),
            root_key: default_root_key(),
            key_store: default_key_store(),
            token_ttl: default_ttl(),
            session_max_age: default_ttl(),
            kdf_iterations: default_kdf_iterations(),
        }
    }
}

/// `[commands]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandsSection {
    #[serde(default = "default_namespaces")]
    pub namespaces: Vec<String>,
}

impl Default for CommandsSection {
    fn default() -> Self {
        Self {
            namespaces: default_namespaces(),
        }
    }
}

fn default_port() -> u16 {
    8420
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_max_frame_bytes() -> usize {
    1_048_576
}
fn default_true() -> bool {
    true
}
fn default_streams() -> Vec<String> {
    vec!["commands".to_string()]
}
fn default_close_timeout() -> u64 {
    5
}
fn default_capacity() -> usize {
    64
}
fn default_curve() -> String {
    "secp521r1".to_string()
}
fn default_root_key() -> String {
    "~/.ahs/root.private.pem".to_string()
}
fn default_key_store() -> String {
    "~/.ahs/keys".to_string()
}
fn default_ttl() -> u64 {
    86400
}
fn default_kdf_iterations() -> u32 {
    100_000
}
fn default_namespaces() -> Vec<String> {
    ["bookmarks", "system", "keys"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Values given on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub port: Option<u16>,
    pub bind: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub curve: Option<String>,
    pub allow_anonymous: bool,
    pub ephemeral_keys: bool,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub max_frame_bytes: usize,
    pub require_authentication: bool,
    pub demultiplex: bool,
    pub streams: Vec<String>,
    pub close_timeout: Duration,
    /// Bound of every channel-layer channel and connection outbound queue.
    pub channel_capacity: usize,
    pub curve: Curve,
    pub root_key_path: PathBuf,
    pub key_store_path: PathBuf,
    pub token_ttl: u64,
    pub session_max_age: u64,
    pub kdf_iterations: u32,
    pub namespaces: Vec<String>,
    /// Generate an in-memory root key instead of loading one.
    pub ephemeral_keys: bool,
    pub categories: Vec<Category>,
    pub bookmarks: Vec<Bookmark>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: Overrides) -> AhsResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_config(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, overrides)
    }

    /// Merge a parsed file with CLI overrides.
    pub fn resolve(file: ConfigFile, overrides: Overrides) -> AhsResult<Self> {
        let curve: Curve = overrides
            .curve
            .as_deref()
            .unwrap_or(file.crypto.curve.as_str())
            .parse()?;

        if file.channels.demultiplex && file.channels.streams.is_empty() {
            return Err(AhsError::Other(
                "config: [channels] streams must not be empty when demultiplexing".into(),
            ));
        }

        Ok(Self {
            port: overrides.port.unwrap_or(file.server.port),
            bind: overrides.bind.unwrap_or(file.server.bind),
            cert_path: overrides.cert.or(file.server.cert).map(|s| expand_tilde_str(&s)),
            key_path: overrides.key.or(file.server.key).map(|s| expand_tilde_str(&s)),
            max_frame_bytes: file.server.max_frame_bytes,
            require_authentication: file.server.require_authentication && !overrides.allow_anonymous,
            demultiplex: file.channels.demultiplex,
            streams: file.channels.streams,
            close_timeout: Duration::from_secs(file.channels.close_timeout_secs),
            channel_capacity: file.channels.capacity.max(1),
            curve,
            root_key_path: expand_tilde_str(&file.crypto.root_key),
            key_store_path: expand_tilde_str(&file.crypto.key_store),
            token_ttl: file.crypto.token_ttl,
            session_max_age: file.crypto.session_max_age,
            kdf_iterations: file.crypto.kdf_iterations,
            namespaces: file.commands.namespaces,
            ephemeral_keys: overrides.ephemeral_keys,
            categories: file.categories,
            bookmarks: file.bookmarks,
        })
    }

    pub fn tls_enabled(&self) -> bool {
        self.cert_path.is_some() && self.key_path.is_some()
    }
}

pub fn parse_config(content: &str) -> AhsResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| AhsError::Other(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

pub fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
