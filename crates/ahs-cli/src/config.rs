//! CLI configuration, read from the same `~/.ahs/config.toml` the server
//! uses. Only `[crypto]` and `[client]` matter here; other sections are
//! ignored.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CryptoConfig {
    #[serde(default = "default_curve")]
    pub curve: String,
    #[serde(default = "default_root_key")]
    pub root_key: String,
    #[serde(default = "default_key_store")]
    pub key_store: String,
    #[serde(default = "default_ttl")]
    pub token_ttl: u64,
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            curve: default_curve(),
            root_key: default_root_key(),
            key_store: default_key_store(),
            token_ttl: default_ttl(),
            kdf_iterations: default_kdf_iterations(),
        }
    }
}

/// Defaults for `ahs call`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Logical stream to frame requests for; empty sends bare frames.
    #[serde(default = "default_stream")]
    pub stream: String,
    /// Seconds of silence after which `call` stops waiting.
    #[serde(default = "default_wait")]
    pub wait_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            stream: default_stream(),
            wait_secs: default_wait(),
        }
    }
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
fn default_stream() -> String {
    "commands".to_string()
}
fn default_wait() -> u64 {
    2
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let path = expand_tilde(path);
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn root_key_path(&self) -> PathBuf {
        expand_tilde(Path::new(&self.crypto.root_key))
    }

    pub fn key_store_path(&self) -> PathBuf {
        expand_tilde(Path::new(&self.crypto.key_store))
    }
}

/// Expand `~/` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shares_the_server_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[server]
port = 9000

[crypto]
curve = "secp256r1"
root_key = "/srv/ahs/root.pem"

[client]
wait_secs = 5
"#,
        )
        .unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.crypto.curve, "secp256r1");
        assert_eq!(cfg.root_key_path(), PathBuf::from("/srv/ahs/root.pem"));
        assert_eq!(cfg.crypto.kdf_iterations, 100_000);
        assert_eq!(cfg.client.wait_secs, 5);
        assert_eq!(cfg.client.stream, "commands");
    }

    #[test]
    fn missing_file_gives_defaults() {
        let cfg = Config::load(Path::new("/nonexistent/ahs/config.toml")).unwrap();
        assert_eq!(cfg.crypto.token_ttl, 86400);
        assert_eq!(cfg.client.wait_secs, 2);
    }

    #[test]
    fn tilde_expands_to_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/.ahs/keys")), home.join(".ahs/keys"));
        }
        assert_eq!(expand_tilde(Path::new("/abs")), PathBuf::from("/abs"));
    }
}
