//! CLI subcommand implementations.

pub mod call;
pub mod keys;
pub mod token;

use std::sync::Arc;

use ahs_core::keystore::read_root_key;
use ahs_core::{FileKeyStore, KeyRing};
use anyhow::{Context, Result};

use crate::config::Config;

/// Environment variable holding the root key password.
pub const PASSWORD_ENV: &str = "AHS_ROOT_KEY_PASSWORD";

/// Root key password from the environment, else an interactive prompt.
pub fn root_password(confirm: bool) -> Result<Vec<u8>> {
    if let Ok(pw) = std::env::var(PASSWORD_ENV) {
        return Ok(pw.into_bytes());
    }
    let mut prompt = dialoguer::Password::new().with_prompt("Root key password");
    if confirm {
        prompt = prompt.with_confirmation("Confirm password", "Passwords do not match");
    }
    let pw = prompt.interact().context("failed to read password")?;
    Ok(pw.into_bytes())
}

/// Open the configured root key and key store.
pub async fn open_ring(cfg: &Config, password: Vec<u8>) -> Result<KeyRing> {
    let path = cfg.root_key_path();
    let root = read_root_key(&path, Some(password.clone()))
        .await
        .with_context(|| format!("failed to load root key {}", path.display()))?;
    let store = FileKeyStore::open(cfg.key_store_path())
        .await
        .context("failed to open key store")?;
    Ok(KeyRing::new(root, Arc::new(store)).with_wrap_password(password, cfg.crypto.kdf_iterations))
}
