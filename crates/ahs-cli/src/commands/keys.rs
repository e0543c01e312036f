//! `ahs create-root-key` and `ahs derive-key`.

use std::path::Path;

use ahs_core::ecc::{generate_private_key_async, serialize_public_key, PublicEncoding};
use ahs_core::keystore::write_root_key;
use ahs_core::{short_fingerprint, Curve, KeyRing};
use anyhow::{Context, Result};
use tracing::info;

use super::{open_ring, root_password};
use crate::config::{expand_tilde, Config};

/// Generate a password-protected root key. Refuses to overwrite.
pub async fn run_create_root(cfg: &Config, curve: Option<&str>, out: Option<&str>) -> Result<()> {
    let curve: Curve = curve.unwrap_or(&cfg.crypto.curve).parse()?;
    let path = match out {
        Some(out) => expand_tilde(Path::new(out)),
        None => cfg.root_key_path(),
    };
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }

    let password = root_password(true)?;
    let fingerprint = create_root(&path, curve, password, cfg.crypto.kdf_iterations).await?;

    println!("Generated {curve} root key");
    println!("  Path:        {}", path.display());
    println!("  Fingerprint: {fingerprint}");
    Ok(())
}

async fn create_root(path: &Path, curve: Curve, password: Vec<u8>, kdf_iterations: u32) -> Result<String> {
    let key = generate_private_key_async(curve).await?;
    write_root_key(path, &key, password, kdf_iterations)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    let fingerprint = key.public_key().fingerprint();
    info!(path = %path.display(), key = %short_fingerprint(&fingerprint), "root key created");
    Ok(fingerprint)
}

/// Derive (and persist) key `index` of `owner`, printing its public half.
pub async fn run_derive(cfg: &Config, owner: &str, index: u32) -> Result<()> {
    let ring = open_ring(cfg, root_password(false)?).await?;
    let (pem, fingerprint) = derive(&ring, owner, index).await?;

    println!("Key {index} of '{owner}' ({})", ring.curve());
    println!("  Fingerprint: {fingerprint}");
    print!("{pem}");
    Ok(())
}

async fn derive(ring: &KeyRing, owner: &str, index: u32) -> Result<(String, String)> {
    let key = ring
        .owner_key(owner, index)
        .await
        .with_context(|| format!("failed to derive key {index} for '{owner}'"))?;
    let public = key.public_key();
    let pem = String::from_utf8(serialize_public_key(&public, PublicEncoding::Pem)?)?;
    Ok((pem, public.fingerprint()))
}
