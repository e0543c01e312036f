//! `ahs issue-token` / `ahs verify-token`.

use ahs_core::token::Token;
use ahs_core::{KeyRing, TokenCodec};
use anyhow::Result;
use tracing::info;

use super::{open_ring, root_password};
use crate::config::Config;

pub async fn run_issue(cfg: &Config, owner: &str, token_id: Option<&str>) -> Result<()> {
    let ring = open_ring(cfg, root_password(false)?).await?;
    let token = issue(&ring, cfg.crypto.token_ttl, owner, token_id)?;
    info!(owner, token_id = %token.id(), expires = token.header.expires, "token issued");
    println!("{}", token.as_str());
    Ok(())
}

pub async fn run_verify(cfg: &Config, raw: &str) -> Result<()> {
    let ring = open_ring(cfg, root_password(false)?).await?;
    let Some(token) = verify(&ring, cfg.crypto.token_ttl, raw)? else {
        anyhow::bail!("token rejected");
    };
    println!("Token valid");
    println!("  Owner:    {}", token.owner());
    println!("  Token id: {}", token.id());
    println!("  Created:  {}", token.header.created);
    println!("  Expires:  {}", token.header.expires);
    Ok(())
}

fn issue(ring: &KeyRing, ttl: u64, owner: &str, token_id: Option<&str>) -> Result<Token> {
    let codec = TokenCodec::new(ring.signing_key()?, ttl);
    Ok(codec.create(owner, token_id)?)
}

fn verify(ring: &KeyRing, ttl: u64, raw: &str) -> Result<Option<Token>> {
    let codec = TokenCodec::new(ring.signing_key()?, ttl);
    Ok(codec.from_request(Some(raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahs_core::ecc::generate_private_key;
    use ahs_core::{Curve, MemoryKeyStore};
    use std::sync::Arc;

    fn ring() -> KeyRing {
        KeyRing::new(generate_private_key(Curve::Secp256r1), Arc::new(MemoryKeyStore::new()))
    }

    #[test]
    fn issued_token_verifies_under_same_root_only() {
        let ring = ring();
        let token = issue(&ring, 3600, "7", Some("t-1")).unwrap();
        assert_eq!(token.id(), "t-1");

        let back = verify(&ring, 3600, token.as_str()).unwrap().unwrap();
        assert_eq!(back.owner(), "7");

        let other = self::ring();
        assert!(verify(&other, 3600, token.as_str()).unwrap().is_none());
        assert!(verify(&ring, 3600, "a.b.c").unwrap().is_none());
    }
}
