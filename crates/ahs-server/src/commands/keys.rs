//! `keys` namespace: per-owner derived public keys.

use std::sync::Arc;

use ahs_core::ecc::{serialize_public_key, PublicEncoding};
use ahs_core::{short_fingerprint, AhsResult, Identity, KeyRing};
use anyhow::Context;
use futures_util::FutureExt;
use serde_json::{json, Value};

use crate::dispatch::{BoundArgs, CommandRegistry, CommandSpec, ParamType};

pub const NAMESPACE: &str = "keys";

pub fn register(registry: &mut CommandRegistry, ring: Arc<KeyRing>) -> AhsResult<()> {
    registry.register(
        NAMESPACE,
        CommandSpec::one_shot("get_public_key", move |user, args| {
            get_public_key(ring.clone(), user, args).boxed()
        })
        .optional("index", ParamType::Int, json!(1)),
    )
}

async fn get_public_key(ring: Arc<KeyRing>, user: Identity, args: BoundArgs) -> anyhow::Result<Option<Value>> {
    let owner = user.owner().context("authentication required")?;
    let index: u32 = args.get("index").context("index must be a non-negative 32-bit integer")?;

    let key = ring.owner_key(owner, index).await?;
    let public = key.public_key();
    let pem = String::from_utf8(serialize_public_key(&public, PublicEncoding::Pem)?)?;
    let fingerprint = public.fingerprint();

    Ok(Some(json!({
        "index": index,
        "curve": ring.curve().name(),
        "public_key": pem,
        "fingerprint": fingerprint,
        "short_fingerprint": short_fingerprint(&fingerprint),
    })))
}
