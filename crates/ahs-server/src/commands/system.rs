//! `system` namespace: liveness and identity checks.

use ahs_core::{AhsResult, Identity};
use futures_util::FutureExt;
use serde_json::{json, Value};

use crate::dispatch::{CommandRegistry, CommandSpec};

pub const NAMESPACE: &str = "system";

pub fn register(registry: &mut CommandRegistry) -> AhsResult<()> {
    registry.register(
        NAMESPACE,
        CommandSpec::one_shot("ping", |_, _| async { Ok(Some(json!("pong"))) }.boxed()),
    )?;
    registry.register(
        NAMESPACE,
        CommandSpec::one_shot("whoami", |user, _| async move { Ok(Some(whoami(&user))) }.boxed()),
    )?;
    Ok(())
}

fn whoami(user: &Identity) -> Value {
    match user {
        Identity::Anonymous => json!({"authenticated": false, "owner": null, "token_id": null}),
        Identity::User { id, token_id, .. } => {
            json!({"authenticated": true, "owner": id, "token_id": token_id})
        }
    }
}
