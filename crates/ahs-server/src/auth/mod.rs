//! Connect pipeline.
//!
//! An explicit, ordered list of stages run against the [`Scope`] before the
//! socket is handed to an application. Stages never reject a connection on
//! bad credentials; they leave the scope anonymous and let the application
//! decide.

pub mod identity;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use ahs_core::{AhsResult, SessionCodec};
use tracing::debug;

use crate::scope::{Scope, SESSION_COOKIE};
pub use identity::{IdentityProvider, TokenIdentityProvider};

/// One named step of the connect pipeline.
pub trait ConnectStage: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply<'a>(&'a self, scope: &'a mut Scope) -> Pin<Box<dyn Future<Output = AhsResult<()>> + Send + 'a>>;
}

#[derive(Default)]
pub struct ConnectPipeline {
    stages: Vec<Box<dyn ConnectStage>>,
}

impl ConnectPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, stage: impl ConnectStage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub async fn run(&self, scope: &mut Scope) -> AhsResult<()> {
        for stage in &self.stages {
            stage.apply(scope).await?;
            debug!(stage = stage.name(), "connect stage complete");
        }
        Ok(())
    }
}

/// Resolves `scope.identity` through an [`IdentityProvider`].
pub struct Authenticate {
    provider: Arc<dyn IdentityProvider>,
}

impl Authenticate {
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        Self { provider }
    }
}

impl ConnectStage for Authenticate {
    fn name(&self) -> &'static str {
        "authenticate"
    }

    fn apply<'a>(&'a self, scope: &'a mut Scope) -> Pin<Box<dyn Future<Output = AhsResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let identity = self.provider.identify_async(scope).await;
            scope.identity = identity;
            Ok(())
        })
    }
}

/// Opens the session cookie and attaches it when bound to the caller's token.
pub struct AttachSession {
    codec: SessionCodec,
}

impl AttachSession {
    pub fn new(codec: SessionCodec) -> Self {
        Self { codec }
    }
}

impl ConnectStage for AttachSession {
    fn name(&self) -> &'static str {
        "attach_session"
    }

    fn apply<'a>(&'a self, scope: &'a mut Scope) -> Pin<Box<dyn Future<Output = AhsResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let Some(blob) = scope.cookie(SESSION_COOKIE).map(str::to_string) else {
                return Ok(());
            };
            let codec = self.codec.clone();
            let session = tokio::task::spawn_blocking(move || codec.open(&blob))
                .await
                .ok()
                .flatten();

            match (session, scope.identity.session_key()) {
                (Some(session), Some(key)) if session.is_bound_to(key) => {
                    scope.session = Some(session);
                }
                (Some(_), _) => debug!("session not bound to this token, ignoring"),
                (None, _) => {}
            }
            Ok(())
        })
    }
}
