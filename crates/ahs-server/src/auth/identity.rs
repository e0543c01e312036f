//! Identity providers: turn request metadata into a principal.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use ahs_core::token::Token;
use ahs_core::{Identity, TokenCodec};
use tracing::error;

use crate::scope::Scope;

/// Resolves the acting principal for a connection.
pub trait IdentityProvider: Send + Sync {
    fn identify(&self, scope: &Scope) -> Identity;

    /// Suspend-capable variant; must not block the runtime.
    fn identify_async<'a>(&'a self, scope: &'a Scope) -> Pin<Box<dyn Future<Output = Identity> + Send + 'a>>;
}

/// Identifies users by the signed token they present.
pub struct TokenIdentityProvider {
    codec: Arc<TokenCodec>,
}

impl TokenIdentityProvider {
    pub fn new(codec: Arc<TokenCodec>) -> Self {
        Self { codec }
    }
}

fn identity_from(token: Option<Token>) -> Identity {
    match token {
        Some(t) => Identity::user(t.payload.sub, t.header.tid, t.payload.skey),
        None => Identity::Anonymous,
    }
}

impl IdentityProvider for TokenIdentityProvider {
    fn identify(&self, scope: &Scope) -> Identity {
        identity_from(self.codec.from_request(scope.credential()))
    }

    fn identify_async<'a>(&'a self, scope: &'a Scope) -> Pin<Box<dyn Future<Output = Identity> + Send + 'a>> {
        let raw = scope.credential().map(str::to_string);
        let codec = self.codec.clone();
        Box::pin(async move {
            if raw.is_none() {
                return Identity::Anonymous;
            }
            match tokio::task::spawn_blocking(move || codec.from_request(raw.as_deref())).await {
                Ok(token) => identity_from(token),
                Err(e) => {
                    error!(error = %e, "token verification task failed");
                    Identity::Anonymous
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahs_core::ecc::generate_private_key;
    use ahs_core::Curve;

    fn scope_with_token(token: &str) -> Scope {
        let auth = format!("Bearer {token}");
        Scope::from_parts("/ws/", None, [("authorization", auth.as_str())], None).unwrap()
    }

    #[tokio::test]
    async fn valid_token_identifies_user() {
        let codec = Arc::new(TokenCodec::new(generate_private_key(Curve::Secp256r1), 60));
        let token = codec.create("7", Some("tid-1")).unwrap();
        let provider = TokenIdentityProvider::new(codec);
        let scope = scope_with_token(token.as_str());

        let sync = provider.identify(&scope);
        let async_ = provider.identify_async(&scope).await;
        assert_eq!(sync, async_);
        assert_eq!(sync.owner(), Some("7"));
        assert_eq!(sync.session_key(), Some(token.payload.skey.as_str()));
    }

    #[tokio::test]
    async fn bad_or_missing_token_is_anonymous() {
        let codec = Arc::new(TokenCodec::new(generate_private_key(Curve::Secp256r1), 60));
        let provider = TokenIdentityProvider::new(codec);

        let scope = scope_with_token("abc.def");
        assert_eq!(provider.identify_async(&scope).await, Identity::Anonymous);

        let scope = Scope::from_parts("/ws/", None, Vec::<(&str, &str)>::new(), None).unwrap();
        assert_eq!(provider.identify(&scope), Identity::Anonymous);
    }
}
