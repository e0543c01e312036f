//! Three-segment signed tokens.
//!
//! Format: `b64url(header_json).b64url(payload_json).b64url(signature)`
//! where the signature is ECDSA over the first two encoded segments joined
//! by a dot. Verification failures are collapsed into "no token" so callers
//! cannot distinguish a forged credential from a missing one.

use std::collections::BTreeMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::ecc::{Curve, PrivateKey, PublicKey};
use crate::error::{AhsError, AhsResult};

/// Log target for credential-tampering warnings.
pub const SECURITY_TARGET: &str = "ahs::security";

/// Default token lifetime (one day).
pub const DEFAULT_TOKEN_TTL: u64 = 86_400;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenHeader {
    /// Token id.
    pub tid: String,
    /// Unix seconds.
    pub created: u64,
    /// Unix seconds; the token is valid strictly before this instant.
    pub expires: u64,
    pub alg: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPayload {
    /// Owner id.
    pub sub: String,
    /// Session-binding key.
    pub skey: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub claims: BTreeMap<String, Value>,
}

/// A verified (or freshly issued) token.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub header: TokenHeader,
    pub payload: TokenPayload,
    pub signature: Vec<u8>,
    encoded: String,
}

impl Token {
    /// The wire form.
    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    pub fn owner(&self) -> &str {
        &self.payload.sub
    }

    pub fn id(&self) -> &str {
        &self.header.tid
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.header.expires
    }
}

/// Issues and verifies tokens with the process signing key.
#[derive(Clone)]
pub struct TokenCodec {
    signing_key: Option<PrivateKey>,
    public_key: PublicKey,
    ttl_secs: u64,
}

impl TokenCodec {
    pub fn new(signing_key: PrivateKey, ttl_secs: u64) -> Self {
        let public_key = signing_key.public_key();
        Self {
            signing_key: Some(signing_key),
            public_key,
            ttl_secs,
        }
    }

    /// A codec that can only verify.
    pub fn verifier(public_key: PublicKey) -> Self {
        Self {
            signing_key: None,
            public_key,
            ttl_secs: DEFAULT_TOKEN_TTL,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// Issue a token for `owner`. A fresh id is generated when `token_id` is `None`.
    pub fn create(&self, owner: &str, token_id: Option<&str>) -> AhsResult<Token> {
        self.create_with_claims(owner, token_id, BTreeMap::new())
    }

    pub fn create_with_claims(
        &self,
        owner: &str,
        token_id: Option<&str>,
        claims: BTreeMap<String, Value>,
    ) -> AhsResult<Token> {
        let signing_key = self
            .signing_key
            .as_ref()
            .ok_or_else(|| AhsError::Token("codec has no signing key".into()))?;

        let now = unix_now();
        let header = TokenHeader {
            tid: token_id.map(str::to_string).unwrap_or_else(random_id),
            created: now,
            expires: now.saturating_add(self.ttl_secs),
            alg: signing_key.curve().signature_alg().to_string(),
        };
        let payload = TokenPayload {
            sub: owner.to_string(),
            skey: random_id(),
            claims,
        };

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload)?)
        );
        let signature = signing_key.sign(signing_input.as_bytes())?;
        let encoded = format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(&signature));

        Ok(Token {
            header,
            payload,
            signature,
            encoded,
        })
    }

    /// Parse and verify a raw token string.
    ///
    /// Absent input is `None` silently; malformed, forged or expired input is
    /// `None` after a single generic warning on [`SECURITY_TARGET`].
    pub fn from_request(&self, raw: Option<&str>) -> Option<Token> {
        let raw = raw?;
        match self.verify_at(raw, unix_now()) {
            Ok(token) => Some(token),
            Err(_) => {
                warn!(target: SECURITY_TARGET, "possible token manipulation detected");
                None
            }
        }
    }

    fn verify_at(&self, raw: &str, now: u64) -> AhsResult<Token> {
        let segments: Vec<&str> = raw.split('.').collect();
        let [h, p, s] = segments.as_slice() else {
            return Err(AhsError::Token("expected three segments".into()));
        };
        if h.is_empty() || p.is_empty() || s.is_empty() {
            return Err(AhsError::Token("empty segment".into()));
        }

        let header: TokenHeader = serde_json::from_slice(&decode_segment(h)?)?;
        let payload: TokenPayload = serde_json::from_slice(&decode_segment(p)?)?;
        let signature = decode_segment(s)?;

        if Curve::from_signature_alg(&header.alg) != Some(self.public_key.curve()) {
            return Err(AhsError::Token("algorithm mismatch".into()));
        }

        let signing_input = format!("{h}.{p}");
        if !self.public_key.verify(signing_input.as_bytes(), &signature) {
            return Err(AhsError::Token("bad signature".into()));
        }

        let token = Token {
            header,
            payload,
            signature,
            encoded: raw.to_string(),
        };
        if token.is_expired_at(now) {
            return Err(AhsError::Token("expired".into()));
        }
        Ok(token)
    }
}

fn decode_segment(segment: &str) -> AhsResult<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| AhsError::Token(e.to_string()))
}

fn random_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
