//! Encrypted session payloads.
//!
//! A session is a JSON object sealed to the server key with an ephemeral
//! ECDH key pair:
//!
//! ```text
//! b64url( ephemeral_public_x962 || nonce(16) || ciphertext || tag(16) )
//! ```
//!
//! The sealed object carries `_timestamp` (unix seconds) and an optional
//! `_binding`; both are stripped again by [`SessionCodec::open`].

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{Map, Value};
use tracing::debug;

use crate::ecc::{self, generate_private_key, PrivateKey, PublicKey};
use crate::error::{AhsError, AhsResult};
use crate::token::unix_now;

const TIMESTAMP_KEY: &str = "_timestamp";
const BINDING_KEY: &str = "_binding";

/// Default maximum session age (one day).
pub const DEFAULT_SESSION_MAX_AGE: u64 = 86_400;

/// Decrypted session contents.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub data: Map<String, Value>,
    pub issued_at: u64,
    /// Token session key this session is bound to, if any.
    pub binding: Option<String>,
}

impl Session {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Whether this session may be attached for a holder of `session_key`.
    pub fn is_bound_to(&self, session_key: &str) -> bool {
        self.binding.as_deref() == Some(session_key)
    }
}

#[derive(Clone)]
pub struct SessionCodec {
    server_key: PrivateKey,
    server_public: PublicKey,
    max_age: u64,
}

impl SessionCodec {
    pub fn new(server_key: PrivateKey, max_age: u64) -> Self {
        let server_public = server_key.public_key();
        Self {
            server_key,
            server_public,
            max_age,
        }
    }

    pub fn max_age(&self) -> u64 {
        self.max_age
    }

    /// Seal `data`, optionally bound to a token session key.
    pub fn seal(&self, data: &Map<String, Value>, binding: Option<&str>) -> AhsResult<String> {
        self.seal_at(data, binding, unix_now())
    }

    fn seal_at(&self, data: &Map<String, Value>, binding: Option<&str>, now: u64) -> AhsResult<String> {
        let mut body = data.clone();
        body.insert(TIMESTAMP_KEY.into(), Value::from(now));
        if let Some(b) = binding {
            body.insert(BINDING_KEY.into(), Value::from(b));
        }
        let plaintext = serde_json::to_vec(&body)?;

        let ephemeral = generate_private_key(self.server_key.curve());
        let sealed = ecc::encrypt(&plaintext, &ephemeral, &self.server_public)?;

        let mut out = ephemeral.public_key().to_x962();
        out.extend_from_slice(&sealed);
        Ok(URL_SAFE_NO_PAD.encode(out))
    }

    /// Open a sealed session. Malformed, tampered or expired input is `None`.
    pub fn open(&self, blob: &str) -> Option<Session> {
        match self.open_at(blob, unix_now()) {
            Ok(session) => Some(session),
            Err(e) => {
                debug!(error = %e, "discarding session payload");
                None
            }
        }
    }

    fn open_at(&self, blob: &str, now: u64) -> AhsResult<Session> {
        let raw = URL_SAFE_NO_PAD
            .decode(blob)
            .map_err(|e| AhsError::InvalidMessage(e.to_string()))?;

        let point_len = self.server_key.curve().point_len();
        if raw.len() <= point_len {
            return Err(AhsError::InvalidMessage("session payload too short".into()));
        }
        let (point, sealed) = raw.split_at(point_len);
        let ephemeral = PublicKey::from_x962(point)?;
        let plaintext = ecc::decrypt(sealed, &self.server_key, &ephemeral)?;

        let Value::Object(mut data) = serde_json::from_slice::<Value>(&plaintext)? else {
            return Err(AhsError::InvalidMessage("session is not an object".into()));
        };

        let issued_at = data
            .remove(TIMESTAMP_KEY)
            .and_then(|v| v.as_u64())
            .ok_or_else(|| AhsError::InvalidMessage("session has no timestamp".into()))?;
        if now.saturating_sub(issued_at) > self.max_age {
            return Err(AhsError::InvalidMessage("session expired".into()));
        }

        let binding = match data.remove(BINDING_KEY) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        };

        Ok(Session {
            data,
            issued_at,
            binding,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecc::Curve;
    use serde_json::json;

    fn codec() -> SessionCodec {
        SessionCodec::new(generate_private_key(Curve::Secp256r1), 60)
    }

    fn sample() -> Map<String, Value> {
        json!({"theme": "dark", "page": 3}).as_object().cloned().unwrap()
    }

    #[test]
    fn seal_and_open() {
        let codec = codec();
        let blob = codec.seal(&sample(), Some("skey-1")).unwrap();
        let session = codec.open(&blob).unwrap();
        assert_eq!(session.data, sample());
        assert!(session.is_bound_to("skey-1"));
        assert!(!session.is_bound_to("skey-2"));
    }

    #[test]
    fn unbound_session() {
        let codec = codec();
        let session = codec.open(&codec.seal(&sample(), None).unwrap()).unwrap();
        assert_eq!(session.binding, None);
        assert!(!session.is_bound_to(""));
    }

    #[test]
    fn expired_session_is_none() {
        let codec = codec();
        let blob = codec.seal_at(&sample(), None, 1_000).unwrap();
        assert!(codec.open_at(&blob, 1_060).is_ok());
        assert!(codec.open_at(&blob, 1_061).is_err());
    }

    #[test]
    fn tampered_or_foreign_is_none() {
        let codec = codec();
        let blob = codec.seal(&sample(), None).unwrap();

        let mut raw = URL_SAFE_NO_PAD.decode(&blob).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x80;
        assert!(codec.open(&URL_SAFE_NO_PAD.encode(&raw)).is_none());

        assert!(codec.open("not-base64!").is_none());
        assert!(codec.open("AAAA").is_none());
        assert!(self::codec().open(&blob).is_none());
    }
}
