//! Principals and key fingerprints.
//!
//! A fingerprint is SHA-256 over the uncompressed X9.62 public point,
//! hex-encoded; logs show the short form.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Full hex-encoded SHA-256 fingerprint of a public point.
pub fn fingerprint(public_point: &[u8]) -> String {
    hex::encode(Sha256::digest(public_point))
}

/// Display form of a fingerprint: `SHA256:` plus the first 16 hex chars.
pub fn short_fingerprint(fp: &str) -> String {
    let end = fp.len().min(16);
    format!("SHA256:{}", &fp[..end])
}

/// The acting principal attached to a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Identity {
    #[default]
    Anonymous,
    User {
        /// Owner id as carried in the token subject.
        id: String,
        /// Id of the token the user authenticated with.
        token_id: String,
        /// Session-binding key from the token payload.
        #[serde(skip_serializing, default)]
        session_key: String,
    },
}

impl Identity {
    pub fn user(id: impl Into<String>, token_id: impl Into<String>, session_key: impl Into<String>) -> Self {
        Identity::User {
            id: id.into(),
            token_id: token_id.into(),
            session_key: session_key.into(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Identity::User { .. })
    }

    /// Owner id, `None` for anonymous.
    pub fn owner(&self) -> Option<&str> {
        match self {
            Identity::Anonymous => None,
            Identity::User { id, .. } => Some(id),
        }
    }

    pub fn session_key(&self) -> Option<&str> {
        match self {
            Identity::Anonymous => None,
            Identity::User { session_key, .. } => Some(session_key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_hex_sha256() {
        let fp = fingerprint(&[0x04; 65]);
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn short_form() {
        let fp = fingerprint(b"point");
        let short = short_fingerprint(&fp);
        assert_eq!(short.len(), "SHA256:".len() + 16);
        assert!(fp.starts_with(&short["SHA256:".len()..]));
        assert_eq!(short_fingerprint("abcd"), "SHA256:abcd");
    }

    #[test]
    fn identity_accessors() {
        let anon = Identity::default();
        assert!(!anon.is_authenticated());
        assert_eq!(anon.owner(), None);

        let user = Identity::user("7", "tid", "skey");
        assert!(user.is_authenticated());
        assert_eq!(user.owner(), Some("7"));
        assert_eq!(user.session_key(), Some("skey"));
    }

    #[test]
    fn session_key_not_serialized() {
        let user = Identity::user("7", "tid", "secret-binding");
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("secret-binding"));
        assert!(json.contains("\"kind\":\"user\""));
    }
}
