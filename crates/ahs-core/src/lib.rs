//! ahs-core: shared protocol library for the AHS admin panel.
//!
//! Provides ECC key derivation and sealing, three-segment signed tokens,
//! encrypted session payloads, the durable key store, and the JSON wire
//! types spoken over the command WebSocket.

pub mod codec;
pub mod ecc;
pub mod error;
pub mod identity;
pub mod keystore;
pub mod messages;
pub mod session;
pub mod token;

// Re-export commonly used items at crate root.
pub use ecc::{Curve, PrivateKey, PublicKey};
pub use error::{AhsError, AhsResult};
pub use identity::{fingerprint, short_fingerprint, Identity};
pub use keystore::{FileKeyStore, KeyRecord, KeyRing, KeyStore, MemoryKeyStore};
pub use messages::{ChannelMessage, CommandRequest, ResponseEnvelope, StreamFrame};
pub use session::{Session, SessionCodec};
pub use token::{Token, TokenCodec};
