//! Durable key storage and the key ring.
//!
//! Every derived key is persisted as a [`KeyRecord`] unique on
//! `(parent fingerprint, index)`. The private half is only stored when a
//! wrap password is configured, and then only as an encrypted PKCS#8 blob.
//!
//! Hierarchy:
//!
//! ```text
//! root ─┬─ index 0            server signing key ── index 1   session sealing key
//!       └─ index slot(owner)  owner root ── index i   owner key i
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::codec::{cbor_decode, cbor_encode};
use crate::ecc::{
    derive_subkey, derive_subkey_async, deserialize_private_key_async, serialize_private_key_async,
    Curve, KeyEncoding, PrivateKey, PublicKey, DEFAULT_KDF_ITERATIONS,
};
use crate::error::{AhsError, AhsResult};
use crate::identity::short_fingerprint;
use crate::token::unix_now;

/// Index of the server signing key under the root.
pub const SIGNING_KEY_INDEX: u32 = 0;

/// Index of the session sealing key under the signing key. Every nonzero
/// index under the root may be an owner slot, so it lives one level down.
pub const SESSION_KEY_INDEX: u32 = 1;

/// Persisted form of one derived key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub owner: String,
    pub index: u32,
    pub curve: Curve,
    /// Fingerprint of the key this one was derived from; `None` for a root.
    pub parent: Option<String>,
    /// Uncompressed X9.62 public point.
    pub public_point: Vec<u8>,
    /// Password-wrapped PKCS#8 DER.
    pub private_key: Option<Vec<u8>>,
    pub created: u64,
}

impl KeyRecord {
    pub fn public_key(&self) -> AhsResult<PublicKey> {
        PublicKey::from_x962(&self.public_point)
    }

    pub fn fingerprint(&self) -> String {
        crate::identity::fingerprint(&self.public_point)
    }

    fn unique_key(&self) -> (String, u32) {
        (self.parent.clone().unwrap_or_default(), self.index)
    }
}

type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = AhsResult<T>> + Send + 'a>>;

/// CRUD over [`KeyRecord`]s keyed by `(owner, index)`.
pub trait KeyStore: Send + Sync {
    fn get<'a>(&'a self, owner: &'a str, index: u32) -> StoreFuture<'a, Option<KeyRecord>>;

    fn exists<'a>(&'a self, owner: &'a str, index: u32) -> StoreFuture<'a, bool>;

    /// Insert a record. Returns `false` when the same owner already holds
    /// `(parent, index)`; fails with `KeyConflict` when another owner does.
    fn put(&self, record: KeyRecord) -> StoreFuture<'_, bool>;

    /// Remove every record belonging to `owner`. Returns how many went.
    fn remove_owner<'a>(&'a self, owner: &'a str) -> StoreFuture<'a, usize>;

    fn list(&self) -> StoreFuture<'_, Vec<KeyRecord>>;
}

fn check_existing(existing: &KeyRecord, incoming: &KeyRecord) -> AhsResult<bool> {
    if existing.owner == incoming.owner {
        Ok(false)
    } else {
        Err(AhsError::KeyConflict(format!(
            "index {} under {} already belongs to '{}'",
            incoming.index,
            incoming.parent.as_deref().map(short_fingerprint).unwrap_or_else(|| "root".into()),
            existing.owner
        )))
    }
}

// ── In-memory store ──────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryKeyStore {
    records: RwLock<HashMap<(String, u32), KeyRecord>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn get<'a>(&'a self, owner: &'a str, index: u32) -> StoreFuture<'a, Option<KeyRecord>> {
        Box::pin(async move {
            let records = self.records.read().await;
            Ok(records
                .values()
                .find(|r| r.owner == owner && r.index == index)
                .cloned())
        })
    }

    fn exists<'a>(&'a self, owner: &'a str, index: u32) -> StoreFuture<'a, bool> {
        Box::pin(async move { Ok(self.get(owner, index).await?.is_some()) })
    }

    fn put(&self, record: KeyRecord) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let mut records = self.records.write().await;
            let key = record.unique_key();
            if let Some(existing) = records.get(&key) {
                return check_existing(existing, &record);
            }
            records.insert(key, record);
            Ok(true)
        })
    }

    fn remove_owner<'a>(&'a self, owner: &'a str) -> StoreFuture<'a, usize> {
        Box::pin(async move {
            let mut records = self.records.write().await;
            let before = records.len();
            records.retain(|_, r| r.owner != owner);
            Ok(before - records.len())
        })
    }

    fn list(&self) -> StoreFuture<'_, Vec<KeyRecord>> {
        Box::pin(async move { Ok(self.records.read().await.values().cloned().collect()) })
    }
}

// ── File-backed store ────────────────────────────────────────────────

/// One CBOR file per `(parent, index)` under a directory.
pub struct FileKeyStore {
    dir: PathBuf,
}

impl FileKeyStore {
    pub async fn open(dir: impl Into<PathBuf>) -> AhsResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, record: &KeyRecord) -> PathBuf {
        let parent = record.parent.as_deref().unwrap_or("root");
        self.dir.join(format!("{parent}-{}.cbor", record.index))
    }

    fn temp_path_for(&self, path: &Path) -> PathBuf {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("record");
        self.dir.join(format!(".{name}.{:016x}.tmp", rand::random::<u64>()))
    }

    async fn read_record(path: &Path) -> AhsResult<KeyRecord> {
        let bytes = tokio::fs::read(path).await?;
        cbor_decode(&bytes)
    }
}

impl KeyStore for FileKeyStore {
    fn get<'a>(&'a self, owner: &'a str, index: u32) -> StoreFuture<'a, Option<KeyRecord>> {
        Box::pin(async move {
            Ok(self
                .list()
                .await?
                .into_iter()
                .find(|r| r.owner == owner && r.index == index))
        })
    }

    fn exists<'a>(&'a self, owner: &'a str, index: u32) -> StoreFuture<'a, bool> {
        Box::pin(async move { Ok(self.get(owner, index).await?.is_some()) })
    }

    fn put(&self, record: KeyRecord) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let path = self.path_for(&record);
            let bytes = cbor_encode(&record)?;

            // The record name only ever points at a fully written file.
            let tmp = self.temp_path_for(&path);
            if let Err(e) = tokio::fs::write(&tmp, &bytes).await {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e.into());
            }

            match tokio::fs::hard_link(&tmp, &path).await {
                Ok(()) => {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    debug!(path = %path.display(), "stored key record");
                    Ok(true)
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    match Self::read_record(&path).await {
                        Ok(existing) => {
                            let _ = tokio::fs::remove_file(&tmp).await;
                            check_existing(&existing, &record)
                        }
                        Err(AhsError::Codec(reason)) => {
                            warn!(path = %path.display(), %reason, "replacing undecodable key record");
                            tokio::fs::rename(&tmp, &path).await?;
                            Ok(true)
                        }
                        Err(e) => {
                            let _ = tokio::fs::remove_file(&tmp).await;
                            Err(e)
                        }
                    }
                }
                Err(e) => {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    Err(e.into())
                }
            }
        })
    }

    fn remove_owner<'a>(&'a self, owner: &'a str) -> StoreFuture<'a, usize> {
        Box::pin(async move {
            let mut removed = 0;
            for record in self.list().await? {
                if record.owner == owner {
                    tokio::fs::remove_file(self.path_for(&record)).await?;
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    fn list(&self) -> StoreFuture<'_, Vec<KeyRecord>> {
        Box::pin(async move {
            let mut records = Vec::new();
            let mut entries = tokio::fs::read_dir(&self.dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("cbor") {
                    continue;
                }
                match Self::read_record(&path).await {
                    Ok(record) => records.push(record),
                    Err(AhsError::Codec(reason)) => {
                        warn!(path = %path.display(), %reason, "skipping undecodable key record");
                    }
                    Err(e) => return Err(e),
                }
            }
            records.sort_by(|a, b| (&a.owner, a.index).cmp(&(&b.owner, b.index)));
            Ok(records)
        })
    }
}

// ── Key ring ─────────────────────────────────────────────────────────

/// Map an owner id to its slot under the root.
///
/// Numeric ids `1..=i32::MAX` map to themselves; anything else hashes into
/// the upper half of the index space. Slot 0 is never returned.
pub fn owner_slot(owner: &str) -> u32 {
    match owner.parse::<u32>() {
        Ok(n) if n != SIGNING_KEY_INDEX && n < 0x8000_0000 => n,
        _ => {
            let digest = Sha256::digest(owner.as_bytes());
            let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
            n | 0x8000_0000
        }
    }
}

/// The root key plus the store its descendants are persisted to.
#[derive(Clone)]
pub struct KeyRing {
    root: PrivateKey,
    store: Arc<dyn KeyStore>,
    wrap_password: Option<Arc<Vec<u8>>>,
    kdf_iterations: u32,
}

impl KeyRing {
    pub fn new(root: PrivateKey, store: Arc<dyn KeyStore>) -> Self {
        Self {
            root,
            store,
            wrap_password: None,
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
        }
    }

    /// Persist private halves, wrapped with `password`.
    pub fn with_wrap_password(mut self, password: Vec<u8>, kdf_iterations: u32) -> Self {
        self.wrap_password = Some(Arc::new(password));
        self.kdf_iterations = kdf_iterations;
        self
    }

    pub fn curve(&self) -> Curve {
        self.root.curve()
    }

    pub fn root(&self) -> &PrivateKey {
        &self.root
    }

    pub fn root_fingerprint(&self) -> String {
        self.root.public_key().fingerprint()
    }

    pub fn store(&self) -> &Arc<dyn KeyStore> {
        &self.store
    }

    /// The server's token signing key.
    pub fn signing_key(&self) -> AhsResult<PrivateKey> {
        derive_subkey(&self.root, SIGNING_KEY_INDEX, self.curve())
    }

    /// The key sessions are sealed to. Never used for signing.
    pub fn session_key(&self) -> AhsResult<PrivateKey> {
        derive_subkey(&self.signing_key()?, SESSION_KEY_INDEX, self.curve())
    }

    /// Key `index` of `owner`, derived on demand and persisted once.
    pub async fn owner_key(&self, owner: &str, index: u32) -> AhsResult<PrivateKey> {
        let curve = self.curve();
        let owner_root = derive_subkey_async(self.root.clone(), owner_slot(owner), curve).await?;
        let parent_fp = owner_root.public_key().fingerprint();
        let key = derive_subkey_async(owner_root, index, curve).await?;

        if let Some(existing) = self.store.get(owner, index).await? {
            if existing.public_point != key.public_key().to_x962() {
                return Err(AhsError::KeyConflict(format!(
                    "stored key {} for '{owner}' does not derive from this root",
                    short_fingerprint(&existing.fingerprint())
                )));
            }
            return Ok(key);
        }

        let private_key = match &self.wrap_password {
            Some(pw) => Some(
                serialize_private_key_async(
                    key.clone(),
                    KeyEncoding::Der,
                    Some((pw.as_ref().clone(), self.kdf_iterations)),
                )
                .await?,
            ),
            None => None,
        };

        let record = KeyRecord {
            owner: owner.to_string(),
            index,
            curve,
            parent: Some(parent_fp),
            public_point: key.public_key().to_x962(),
            private_key,
            created: unix_now(),
        };
        let fp = record.fingerprint();
        if self.store.put(record).await? {
            info!(owner, index, key = %short_fingerprint(&fp), "persisted derived key");
        }
        Ok(key)
    }

    /// Recover a stored private half. Requires the wrap password.
    pub async fn unwrap_stored(&self, record: &KeyRecord) -> AhsResult<Option<PrivateKey>> {
        match (&record.private_key, &self.wrap_password) {
            (Some(blob), Some(pw)) => Ok(Some(
                deserialize_private_key_async(blob.clone(), KeyEncoding::Der, Some(pw.as_ref().clone()))
                    .await?,
            )),
            _ => Ok(None),
        }
    }
}

// ── Root key files ───────────────────────────────────────────────────

/// Load a PEM root key, decrypting it when `password` is given.
pub async fn read_root_key(path: &Path, password: Option<Vec<u8>>) -> AhsResult<PrivateKey> {
    let pem = tokio::fs::read(path).await?;
    deserialize_private_key_async(pem, KeyEncoding::Pem, password).await
}

/// Write a PEM root key (owner-only permissions). Refuses to overwrite.
pub async fn write_root_key(
    path: &Path,
    key: &PrivateKey,
    password: Vec<u8>,
    kdf_iterations: u32,
) -> AhsResult<()> {
    let pem = serialize_private_key_async(key.clone(), KeyEncoding::Pem, Some((password, kdf_iterations)))
        .await?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut opts = tokio::fs::OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    opts.mode(0o600);
    let mut f = opts.open(path).await?;
    f.write_all(&pem).await?;
    f.flush().await?;
    Ok(())
}
