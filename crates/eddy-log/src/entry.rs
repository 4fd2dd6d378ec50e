//! Signed, content-addressed log entries.
//!
//! An entry is created once and never mutated. Its address is the blake3
//! hash of the fully signed block (`meta`, `payload`, `signatures`), so the
//! hash never needs to travel on the wire: [`Entry::from_block`] recomputes
//! it from the received bytes.

use std::sync::Arc;

use async_trait::async_trait;
use eddy_types::{EntryHash, PeerId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::{Clock, HybridLogicalClock, Timestamp};
use crate::error::LogError;
use crate::identity::{Identity, PublicKey, SignatureWithKey};

/// Kind of entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryType {
    /// Regular application write.
    #[default]
    Append,
    /// Marks that everything before it on the branch may be discarded by
    /// readers. Treated like any other entry by the log itself.
    Cut,
}

/// How payload bytes should be interpreted by the application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encoding {
    /// Opaque bytes.
    #[default]
    Raw,
    /// UTF-8 text.
    Utf8,
    /// A postcard-encoded value.
    Postcard,
}

/// Causal metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Meta {
    /// When and by whom the entry was written.
    pub clock: Clock,
    /// Branch identifier.
    pub gid: String,
    /// Entry kind.
    pub entry_type: EntryType,
    /// Optional application metadata.
    pub data: Option<Vec<u8>>,
    /// Predecessor hashes.
    pub next: Vec<EntryHash>,
}

/// Encoded application data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Payload {
    /// Encoding tag.
    pub encoding: Encoding,
    /// The bytes.
    pub bytes: Vec<u8>,
}

impl Payload {
    /// Raw bytes payload.
    pub fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            encoding: Encoding::Raw,
            bytes: bytes.into(),
        }
    }

    /// UTF-8 text payload.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            encoding: Encoding::Utf8,
            bytes: text.into().into_bytes(),
        }
    }

    /// Postcard-encode `value`.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, LogError> {
        Ok(Self {
            encoding: Encoding::Postcard,
            bytes: postcard::to_allocvec(value)?,
        })
    }
}

/// Decides whether an entry may enter a log.
#[async_trait]
pub trait AppendPolicy: Send + Sync {
    /// Return `false` to reject `entry`.
    async fn can_append(&self, entry: &Entry) -> bool;
}

/// Everything except the hash and signatures; this is what gets signed.
#[derive(Serialize)]
struct Signable<'a> {
    meta: &'a Meta,
    payload: &'a Payload,
}

#[derive(Serialize)]
struct SignedRef<'a> {
    meta: &'a Meta,
    payload: &'a Payload,
    signatures: &'a [SignatureWithKey],
}

#[derive(Deserialize)]
struct SignedOwned {
    meta: Meta,
    payload: Payload,
    signatures: Vec<SignatureWithKey>,
}

/// An immutable signed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    hash: EntryHash,
    meta: Meta,
    payload: Payload,
    signatures: Vec<SignatureWithKey>,
    size: usize,
}

/// The light projection of an entry used in gossip and join requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShallowEntry {
    /// Content address.
    pub hash: EntryHash,
    /// Causal metadata.
    pub meta: Meta,
    /// Length of the payload in bytes.
    pub payload_size: usize,
}

/// Inputs to [`Entry::create`].
pub struct CreateEntry<'a> {
    /// Writer whose key becomes the clock id.
    pub identity: &'a dyn Identity,
    /// Signers. When empty, `identity` signs alone.
    pub signers: &'a [Arc<dyn Identity>],
    /// Clock to advance.
    pub clock: &'a HybridLogicalClock,
    /// Application data.
    pub payload: Payload,
    /// Predecessors.
    pub next: &'a [Entry],
    /// Entry kind.
    pub entry_type: EntryType,
    /// Application metadata.
    pub data: Option<Vec<u8>>,
    /// Seed for a fresh gid when `next` is empty. Random when `None`.
    pub gid_seed: Option<Vec<u8>>,
    /// Optional admission check run on the finished entry.
    pub can_append: Option<&'a dyn AppendPolicy>,
}

impl Entry {
    /// Create, sign and address a new entry.
    pub async fn create(params: CreateEntry<'_>) -> Result<Entry, LogError> {
        // Stamped only once every check below has passed.
        let latest = params.next.iter().map(|e| e.timestamp()).max();
        let timestamp = params.clock.propose(latest.as_ref())?;
        let clock = Clock::new(params.identity.public_key().to_bytes(), timestamp);

        for next in params.next {
            if next.meta.clock >= clock {
                return Err(LogError::NextNotBefore { next: next.hash });
            }
        }

        let gid = match params.next.iter().map(|e| e.meta.gid.as_str()).min() {
            Some(gid) => gid.to_string(),
            None => fresh_gid(params.gid_seed.as_deref()),
        };

        let meta = Meta {
            clock,
            gid,
            entry_type: params.entry_type,
            data: params.data,
            next: params.next.iter().map(|e| e.hash).collect(),
        };
        let payload = params.payload;

        let signable = postcard::to_allocvec(&Signable {
            meta: &meta,
            payload: &payload,
        })?;

        let mut signatures = Vec::with_capacity(params.signers.len().max(1));
        if params.signers.is_empty() {
            signatures.push(params.identity.sign(&signable).await?);
        } else {
            for signer in params.signers {
                signatures.push(signer.sign(&signable).await?);
            }
        }
        signatures.sort_by(|a, b| a.signature.cmp(&b.signature));

        let block = encode_block(&meta, &payload, &signatures)?;
        let entry = Entry {
            hash: EntryHash::from_data(&block),
            meta,
            payload,
            signatures,
            size: block.len(),
        };

        if let Some(policy) = params.can_append {
            if !policy.can_append(&entry).await {
                return Err(LogError::Access(format!(
                    "append of {} rejected by policy",
                    entry.hash
                )));
            }
        }

        params.clock.commit(timestamp);
        debug!(hash = %entry.hash, gid = %entry.meta.gid, "created entry");
        Ok(entry)
    }

    /// Decode a stored or received block, deriving the hash from its bytes.
    pub fn from_block(bytes: &[u8]) -> Result<Entry, LogError> {
        let decoded: SignedOwned = postcard::from_bytes(bytes)?;
        Ok(Entry {
            hash: EntryHash::from_data(bytes),
            meta: decoded.meta,
            payload: decoded.payload,
            signatures: decoded.signatures,
            size: bytes.len(),
        })
    }

    /// Serialize to the signed block form the hash is computed over.
    pub fn to_block(&self) -> Result<Vec<u8>, LogError> {
        encode_block(&self.meta, &self.payload, &self.signatures)
    }

    /// Content address.
    pub fn hash(&self) -> EntryHash {
        self.hash
    }

    /// Causal metadata.
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// Application data.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Signatures, sorted by signature bytes.
    pub fn signatures(&self) -> &[SignatureWithKey] {
        &self.signatures
    }

    /// Predecessor hashes.
    pub fn next(&self) -> &[EntryHash] {
        &self.meta.next
    }

    /// Branch identifier.
    pub fn gid(&self) -> &str {
        &self.meta.gid
    }

    /// Write timestamp.
    pub fn timestamp(&self) -> Timestamp {
        self.meta.clock.timestamp
    }

    /// Size of the signed block in bytes.
    pub fn byte_length(&self) -> usize {
        self.size
    }

    /// Keys that signed this entry.
    pub fn public_keys(&self) -> Vec<PublicKey> {
        self.signatures.iter().map(|s| s.public_key).collect()
    }

    /// Peer ids of the signers.
    pub fn signers(&self) -> Vec<PeerId> {
        self.signatures
            .iter()
            .map(|s| s.public_key.peer_id())
            .collect()
    }

    /// Check that the hash matches the content.
    pub fn verify_hash(&self) -> bool {
        match self.to_block() {
            Ok(block) => EntryHash::from_data(&block) == self.hash,
            Err(_) => false,
        }
    }

    /// Check every signature over the signable projection. An entry
    /// without signatures does not verify.
    pub fn verify_signatures(&self) -> bool {
        if self.signatures.is_empty() {
            return false;
        }
        let Ok(signable) = postcard::to_allocvec(&Signable {
            meta: &self.meta,
            payload: &self.payload,
        }) else {
            return false;
        };
        self.signatures.iter().all(|s| s.verify(&signable))
    }

    /// Hash and signatures both check out.
    pub fn verify(&self) -> bool {
        self.verify_hash() && self.verify_signatures()
    }

    /// Gossip projection.
    pub fn shallow(&self) -> ShallowEntry {
        ShallowEntry {
            hash: self.hash,
            meta: self.meta.clone(),
            payload_size: self.payload.bytes.len(),
        }
    }
}

fn encode_block(
    meta: &Meta,
    payload: &Payload,
    signatures: &[SignatureWithKey],
) -> Result<Vec<u8>, LogError> {
    Ok(postcard::to_allocvec(&SignedRef {
        meta,
        payload,
        signatures,
    })?)
}

fn fresh_gid(seed: Option<&[u8]>) -> String {
    let hash = match seed {
        Some(seed) => blake3::hash(seed),
        None => blake3::hash(&rand::random::<[u8; 32]>()),
    };
    hash.to_hex().to_string()
}
