//! Signing identities.

use std::fmt;

use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use eddy_types::PeerId;
use serde::{Deserialize, Serialize};

use crate::error::LogError;

/// A public key tagged with its scheme.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PublicKey {
    /// 32-byte ed25519 verifying key.
    Ed25519([u8; 32]),
}

impl PublicKey {
    /// Canonical byte form: a scheme tag followed by the key.
    ///
    /// Used as the writer id inside entry clocks.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            PublicKey::Ed25519(key) => {
                let mut out = Vec::with_capacity(33);
                out.push(0);
                out.extend_from_slice(key);
                out
            }
        }
    }

    /// The peer id derived from this key.
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_data(&self.to_bytes())
    }

    /// Check `signature` over `data`. Malformed keys or signatures verify as `false`.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        match self {
            PublicKey::Ed25519(key) => {
                let Ok(verifying_key) = VerifyingKey::from_bytes(key) else {
                    return false;
                };
                let Ok(signature) = Signature::from_slice(signature) else {
                    return false;
                };
                verifying_key.verify(data, &signature).is_ok()
            }
        }
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublicKey::Ed25519(key) => {
                let hex: String = key[..5].iter().map(|b| format!("{b:02x}")).collect();
                write!(f, "Ed25519({hex})")
            }
        }
    }
}

/// A signature together with the key that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignatureWithKey {
    /// Signer.
    pub public_key: PublicKey,
    /// Raw signature bytes.
    pub signature: Vec<u8>,
}

impl SignatureWithKey {
    /// Verify this signature over `data`.
    pub fn verify(&self, data: &[u8]) -> bool {
        self.public_key.verify(data, &self.signature)
    }
}

/// Something that can sign entries.
#[async_trait]
pub trait Identity: Send + Sync {
    /// The key signatures verify against.
    fn public_key(&self) -> PublicKey;

    /// Sign `data`.
    async fn sign(&self, data: &[u8]) -> Result<SignatureWithKey, LogError>;

    /// The peer id of this identity.
    fn peer_id(&self) -> PeerId {
        self.public_key().peer_id()
    }
}

/// An in-process ed25519 keypair.
#[derive(Clone)]
pub struct Ed25519Identity {
    signing_key: SigningKey,
}

impl Ed25519Identity {
    /// Wrap an existing signing key.
    pub fn new(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        Self::new(SigningKey::generate(&mut rand::rngs::OsRng))
    }

    /// Deterministic keypair from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::new(SigningKey::from_bytes(&seed))
    }
}

#[async_trait]
impl Identity for Ed25519Identity {
    fn public_key(&self) -> PublicKey {
        PublicKey::Ed25519(self.signing_key.verifying_key().to_bytes())
    }

    async fn sign(&self, data: &[u8]) -> Result<SignatureWithKey, LogError> {
        let signature: Signature = self.signing_key.sign(data);
        Ok(SignatureWithKey {
            public_key: self.public_key(),
            signature: signature.to_bytes().to_vec(),
        })
    }
}

impl fmt::Debug for Ed25519Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519Identity")
            .field("public_key", &self.public_key())
            .finish()
    }
}
