//! Content-addressed block storage (Fjall disk or pure in-memory).

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use eddy_types::EntryHash;
use fjall::{Database, Keyspace, KeyspaceCreateOptions};
use tempfile::TempDir;

use crate::error::StoreError;

type Result<T> = std::result::Result<T, StoreError>;

/// A content-addressed block store.
///
/// `put` returns the blake3 address of the bytes; `get` of that address
/// returns them again until `rm` is called.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Fetch a block.
    async fn get(&self, hash: &EntryHash) -> Result<Option<Vec<u8>>>;

    /// Store a block, returning its address.
    async fn put(&self, bytes: Vec<u8>) -> Result<EntryHash>;

    /// Delete a block. Deleting a missing block is not an error.
    async fn rm(&self, hash: &EntryHash) -> Result<()>;

    /// Whether a block is present.
    async fn has(&self, hash: &EntryHash) -> Result<bool> {
        Ok(self.get(hash).await?.is_some())
    }
}

enum Backend {
    Fjall {
        #[allow(dead_code)]
        db: Database,
        blocks: Keyspace,
    },
    Memory(RwLock<HashMap<EntryHash, Vec<u8>>>),
}

/// The default [`BlockStore`].
pub struct Blocks {
    backend: Backend,
    _tmp: Option<TempDir>,
}

fn storage_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl Blocks {
    /// Open a persistent store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::builder(path).open().map_err(storage_err)?;
        Ok(Self {
            backend: Self::init_fjall(db)?,
            _tmp: None,
        })
    }

    /// Open a Fjall store in a scratch directory removed on drop.
    pub fn open_temporary() -> Result<Self> {
        let tmp = tempfile::tempdir().map_err(storage_err)?;
        let db = Database::builder(tmp.path())
            .temporary(true)
            .open()
            .map_err(storage_err)?;
        Ok(Self {
            backend: Self::init_fjall(db)?,
            _tmp: Some(tmp),
        })
    }

    /// Create a pure in-memory store.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(RwLock::new(HashMap::new())),
            _tmp: None,
        }
    }

    fn init_fjall(db: Database) -> Result<Backend> {
        let blocks = db
            .keyspace("blocks", KeyspaceCreateOptions::default)
            .map_err(storage_err)?;
        Ok(Backend::Fjall { db, blocks })
    }

    /// Number of stored blocks.
    pub fn len(&self) -> Result<usize> {
        match &self.backend {
            Backend::Fjall { blocks, .. } => {
                let mut count = 0;
                for guard in blocks.iter() {
                    guard.key().map_err(storage_err)?;
                    count += 1;
                }
                Ok(count)
            }
            Backend::Memory(m) => Ok(m.read().unwrap().len()),
        }
    }

    /// Whether the store holds no blocks.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl BlockStore for Blocks {
    async fn get(&self, hash: &EntryHash) -> Result<Option<Vec<u8>>> {
        let bytes = match &self.backend {
            Backend::Fjall { blocks, .. } => blocks
                .get(hash.as_bytes())
                .map_err(storage_err)?
                .map(|v| v.to_vec()),
            Backend::Memory(m) => m.read().unwrap().get(hash).cloned(),
        };

        if let Some(bytes) = &bytes {
            let actual = EntryHash::from_data(bytes);
            if actual != *hash {
                return Err(StoreError::Corrupt {
                    expected: *hash,
                    actual,
                });
            }
        }
        Ok(bytes)
    }

    async fn put(&self, bytes: Vec<u8>) -> Result<EntryHash> {
        let hash = EntryHash::from_data(&bytes);
        match &self.backend {
            Backend::Fjall { blocks, .. } => {
                blocks.insert(hash.as_bytes(), bytes).map_err(storage_err)?;
            }
            Backend::Memory(m) => {
                m.write().unwrap().insert(hash, bytes);
            }
        }
        Ok(hash)
    }

    async fn rm(&self, hash: &EntryHash) -> Result<()> {
        match &self.backend {
            Backend::Fjall { blocks, .. } => {
                blocks.remove(hash.as_bytes()).map_err(storage_err)?;
            }
            Backend::Memory(m) => {
                m.write().unwrap().remove(hash);
            }
        }
        Ok(())
    }

    async fn has(&self, hash: &EntryHash) -> Result<bool> {
        match &self.backend {
            Backend::Fjall { blocks, .. } => Ok(blocks
                .get(hash.as_bytes())
                .map_err(storage_err)?
                .is_some()),
            Backend::Memory(m) => Ok(m.read().unwrap().contains_key(hash)),
        }
    }
}
