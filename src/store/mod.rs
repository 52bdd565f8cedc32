pub mod janitor;
pub mod keystore;

pub use janitor::SenderKeyJanitor;
pub use keystore::KeyStore;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// The categories the key-value store is allowed to hold.
///
/// The relay core reads and writes `Session`, `SenderKey`, and
/// `SenderKeyMemory`; the remaining categories are owned by adjacent
/// subsystems but share the same store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Session,
    SenderKey,
    SenderKeyMemory,
    Account,
    PreKey,
    SignedPreKey,
    SenderSigningKey,
    AppStateSyncKey,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Session => "session",
            Category::SenderKey => "sender-key",
            Category::SenderKeyMemory => "sender-key-memory",
            Category::Account => "account",
            Category::PreKey => "pre-key",
            Category::SignedPreKey => "signed-pre-key",
            Category::SenderSigningKey => "sender-signing-key",
            Category::AppStateSyncKey => "app-state-sync-key",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A write batch: `None` deletes the key
pub type StorePatch = HashMap<Category, HashMap<String, Option<Vec<u8>>>>;

/// Opaque persistent key-value store the relay core runs against.
///
/// Values are raw bytes; the store never interprets them.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch values for the given keys; an empty `keys` slice means
    /// "all keys in the category". Missing keys are absent from the
    /// returned map.
    async fn get(&self, category: Category, keys: &[String]) -> Result<HashMap<String, Vec<u8>>>;

    /// Apply a write batch atomically
    async fn set(&self, patch: StorePatch) -> Result<()>;
}

/// In-memory store used by tests and lightweight embedders
#[derive(Default)]
pub struct MemoryKeyValueStore {
    data: tokio::sync::RwLock<HashMap<Category, HashMap<String, Vec<u8>>>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, category: Category, keys: &[String]) -> Result<HashMap<String, Vec<u8>>> {
        let data = self.data.read().await;
        let bucket = match data.get(&category) {
            Some(bucket) => bucket,
            None => return Ok(HashMap::new()),
        };

        if keys.is_empty() {
            return Ok(bucket.clone());
        }

        Ok(keys
            .iter()
            .filter_map(|k| bucket.get(k).map(|v| (k.clone(), v.clone())))
            .collect())
    }

    async fn set(&self, patch: StorePatch) -> Result<()> {
        let mut data = self.data.write().await;
        for (category, entries) in patch {
            let bucket = data.entry(category).or_default();
            for (key, value) in entries {
                match value {
                    Some(value) => {
                        bucket.insert(key, value);
                    }
                    None => {
                        bucket.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }
}
