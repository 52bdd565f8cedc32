use crate::{
    error::Result,
    signal::sender_key::{SenderKeyRecord, MAX_SENDER_KEY_STATES},
    store::{Category, KeyStore},
    types::JID,
};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Opportunistic cleanup for the sender-key store categories.
///
/// Both passes are idempotent and safe to run at any time. [`Self::run`]
/// swallows and logs failures: cleanup must never break foreground sends.
pub struct SenderKeyJanitor {
    keys: KeyStore,
    max_states_per_group: usize,
}

impl SenderKeyJanitor {
    pub fn new(keys: KeyStore) -> Self {
        Self {
            keys,
            max_states_per_group: MAX_SENDER_KEY_STATES,
        }
    }

    pub fn with_max_states(keys: KeyStore, max_states_per_group: usize) -> Self {
        Self {
            keys,
            max_states_per_group,
        }
    }

    /// Run both passes, logging instead of surfacing failures
    pub async fn run(&self) {
        if let Err(err) = self.clean_memory().await {
            warn!("sender-key-memory cleanup failed: {}", err);
        }
        if let Err(err) = self.clean_sender_keys().await {
            warn!("sender-key cleanup failed: {}", err);
        }
    }

    /// Memory pass: keep only `device-jid -> true` mappings, drop
    /// non-object entries and now-empty groups
    pub async fn clean_memory(&self) -> Result<()> {
        let all = self.keys.get(Category::SenderKeyMemory, &[]).await?;
        let mut patch: HashMap<String, Option<Vec<u8>>> = HashMap::new();

        for (group, bytes) in all {
            let value: serde_json::Value = match serde_json::from_slice(&bytes) {
                Ok(value) => value,
                Err(_) => {
                    patch.insert(group, None);
                    continue;
                }
            };
            let map = match value {
                serde_json::Value::Object(map) => map,
                _ => {
                    patch.insert(group, None);
                    continue;
                }
            };

            let cleaned: serde_json::Map<String, serde_json::Value> = map
                .iter()
                .filter(|(_, v)| **v == serde_json::Value::Bool(true))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();

            if cleaned.is_empty() {
                patch.insert(group, None);
            } else if cleaned.len() != map.len() {
                patch.insert(
                    group,
                    Some(serde_json::to_vec(&serde_json::Value::Object(cleaned))?),
                );
            }
        }

        if !patch.is_empty() {
            debug!("repairing {} sender-key-memory entries", patch.len());
            let mut full = HashMap::new();
            full.insert(Category::SenderKeyMemory, patch);
            self.keys.set(full).await?;
        }
        Ok(())
    }

    /// Key pass (aggressive): drop undecodable records, filter invalid
    /// states, trim rings past the cap, delete keys with nothing left
    pub async fn clean_sender_keys(&self) -> Result<()> {
        let all = self.keys.get(Category::SenderKey, &[]).await?;
        let mut patch: HashMap<String, Option<Vec<u8>>> = HashMap::new();

        for (key, bytes) in all {
            // Accept a JSON array or a JSON string wrapping one.
            let value: serde_json::Value = match serde_json::from_slice(&bytes) {
                Ok(serde_json::Value::String(s)) => match serde_json::from_str(&s) {
                    Ok(value) => value,
                    Err(_) => {
                        patch.insert(key, None);
                        continue;
                    }
                },
                Ok(value) => value,
                Err(_) => {
                    patch.insert(key, None);
                    continue;
                }
            };
            let original_len = match &value {
                serde_json::Value::Array(items) if !items.is_empty() => items.len(),
                _ => {
                    patch.insert(key, None);
                    continue;
                }
            };
            let record = match SenderKeyRecord::from_value(value) {
                Ok(record) => record,
                Err(_) => {
                    patch.insert(key, None);
                    continue;
                }
            };

            let mut valid: Vec<_> = record
                .states()
                .iter()
                .filter(|s| s.is_valid())
                .cloned()
                .collect();
            if valid.is_empty() {
                patch.insert(key, None);
                continue;
            }
            if valid.len() > self.max_states_per_group {
                valid.drain(..valid.len() - self.max_states_per_group);
            }

            if valid.len() != original_len {
                patch.insert(key, Some(serde_json::to_vec(&valid)?));
            }
        }

        if !patch.is_empty() {
            debug!("repairing {} sender-key entries", patch.len());
            let mut full = HashMap::new();
            full.insert(Category::SenderKey, patch);
            self.keys.set(full).await?;
        }
        Ok(())
    }

    /// Forget every device that received the current key for a group
    pub async fn clear_group_memory(&self, group: &JID) -> Result<()> {
        self.keys
            .set_one(Category::SenderKeyMemory, &group.to_string(), None)
            .await
    }

    /// Drop the local sender key for a group, forcing a fresh rotation
    /// on the next send
    pub async fn clear_own_sender_key(&self, group: &JID, me: &JID) -> Result<()> {
        let key = format!("{}::{}::0", group, me.user);
        self.keys.set_one(Category::SenderKey, &key, None).await
    }
}
