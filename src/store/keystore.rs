use crate::{
    error::Result,
    store::{Category, KeyValueStore, StorePatch},
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
struct TxState {
    pending: StorePatch,
}

/// Typed, transactional façade over the opaque [`KeyValueStore`].
///
/// A transaction is scoped to the handle passed into its body: writes
/// made through that handle buffer into an overlay its reads observe
/// immediately, and the overlay flushes as one batch when the body
/// returns `Ok` (it is discarded on error). Calling
/// [`KeyStore::transaction`] on that handle joins the open transaction
/// instead of starting a new one. Plain handles, including every other
/// clone of this store, are unaffected: their writes apply immediately,
/// so concurrent transactions never see or absorb each other's state.
#[derive(Clone)]
pub struct KeyStore {
    inner: Arc<dyn KeyValueStore>,
    tx: Option<Arc<Mutex<TxState>>>,
}

impl KeyStore {
    pub fn new(inner: Arc<dyn KeyValueStore>) -> Self {
        Self { inner, tx: None }
    }

    /// Read values for the given keys; empty `keys` means all.
    ///
    /// A transaction-scoped handle observes its own uncommitted writes.
    pub async fn get(
        &self,
        category: Category,
        keys: &[String],
    ) -> Result<HashMap<String, Vec<u8>>> {
        let overlay: Option<HashMap<String, Option<Vec<u8>>>> = match &self.tx {
            Some(tx) => tx.lock().await.pending.get(&category).cloned(),
            None => None,
        };

        let mut result = self.inner.get(category, keys).await?;

        if let Some(overlay) = overlay {
            for (key, value) in overlay {
                if !keys.is_empty() && !keys.contains(&key) {
                    continue;
                }
                match value {
                    Some(value) => {
                        result.insert(key, value);
                    }
                    None => {
                        result.remove(&key);
                    }
                }
            }
        }

        Ok(result)
    }

    /// Write a batch; `None` values delete.
    ///
    /// A transaction-scoped handle buffers the batch, a plain handle
    /// applies it immediately.
    pub async fn set(&self, patch: StorePatch) -> Result<()> {
        match &self.tx {
            Some(tx) => {
                let mut tx = tx.lock().await;
                for (category, entries) in patch {
                    tx.pending.entry(category).or_default().extend(entries);
                }
                Ok(())
            }
            None => self.inner.set(patch).await,
        }
    }

    /// Convenience for a single-key write
    pub async fn set_one(&self, category: Category, key: &str, value: Option<Vec<u8>>) -> Result<()> {
        let mut entries = HashMap::new();
        entries.insert(key.to_string(), value);
        let mut patch = HashMap::new();
        patch.insert(category, entries);
        self.set(patch).await
    }

    /// Run `body` transactionally.
    ///
    /// The body receives the transaction-scoped handle; its buffered
    /// writes flush as a single batch after the outermost body returns
    /// `Ok`. Nested calls through the handle join the open transaction.
    pub async fn transaction<F, Fut, T>(&self, body: F) -> Result<T>
    where
        F: FnOnce(KeyStore) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (state, outermost) = match &self.tx {
            Some(state) => (state.clone(), false),
            None => (Arc::new(Mutex::new(TxState::default())), true),
        };
        let handle = KeyStore {
            inner: self.inner.clone(),
            tx: Some(state.clone()),
        };

        let result = body(handle).await;

        if outermost {
            let pending = std::mem::take(&mut state.lock().await.pending);
            if result.is_ok() && !pending.is_empty() {
                self.inner.set(pending).await?;
            }
        }
        result
    }
}
