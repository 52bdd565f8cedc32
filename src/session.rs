//! Pairwise session assertion.
//!
//! Before encrypting to a set of devices the relay ensures a Signal
//! session exists for each one, fetching and installing prekey bundles
//! for the devices that lack one. A small in-memory "recently verified"
//! set skips the store round trip for devices checked moments ago; it is
//! an optimization only and is flushed wholesale when it grows too big.

use crate::{
    binary::Node,
    error::{Error, Result},
    signal::{OneTimePreKey, PreKeyBundle, SignalRepository, SignedPreKey},
    store::{Category, KeyStore},
    transport::StanzaTransport,
    types::JID,
};
use futures_util::future::try_join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// The verified set is cleared wholesale past this size
pub const VERIFIED_SESSIONS_BOUND: usize = 1000;

/// Ensures pairwise sessions exist before encryption
pub struct SessionAsserter {
    transport: Arc<dyn StanzaTransport>,
    signal: Arc<dyn SignalRepository>,
    keys: KeyStore,
    verified: Mutex<HashSet<String>>,
}

impl SessionAsserter {
    pub fn new(
        transport: Arc<dyn StanzaTransport>,
        signal: Arc<dyn SignalRepository>,
        keys: KeyStore,
    ) -> Self {
        Self {
            transport,
            signal,
            keys,
            verified: Mutex::new(HashSet::new()),
        }
    }

    /// Ensure sessions exist for every listed device.
    ///
    /// Returns whether a prekey fetch happened. With `force`, sessions
    /// are re-fetched even when the store already has them.
    pub async fn assert_sessions(&self, jids: &[JID], force: bool) -> Result<bool> {
        let mut seen = HashSet::new();
        let mut candidates: Vec<JID> = jids
            .iter()
            .filter(|jid| seen.insert(jid.signal_address()))
            .cloned()
            .collect();

        if !force {
            {
                let verified = self.verified.lock().await;
                candidates.retain(|jid| !verified.contains(&jid.signal_address()));
            }
            if candidates.is_empty() {
                return Ok(false);
            }

            let addresses: Vec<String> =
                candidates.iter().map(|jid| jid.signal_address()).collect();
            let existing = self.keys.get(Category::Session, &addresses).await?;
            candidates.retain(|jid| !existing.contains_key(&jid.signal_address()));
        }

        if candidates.is_empty() {
            return Ok(false);
        }

        debug!("fetching prekey bundles for {} devices", candidates.len());
        let bundles = self.fetch_prekey_bundles(&candidates).await?;
        let installs: Vec<_> = bundles
            .into_iter()
            .map(|bundle| {
                let signal = self.signal.clone();
                async move {
                    let jid = bundle.jid.clone();
                    signal.inject_prekey_bundle(&jid, bundle).await
                }
            })
            .collect();
        try_join_all(installs).await?;

        let mut verified = self.verified.lock().await;
        if verified.len() >= VERIFIED_SESSIONS_BOUND {
            verified.clear();
        }
        verified.extend(candidates.iter().map(|jid| jid.signal_address()));

        Ok(true)
    }

    /// Fetch prekey bundles for the listed devices in one stanza
    async fn fetch_prekey_bundles(&self, jids: &[JID]) -> Result<Vec<PreKeyBundle>> {
        let user_nodes: Vec<Node> = jids
            .iter()
            .map(|jid| Node::new("user").attr("jid", jid.to_string()))
            .collect();

        let iq = Node::new("iq")
            .attr("to", crate::types::DEFAULT_USER_SERVER)
            .attr("type", "get")
            .attr("xmlns", "encrypt")
            .attr("id", uuid::Uuid::new_v4().to_string())
            .with_children(vec![Node::new("key").with_children(user_nodes)]);

        let response = self.transport.query(iq).await?;
        let list = response.expect_child("list")?;

        list.find_children("user")
            .into_iter()
            .map(parse_prekey_bundle)
            .collect()
    }
}

/// Big-endian integer of up to 4 bytes, as used for registration and
/// prekey ids
fn read_be_u32(bytes: &[u8]) -> Result<u32> {
    if bytes.is_empty() || bytes.len() > 4 {
        return Err(Error::Protocol(format!(
            "bad big-endian integer width: {}",
            bytes.len()
        )));
    }
    Ok(bytes.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32))
}

fn parse_prekey_bundle(user_node: &Node) -> Result<PreKeyBundle> {
    let jid: JID = user_node.attr_or_missing("jid")?.parse()?;

    let registration_id = read_be_u32(user_node.binary_child("registration")?)?;
    let identity_key = user_node.binary_child("identity")?.to_vec();

    let skey_node = user_node.expect_child("skey")?;
    let signed_pre_key = SignedPreKey {
        id: read_be_u32(skey_node.binary_child("id")?)?,
        public: skey_node.binary_child("value")?.to_vec(),
        signature: skey_node.binary_child("signature")?.to_vec(),
    };

    let pre_key = match user_node.find_child("key") {
        Some(key_node) => Some(OneTimePreKey {
            id: read_be_u32(key_node.binary_child("id")?)?,
            public: key_node.binary_child("value")?.to_vec(),
        }),
        None => None,
    };

    Ok(PreKeyBundle {
        jid,
        registration_id,
        identity_key,
        signed_pre_key,
        pre_key,
    })
}
