//! Device discovery over the USync protocol.
//!
//! Resolves user identifiers to their set of `(user, device)` pairs with
//! a per-process TTL cache. All misses of one call batch into a single
//! query stanza, and the cache is updated in one batch per fetch.

use crate::{
    binary::Node,
    error::Result,
    transport::StanzaTransport,
    types::JID,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

struct CachedDevices {
    devices: Vec<JID>,
    fetched_at: Instant,
}

/// Resolves users to their active device JIDs
pub struct DeviceResolver {
    transport: Arc<dyn StanzaTransport>,
    ttl: Duration,
    cache: Mutex<HashMap<String, CachedDevices>>,
}

impl DeviceResolver {
    pub fn new(transport: Arc<dyn StanzaTransport>, ttl: Duration) -> Self {
        Self {
            transport,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the device lists of the given users.
    ///
    /// With `use_cache`, fresh cache entries are returned directly and
    /// only the misses go over the wire. The caller's own device is
    /// always suppressed; with `drop_zero_devices` the local account's
    /// primary is suppressed too (callers that already queued the
    /// primaries themselves).
    pub async fn resolve_devices(
        &self,
        jids: &[JID],
        use_cache: bool,
        drop_zero_devices: bool,
        me: &JID,
    ) -> Result<Vec<JID>> {
        if jids.is_empty() {
            return Ok(Vec::new());
        }

        let mut seen = HashSet::new();
        let users: Vec<JID> = jids
            .iter()
            .filter(|jid| seen.insert(jid.to_non_ad()))
            .cloned()
            .collect();

        let mut results = Vec::new();
        let mut to_fetch = Vec::new();

        if use_cache {
            let cache = self.cache.lock().await;
            for user in &users {
                match cache.get(&user.to_non_ad()) {
                    Some(entry) if entry.fetched_at.elapsed() < self.ttl => {
                        results.extend(entry.devices.iter().cloned());
                    }
                    _ => to_fetch.push(user.clone()),
                }
            }
        } else {
            to_fetch = users;
        }

        if to_fetch.is_empty() {
            return Ok(results);
        }

        debug!("resolving devices for {} users", to_fetch.len());
        let fetched = self.fetch_devices(&to_fetch, drop_zero_devices, me).await?;

        let now = Instant::now();
        let mut cache = self.cache.lock().await;
        for user in &to_fetch {
            let devices = fetched.get(&user.to_non_ad()).cloned().unwrap_or_default();
            results.extend(devices.iter().cloned());
            cache.insert(
                user.to_non_ad(),
                CachedDevices {
                    devices,
                    fetched_at: now,
                },
            );
        }

        Ok(results)
    }

    /// Issue one USync query for all listed users and group the parsed
    /// devices per user
    async fn fetch_devices(
        &self,
        users: &[JID],
        drop_zero_devices: bool,
        me: &JID,
    ) -> Result<HashMap<String, Vec<JID>>> {
        let user_nodes: Vec<Node> = users
            .iter()
            .map(|jid| Node::new("user").attr("jid", jid.to_non_ad()))
            .collect();

        let iq = Node::new("iq")
            .attr("to", crate::types::DEFAULT_USER_SERVER)
            .attr("type", "get")
            .attr("xmlns", "usync")
            .attr("id", uuid::Uuid::new_v4().to_string())
            .with_children(vec![Node::new("usync")
                .attr("sid", uuid::Uuid::new_v4().to_string())
                .attr("mode", "query")
                .attr("last", "true")
                .attr("index", "0")
                .attr("context", "message")
                .with_children(vec![
                    Node::new("query")
                        .with_children(vec![Node::new("devices").attr("version", "2")]),
                    Node::new("list").with_children(user_nodes),
                ])]);

        let response = self.transport.query(iq).await?;
        let list = response.expect_child("usync")?.expect_child("list")?;

        let mut grouped: HashMap<String, Vec<JID>> = HashMap::new();
        for user_node in list.find_children("user") {
            let jid: JID = user_node.attr_or_missing("jid")?.parse()?;
            let device_list = user_node
                .expect_child("devices")?
                .expect_child("device-list")?;

            let devices = grouped.entry(jid.to_non_ad()).or_default();
            for device_node in device_list.find_children("device") {
                let id: u16 = device_node
                    .attr_or_missing("id")?
                    .parse()
                    .map_err(|_| crate::Error::Protocol("non-numeric device id".to_string()))?;
                let device_jid = jid.with_device(id);

                // Never encrypt to the device we are sending from.
                if device_jid.same_user(me) && device_jid.device == me.device {
                    continue;
                }
                if drop_zero_devices && id == 0 && device_jid.same_user(me) {
                    continue;
                }
                devices.push(device_jid);
            }
        }

        Ok(grouped)
    }
}
