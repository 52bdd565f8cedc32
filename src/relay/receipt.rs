//! Receipt emission: acknowledgement, read, and sender receipts share
//! one stanza model.

use crate::{
    binary::Node,
    error::{Error, Result},
    relay::RelayEngine,
    types::{MessageKey, PrivacySettings, ReceiptType, JID},
    util::unix_timestamp_seconds,
};
use futures_util::future::try_join_all;
use std::collections::HashMap;
use tracing::debug;

/// Group message keys by `(jid, participant)`, dropping self-originated
/// keys; receipts only ever cover messages we received
pub fn aggregate_message_keys(keys: &[MessageKey]) -> Vec<((JID, Option<JID>), Vec<String>)> {
    let mut order: Vec<(JID, Option<JID>)> = Vec::new();
    let mut grouped: HashMap<(JID, Option<JID>), Vec<String>> = HashMap::new();

    for key in keys.iter().filter(|key| !key.from_me) {
        let group_key = (key.remote_jid.clone(), key.participant.clone());
        if !grouped.contains_key(&group_key) {
            order.push(group_key.clone());
        }
        grouped.entry(group_key).or_default().push(key.id.clone());
    }

    order
        .into_iter()
        .map(|group_key| {
            let ids = grouped.remove(&group_key).unwrap_or_default();
            (group_key, ids)
        })
        .collect()
}

impl RelayEngine {
    /// Emit one receipt stanza for a set of message ids
    pub async fn send_receipt(
        &self,
        jid: &JID,
        participant: Option<&JID>,
        ids: &[String],
        receipt_type: ReceiptType,
    ) -> Result<()> {
        let Some(first_id) = ids.first() else {
            debug!(to = %jid, "skipping receipt with no message ids");
            return Ok(());
        };

        let mut node = Node::new("receipt").attr("id", first_id.clone());
        if receipt_type.is_read() {
            node = node.attr("t", unix_timestamp_seconds().to_string());
        }

        if receipt_type == ReceiptType::Sender && jid.is_user() {
            let participant = participant.ok_or_else(|| {
                Error::Protocol("sender receipt to a user requires a participant".to_string())
            })?;
            node = node
                .attr("recipient", jid.to_string())
                .attr("to", participant.to_string());
        } else {
            node = node.attr("to", jid.to_string());
            if let Some(participant) = participant {
                node = node.attr("participant", participant.to_string());
            }
        }

        if let Some(wire_type) = receipt_type.as_wire_value() {
            node = node.attr("type", wire_type);
        }

        if ids.len() > 1 {
            let items = ids[1..]
                .iter()
                .map(|id| Node::new("item").attr("id", id.clone()))
                .collect();
            node = node.with_children(vec![Node::new("list").with_children(items)]);
        }

        self.transport.send_node(node).await
    }

    /// Emit receipts for a set of message keys, one stanza per
    /// `(jid, participant)` group, in parallel
    pub async fn send_receipts(&self, keys: &[MessageKey], receipt_type: ReceiptType) -> Result<()> {
        let groups = aggregate_message_keys(keys);
        try_join_all(groups.iter().map(|((jid, participant), ids)| {
            self.send_receipt(jid, participant.as_ref(), ids, receipt_type)
        }))
        .await?;
        Ok(())
    }

    /// Mark messages read, honoring the account's read-receipt privacy
    /// setting
    pub async fn read_messages(&self, keys: &[MessageKey]) -> Result<()> {
        let privacy = self.privacy_settings().await?;
        let receipt_type = if privacy.read_receipts_enabled() {
            ReceiptType::Read
        } else {
            ReceiptType::ReadSelf
        };
        self.send_receipts(keys, receipt_type).await
    }

    /// The account privacy settings, fetched once and cached for the
    /// engine's lifetime
    pub async fn privacy_settings(&self) -> Result<PrivacySettings> {
        if let Some(settings) = self.privacy.get() {
            return Ok(settings.clone());
        }

        let iq = Node::new("iq")
            .attr("to", crate::types::DEFAULT_USER_SERVER)
            .attr("type", "get")
            .attr("xmlns", "privacy")
            .attr("id", uuid::Uuid::new_v4().to_string())
            .with_children(vec![Node::new("privacy")]);
        let response = self.transport.query(iq).await?;
        let privacy_node = response.expect_child("privacy")?;

        let mut categories = HashMap::new();
        for category in privacy_node.find_children("category") {
            if let (Some(name), Some(value)) = (category.get_attr("name"), category.get_attr("value"))
            {
                categories.insert(name.to_string(), value.to_string());
            }
        }

        let settings = PrivacySettings { categories };
        let _ = self.privacy.set(settings.clone());
        Ok(settings)
    }

    /// Grant trusted-contact privacy tokens to the listed users
    pub async fn send_privacy_tokens(&self, jids: &[JID]) -> Result<()> {
        if jids.is_empty() {
            return Ok(());
        }

        let t = unix_timestamp_seconds().to_string();
        let tokens: Vec<Node> = jids
            .iter()
            .map(|jid| {
                Node::new("token")
                    .attr("jid", jid.to_non_ad())
                    .attr("t", t.clone())
                    .attr("type", "trusted_contact")
            })
            .collect();

        let iq = Node::new("iq")
            .attr("to", crate::types::DEFAULT_USER_SERVER)
            .attr("type", "set")
            .attr("xmlns", "privacy")
            .attr("id", uuid::Uuid::new_v4().to_string())
            .with_children(vec![Node::new("tokens").with_children(tokens)]);
        self.transport.query(iq).await?;
        Ok(())
    }
}
