pub mod events;
pub mod jid;

pub use events::*;
pub use jid::*;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Key identifying one message within a chat
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    pub remote_jid: JID,
    pub from_me: bool,
    pub id: String,
    pub participant: Option<JID>,
}

/// Local account credentials the relay needs to address and attest
/// outbound stanzas
#[derive(Debug, Clone)]
pub struct AuthCreds {
    /// The local device JID
    pub me: JID,
    /// The account's linked-identity JID, when assigned
    pub lid: Option<JID>,
    /// Signed device identity attached when a recipient session was
    /// freshly established
    pub signed_identity: crate::proto::AdvSignedDeviceIdentity,
}

/// A stored message together with its key, as handed to the media
/// retry flow
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub key: MessageKey,
    pub message: crate::proto::Message,
}

/// Group metadata as consumed by the relay: the participant user list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub jid: JID,
    pub subject: Option<String>,
    pub participants: Vec<JID>,
}

/// Account privacy settings, keyed by category name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrivacySettings {
    pub categories: HashMap<String, String>,
}

impl PrivacySettings {
    /// Whether read receipts are sent to everybody
    pub fn read_receipts_enabled(&self) -> bool {
        self.categories.get("readreceipts").map(String::as_str) == Some("all")
    }
}

/// Receipt variants sharing the same stanza model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptType {
    /// Plain delivery acknowledgement (no `type` attribute on the wire)
    Ack,
    Read,
    ReadSelf,
    Sender,
    Inactive,
    PeerMsg,
    HistSync,
}

impl ReceiptType {
    /// The wire value of the `type` attribute, if any
    pub fn as_wire_value(&self) -> Option<&'static str> {
        match self {
            ReceiptType::Ack => None,
            ReceiptType::Read => Some("read"),
            ReceiptType::ReadSelf => Some("read-self"),
            ReceiptType::Sender => Some("sender"),
            ReceiptType::Inactive => Some("inactive"),
            ReceiptType::PeerMsg => Some("peer_msg"),
            ReceiptType::HistSync => Some("hist_sync"),
        }
    }

    /// Read receipts carry a timestamp attribute
    pub fn is_read(&self) -> bool {
        matches!(self, ReceiptType::Read | ReceiptType::ReadSelf)
    }
}

/// Wire encoding of the `edit` stanza attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditAttr {
    Edit,
    Pin,
    SelfDelete,
    AdminDelete,
}

impl EditAttr {
    pub fn as_wire_value(&self) -> &'static str {
        match self {
            EditAttr::Edit => "1",
            EditAttr::Pin => "2",
            EditAttr::SelfDelete => "7",
            EditAttr::AdminDelete => "8",
        }
    }
}
