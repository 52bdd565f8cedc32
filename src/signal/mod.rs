//! Signal protocol surface consumed by the relay.
//!
//! The curve math, X3DH, and the double ratchet are deliberately outside
//! this crate; the relay drives them through the opaque
//! [`SignalRepository`] capability and only owns the group sender-key
//! ring state ([`sender_key`]).

pub mod sender_key;

pub use sender_key::{SenderKeyRecord, SenderKeyStateStructure, MAX_SENDER_KEY_STATES};

use crate::{error::Result, types::JID};
use async_trait::async_trait;
use bytes::Bytes;

/// Ciphertext kind produced by a pairwise encryption
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncType {
    /// Regular ratchet message
    Msg,
    /// Prekey-initiated message: first message of a fresh session
    Pkmsg,
}

impl EncType {
    pub fn as_wire_value(&self) -> &'static str {
        match self {
            EncType::Msg => "msg",
            EncType::Pkmsg => "pkmsg",
        }
    }
}

/// Result of a pairwise encryption
#[derive(Debug, Clone)]
pub struct EncryptedPayload {
    pub enc_type: EncType,
    pub ciphertext: Bytes,
}

/// Result of a group (sender-key) encryption
#[derive(Debug, Clone)]
pub struct GroupEncryptResult {
    /// The `skmsg` payload
    pub ciphertext: Bytes,
    /// Serialized distribution message for devices that lack the
    /// current sender key
    pub sender_key_distribution: Bytes,
}

/// A one-time prekey from a fetched bundle
#[derive(Debug, Clone, PartialEq)]
pub struct OneTimePreKey {
    pub id: u32,
    pub public: Vec<u8>,
}

/// A signed prekey from a fetched bundle
#[derive(Debug, Clone, PartialEq)]
pub struct SignedPreKey {
    pub id: u32,
    pub public: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Prekey bundle fetched for one device, ready for session initiation
#[derive(Debug, Clone, PartialEq)]
pub struct PreKeyBundle {
    pub jid: JID,
    pub registration_id: u32,
    pub identity_key: Vec<u8>,
    pub signed_pre_key: SignedPreKey,
    pub pre_key: Option<OneTimePreKey>,
}

/// Opaque Signal protocol capability.
///
/// Implementations own the ratchet state and write session records under
/// the `session` store category keyed by [`JID::signal_address`]; the
/// relay's session asserter relies on that contract.
#[async_trait]
pub trait SignalRepository: Send + Sync {
    /// Encrypt a serialized message for one device
    async fn encrypt_message(&self, jid: &JID, plaintext: &[u8]) -> Result<EncryptedPayload>;

    /// Encrypt a serialized message for a group with the sender key,
    /// returning the ciphertext together with the current distribution
    /// message
    async fn encrypt_group_message(
        &self,
        group: &JID,
        me: &JID,
        plaintext: &[u8],
    ) -> Result<GroupEncryptResult>;

    /// Install a fetched prekey bundle, initiating a pairwise session
    /// (X3DH)
    async fn inject_prekey_bundle(&self, jid: &JID, bundle: PreKeyBundle) -> Result<()>;
}
