//! Group sender-key state ring.
//!
//! Each group holds up to [`MAX_SENDER_KEY_STATES`] sender-key states,
//! newest at the tail. The ring tolerates out-of-order rotation
//! notifications from other participants: a superseded key stays
//! decryptable until it falls off the head. Every read re-validates the
//! state so storage corruption surfaces as absence, never as a
//! cryptographic fault.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Ring capacity; on overflow the oldest state is dropped
pub const MAX_SENDER_KEY_STATES: usize = 5;

/// Serde codec for binary fields in the sender-key record wire format.
///
/// Emits `{"type":"Buffer","data":"<base64>"}`; accepts that form with
/// either a base64 string or a byte array as `data`, plus a bare byte
/// array or bare base64 string.
mod buffer_json {
    use base64::Engine;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("type", "Buffer")?;
        map.serialize_entry(
            "data",
            &base64::engine::general_purpose::STANDARD.encode(bytes),
        )?;
        map.end()
    }

    pub fn decode_value(value: &Value) -> Option<Vec<u8>> {
        match value {
            Value::String(s) => base64::engine::general_purpose::STANDARD.decode(s).ok(),
            Value::Array(items) => items
                .iter()
                .map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
                .collect(),
            Value::Object(map) => {
                if map.get("type").and_then(Value::as_str) != Some("Buffer") {
                    return None;
                }
                decode_value(map.get("data")?)
            }
            _ => None,
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let value = Value::deserialize(deserializer)?;
        decode_value(&value).ok_or_else(|| D::Error::custom("unrecognized binary encoding"))
    }

    pub mod opt {
        use serde::de::Error as _;
        use serde::{Deserialize, Deserializer, Serializer};
        use serde_json::Value;

        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(bytes) => super::serialize(bytes, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            let value = Value::deserialize(deserializer)?;
            if value.is_null() {
                return Ok(None);
            }
            super::decode_value(&value)
                .map(Some)
                .ok_or_else(|| D::Error::custom("unrecognized binary encoding"))
        }
    }
}

/// One step of a sender chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderChainKey {
    pub iteration: u32,
    #[serde(with = "buffer_json")]
    pub seed: Vec<u8>,
}

/// Cached message key for out-of-order decryption
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderMessageKey {
    pub iteration: u32,
    #[serde(with = "buffer_json")]
    pub seed: Vec<u8>,
}

/// Signing key of the state; `private` is only present when this
/// endpoint owns the key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderSigningKey {
    #[serde(with = "buffer_json")]
    pub public: Vec<u8>,
    #[serde(
        default,
        with = "buffer_json::opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub private: Option<Vec<u8>>,
}

/// A single sender-key state.
///
/// `senderChainKey` and `senderSigningKey` are optional so corrupt
/// records still deserialize; they then fail [`Self::is_valid`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderKeyStateStructure {
    #[serde(default)]
    pub sender_key_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_chain_key: Option<SenderChainKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_signing_key: Option<SenderSigningKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sender_message_keys: Vec<SenderMessageKey>,
}

impl SenderKeyStateStructure {
    /// A state is usable iff it has a positive key id, a chain key, and
    /// a non-empty public signing key
    pub fn is_valid(&self) -> bool {
        self.sender_key_id > 0
            && self.sender_chain_key.is_some()
            && self
                .sender_signing_key
                .as_ref()
                .map(|k| !k.public.is_empty())
                .unwrap_or(false)
    }
}

/// Ordered ring of sender-key states for one group, newest at the tail
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SenderKeyRecord {
    states: Vec<SenderKeyStateStructure>,
}

impl SenderKeyRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn states(&self) -> &[SenderKeyStateStructure] {
        &self.states
    }

    /// The newest valid state, scanning from the tail.
    ///
    /// When no valid state exists the record empties itself and the
    /// result indicates absence.
    pub fn sender_key_state(&mut self) -> Option<&SenderKeyStateStructure> {
        let idx = self.states.iter().rposition(|s| s.is_valid());
        match idx {
            Some(idx) => Some(&self.states[idx]),
            None => {
                self.states.clear();
                None
            }
        }
    }

    /// The first valid state with the given key id
    pub fn sender_key_state_by_id(&self, key_id: u32) -> Option<&SenderKeyStateStructure> {
        self.states
            .iter()
            .find(|s| s.sender_key_id == key_id && s.is_valid())
    }

    /// Append a state received from another participant, evicting the
    /// oldest state past the ring cap
    pub fn add_sender_key_state(
        &mut self,
        key_id: u32,
        iteration: u32,
        chain_seed: Vec<u8>,
        signing_public: Vec<u8>,
    ) {
        self.states.push(SenderKeyStateStructure {
            sender_key_id: key_id,
            sender_chain_key: Some(SenderChainKey {
                iteration,
                seed: chain_seed,
            }),
            sender_signing_key: Some(SenderSigningKey {
                public: signing_public,
                private: None,
            }),
            sender_message_keys: Vec::new(),
        });
        while self.states.len() > MAX_SENDER_KEY_STATES {
            self.states.remove(0);
        }
    }

    /// Destructive reset to a single full state; used when this endpoint
    /// is the sender and owns the private signing key
    pub fn set_sender_key_state(
        &mut self,
        key_id: u32,
        iteration: u32,
        chain_seed: Vec<u8>,
        signing_public: Vec<u8>,
        signing_private: Vec<u8>,
    ) {
        self.states.clear();
        self.states.push(SenderKeyStateStructure {
            sender_key_id: key_id,
            sender_chain_key: Some(SenderChainKey {
                iteration,
                seed: chain_seed,
            }),
            sender_signing_key: Some(SenderSigningKey {
                public: signing_public,
                private: Some(signing_private),
            }),
            sender_message_keys: Vec::new(),
        });
    }

    /// Serialize to the JSON-array wire format
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.states)?)
    }

    /// Deserialize from UTF-8 JSON bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    /// Deserialize from a pre-parsed JSON value.
    ///
    /// A JSON string value is unwrapped first (double-encoded records
    /// occur in the wild). Array elements that fail to parse are dropped
    /// rather than failing the record.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let value = match value {
            serde_json::Value::String(s) => serde_json::from_str(&s)?,
            other => other,
        };
        let items = match value {
            serde_json::Value::Array(items) => items,
            _ => {
                return Err(Error::Serialization(
                    "sender key record is not an array".to_string(),
                ))
            }
        };
        let states = items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect();
        Ok(Self { states })
    }
}
