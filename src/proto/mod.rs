// WhatsApp Protocol Buffer Definitions
//
// Hand-maintained prost structs for the E2E message schema subset the
// relay touches. Field tags follow the upstream .proto files so encoded
// payloads interoperate with other clients.

use prost::Message as ProstMessage;

/// Key identifying one message within a chat (wire form)
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageKey {
    #[prost(string, optional, tag = "1")]
    pub remote_jid: Option<String>,
    #[prost(bool, optional, tag = "2")]
    pub from_me: Option<bool>,
    #[prost(string, optional, tag = "3")]
    pub id: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub participant: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ImageMessage {
    #[prost(string, optional, tag = "1")]
    pub url: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub mimetype: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub caption: Option<String>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub file_sha256: Option<Vec<u8>>,
    #[prost(uint64, optional, tag = "5")]
    pub file_length: Option<u64>,
    #[prost(uint32, optional, tag = "6")]
    pub height: Option<u32>,
    #[prost(uint32, optional, tag = "7")]
    pub width: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "8")]
    pub media_key: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "9")]
    pub file_enc_sha256: Option<Vec<u8>>,
    #[prost(string, optional, tag = "11")]
    pub direct_path: Option<String>,
    #[prost(int64, optional, tag = "12")]
    pub media_key_timestamp: Option<i64>,
    #[prost(bytes = "vec", optional, tag = "16")]
    pub jpeg_thumbnail: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VideoMessage {
    #[prost(string, optional, tag = "1")]
    pub url: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub mimetype: Option<String>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub file_sha256: Option<Vec<u8>>,
    #[prost(uint64, optional, tag = "4")]
    pub file_length: Option<u64>,
    #[prost(uint32, optional, tag = "5")]
    pub seconds: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "6")]
    pub media_key: Option<Vec<u8>>,
    #[prost(string, optional, tag = "7")]
    pub caption: Option<String>,
    #[prost(bool, optional, tag = "8")]
    pub gif_playback: Option<bool>,
    #[prost(uint32, optional, tag = "9")]
    pub height: Option<u32>,
    #[prost(uint32, optional, tag = "10")]
    pub width: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "11")]
    pub file_enc_sha256: Option<Vec<u8>>,
    #[prost(string, optional, tag = "13")]
    pub direct_path: Option<String>,
    #[prost(bytes = "vec", optional, tag = "16")]
    pub jpeg_thumbnail: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AudioMessage {
    #[prost(string, optional, tag = "1")]
    pub url: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub mimetype: Option<String>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub file_sha256: Option<Vec<u8>>,
    #[prost(uint64, optional, tag = "4")]
    pub file_length: Option<u64>,
    #[prost(uint32, optional, tag = "5")]
    pub seconds: Option<u32>,
    #[prost(bool, optional, tag = "6")]
    pub ptt: Option<bool>,
    #[prost(bytes = "vec", optional, tag = "7")]
    pub media_key: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "8")]
    pub file_enc_sha256: Option<Vec<u8>>,
    #[prost(string, optional, tag = "9")]
    pub direct_path: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DocumentMessage {
    #[prost(string, optional, tag = "1")]
    pub url: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub mimetype: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub title: Option<String>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub file_sha256: Option<Vec<u8>>,
    #[prost(uint64, optional, tag = "5")]
    pub file_length: Option<u64>,
    #[prost(uint32, optional, tag = "6")]
    pub page_count: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "7")]
    pub media_key: Option<Vec<u8>>,
    #[prost(string, optional, tag = "8")]
    pub file_name: Option<String>,
    #[prost(bytes = "vec", optional, tag = "9")]
    pub file_enc_sha256: Option<Vec<u8>>,
    #[prost(string, optional, tag = "10")]
    pub direct_path: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StickerMessage {
    #[prost(string, optional, tag = "1")]
    pub url: Option<String>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub file_sha256: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub file_enc_sha256: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub media_key: Option<Vec<u8>>,
    #[prost(string, optional, tag = "5")]
    pub mimetype: Option<String>,
    #[prost(uint32, optional, tag = "6")]
    pub height: Option<u32>,
    #[prost(uint32, optional, tag = "7")]
    pub width: Option<u32>,
    #[prost(string, optional, tag = "8")]
    pub direct_path: Option<String>,
    #[prost(uint64, optional, tag = "9")]
    pub file_length: Option<u64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContactMessage {
    #[prost(string, optional, tag = "1")]
    pub display_name: Option<String>,
    #[prost(string, optional, tag = "16")]
    pub vcard: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContactsArrayMessage {
    #[prost(string, optional, tag = "1")]
    pub display_name: Option<String>,
    #[prost(message, repeated, tag = "2")]
    pub contacts: Vec<ContactMessage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExtendedTextMessage {
    #[prost(string, optional, tag = "1")]
    pub text: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub matched_text: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub canonical_url: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub description: Option<String>,
    #[prost(string, optional, tag = "6")]
    pub title: Option<String>,
    #[prost(bytes = "vec", optional, tag = "16")]
    pub jpeg_thumbnail: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LiveLocationMessage {
    #[prost(double, optional, tag = "1")]
    pub degrees_latitude: Option<f64>,
    #[prost(double, optional, tag = "2")]
    pub degrees_longitude: Option<f64>,
    #[prost(uint32, optional, tag = "3")]
    pub accuracy_in_meters: Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListMessage {
    #[prost(string, optional, tag = "1")]
    pub title: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub description: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListResponseMessage {
    #[prost(string, optional, tag = "1")]
    pub title: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ButtonsResponseMessage {
    #[prost(string, optional, tag = "1")]
    pub selected_button_id: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OrderMessage {
    #[prost(string, optional, tag = "1")]
    pub order_id: Option<String>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub thumbnail: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProductMessage {
    #[prost(string, optional, tag = "2")]
    pub business_owner_jid: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InteractiveResponseMessage {
    #[prost(message, optional, tag = "2")]
    pub native_flow_response_message: Option<NativeFlowResponseMessage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NativeFlowResponseMessage {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub params_json: Option<String>,
    #[prost(int32, optional, tag = "3")]
    pub version: Option<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GroupInviteMessage {
    #[prost(string, optional, tag = "1")]
    pub group_jid: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub invite_code: Option<String>,
    #[prost(int64, optional, tag = "3")]
    pub invite_expiration: Option<i64>,
    #[prost(string, optional, tag = "4")]
    pub group_name: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PollOption {
    #[prost(string, optional, tag = "1")]
    pub option_name: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PollCreationMessage {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub enc_key: Option<Vec<u8>>,
    #[prost(string, optional, tag = "2")]
    pub name: Option<String>,
    #[prost(message, repeated, tag = "3")]
    pub options: Vec<PollOption>,
    #[prost(uint32, optional, tag = "4")]
    pub selectable_options_count: Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PinInChatMessage {
    #[prost(message, optional, tag = "1")]
    pub key: Option<MessageKey>,
    #[prost(int32, optional, tag = "2")]
    pub r#type: Option<i32>,
    #[prost(int64, optional, tag = "3")]
    pub sender_timestamp_ms: Option<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtocolMessage {
    #[prost(message, optional, tag = "1")]
    pub key: Option<MessageKey>,
    #[prost(int32, optional, tag = "2")]
    pub r#type: Option<i32>,
}

/// Wrapper carried by copies delivered to the sender's own devices
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceSentMessage {
    #[prost(string, optional, tag = "1")]
    pub destination_jid: Option<String>,
    #[prost(message, optional, boxed, tag = "2")]
    pub message: Option<Box<Message>>,
    #[prost(string, optional, tag = "3")]
    pub phash: Option<String>,
}

/// Sender-key rotation payload for group encryption
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SenderKeyDistributionMessage {
    #[prost(string, optional, tag = "1")]
    pub group_id: Option<String>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub axolotl_sender_key_distribution_message: Option<Vec<u8>>,
}

/// Account device identity, signed at pairing time
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AdvSignedDeviceIdentity {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub details: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub account_signature_key: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub account_signature: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub device_signature: Option<Vec<u8>>,
}

/// Payload returned by a peer device answering a media retry request
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MediaRetryNotification {
    #[prost(string, optional, tag = "1")]
    pub stanza_id: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub direct_path: Option<String>,
    #[prost(enumeration = "media_retry_notification::ResultType", optional, tag = "3")]
    pub result: Option<i32>,
}

pub mod media_retry_notification {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum ResultType {
        GeneralError = 1,
        Success = 2,
        NotFound = 3,
        DecryptionError = 4,
    }
}

/// Body of a signed media retry request
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerErrorReceipt {
    #[prost(string, optional, tag = "1")]
    pub stanza_id: Option<String>,
}

/// The E2E message envelope: exactly one content arm is normally set
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    #[prost(string, optional, tag = "1")]
    pub conversation: Option<String>,
    #[prost(message, optional, tag = "2")]
    pub sender_key_distribution_message: Option<SenderKeyDistributionMessage>,
    #[prost(message, optional, tag = "3")]
    pub image_message: Option<ImageMessage>,
    #[prost(message, optional, tag = "4")]
    pub contact_message: Option<ContactMessage>,
    #[prost(message, optional, tag = "6")]
    pub extended_text_message: Option<ExtendedTextMessage>,
    #[prost(message, optional, tag = "7")]
    pub document_message: Option<DocumentMessage>,
    #[prost(message, optional, tag = "8")]
    pub audio_message: Option<AudioMessage>,
    #[prost(message, optional, tag = "9")]
    pub video_message: Option<VideoMessage>,
    #[prost(message, optional, tag = "12")]
    pub protocol_message: Option<ProtocolMessage>,
    #[prost(message, optional, tag = "13")]
    pub contacts_array_message: Option<ContactsArrayMessage>,
    #[prost(message, optional, tag = "18")]
    pub live_location_message: Option<LiveLocationMessage>,
    #[prost(message, optional, tag = "26")]
    pub sticker_message: Option<StickerMessage>,
    #[prost(message, optional, tag = "28")]
    pub group_invite_message: Option<GroupInviteMessage>,
    #[prost(message, optional, tag = "30")]
    pub product_message: Option<ProductMessage>,
    #[prost(message, optional, boxed, tag = "31")]
    pub device_sent_message: Option<Box<DeviceSentMessage>>,
    #[prost(message, optional, tag = "36")]
    pub list_message: Option<ListMessage>,
    #[prost(message, optional, tag = "38")]
    pub order_message: Option<OrderMessage>,
    #[prost(message, optional, tag = "39")]
    pub list_response_message: Option<ListResponseMessage>,
    #[prost(message, optional, tag = "43")]
    pub buttons_response_message: Option<ButtonsResponseMessage>,
    #[prost(message, optional, tag = "48")]
    pub interactive_response_message: Option<InteractiveResponseMessage>,
    #[prost(message, optional, tag = "49")]
    pub poll_creation_message: Option<PollCreationMessage>,
    #[prost(message, optional, tag = "60")]
    pub poll_creation_message_v2: Option<PollCreationMessage>,
    #[prost(message, optional, tag = "63")]
    pub pin_in_chat_message: Option<PinInChatMessage>,
    #[prost(message, optional, tag = "64")]
    pub poll_creation_message_v3: Option<PollCreationMessage>,
}

/// Mutable view of the media fields shared by every media arm
pub struct MediaContent<'a> {
    pub media_key: Vec<u8>,
    pub direct_path: &'a mut Option<String>,
    pub url: &'a mut Option<String>,
}

impl Message {
    /// Names of the populated top-level arms, in wire-schema spelling
    pub fn present_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.conversation.is_some() {
            fields.push("conversation");
        }
        if self.sender_key_distribution_message.is_some() {
            fields.push("senderKeyDistributionMessage");
        }
        if self.image_message.is_some() {
            fields.push("imageMessage");
        }
        if self.contact_message.is_some() {
            fields.push("contactMessage");
        }
        if self.extended_text_message.is_some() {
            fields.push("extendedTextMessage");
        }
        if self.document_message.is_some() {
            fields.push("documentMessage");
        }
        if self.audio_message.is_some() {
            fields.push("audioMessage");
        }
        if self.video_message.is_some() {
            fields.push("videoMessage");
        }
        if self.protocol_message.is_some() {
            fields.push("protocolMessage");
        }
        if self.contacts_array_message.is_some() {
            fields.push("contactsArrayMessage");
        }
        if self.live_location_message.is_some() {
            fields.push("liveLocationMessage");
        }
        if self.sticker_message.is_some() {
            fields.push("stickerMessage");
        }
        if self.group_invite_message.is_some() {
            fields.push("groupInviteMessage");
        }
        if self.product_message.is_some() {
            fields.push("productMessage");
        }
        if self.device_sent_message.is_some() {
            fields.push("deviceSentMessage");
        }
        if self.list_message.is_some() {
            fields.push("listMessage");
        }
        if self.order_message.is_some() {
            fields.push("orderMessage");
        }
        if self.list_response_message.is_some() {
            fields.push("listResponseMessage");
        }
        if self.buttons_response_message.is_some() {
            fields.push("buttonsResponseMessage");
        }
        if self.interactive_response_message.is_some() {
            fields.push("interactiveResponseMessage");
        }
        if self.poll_creation_message.is_some() {
            fields.push("pollCreationMessage");
        }
        if self.poll_creation_message_v2.is_some() {
            fields.push("pollCreationMessageV2");
        }
        if self.pin_in_chat_message.is_some() {
            fields.push("pinInChatMessage");
        }
        if self.poll_creation_message_v3.is_some() {
            fields.push("pollCreationMessageV3");
        }
        fields
    }

    /// Whether any poll-creation arm is populated
    pub fn is_poll_creation(&self) -> bool {
        self.poll_creation_message.is_some()
            || self.poll_creation_message_v2.is_some()
            || self.poll_creation_message_v3.is_some()
    }

    /// Borrow the media fields of the populated media arm, if it carries
    /// a media key
    pub fn media_content_mut(&mut self) -> Option<MediaContent<'_>> {
        if let Some(m) = &mut self.image_message {
            if let Some(key) = &m.media_key {
                return Some(MediaContent {
                    media_key: key.clone(),
                    direct_path: &mut m.direct_path,
                    url: &mut m.url,
                });
            }
        }
        if let Some(m) = &mut self.video_message {
            if let Some(key) = &m.media_key {
                return Some(MediaContent {
                    media_key: key.clone(),
                    direct_path: &mut m.direct_path,
                    url: &mut m.url,
                });
            }
        }
        if let Some(m) = &mut self.audio_message {
            if let Some(key) = &m.media_key {
                return Some(MediaContent {
                    media_key: key.clone(),
                    direct_path: &mut m.direct_path,
                    url: &mut m.url,
                });
            }
        }
        if let Some(m) = &mut self.document_message {
            if let Some(key) = &m.media_key {
                return Some(MediaContent {
                    media_key: key.clone(),
                    direct_path: &mut m.direct_path,
                    url: &mut m.url,
                });
            }
        }
        if let Some(m) = &mut self.sticker_message {
            if let Some(key) = &m.media_key {
                return Some(MediaContent {
                    media_key: key.clone(),
                    direct_path: &mut m.direct_path,
                    url: &mut m.url,
                });
            }
        }
        None
    }
}

/// Serialize a message and apply random length padding.
///
/// The pad is 1..=15 bytes, each byte holding the pad length, matching
/// the wire format peers expect before encryption.
pub fn encode_message(message: &Message) -> Vec<u8> {
    let mut buf = message.encode_to_vec();
    let mut pad = [0u8; 1];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut pad);
    let n = pad[0] & 0x0f;
    let n = if n == 0 { 0x0f } else { n };
    buf.extend(std::iter::repeat(n).take(n as usize));
    buf
}

/// Encode the signed device identity for a `<device-identity>` node
pub fn encode_signed_device_identity(
    identity: &AdvSignedDeviceIdentity,
    include_signature_key: bool,
) -> Vec<u8> {
    let mut identity = identity.clone();
    let key_empty = identity
        .account_signature_key
        .as_ref()
        .map(|k| k.is_empty())
        .unwrap_or(true);
    if !include_signature_key || key_empty {
        identity.account_signature_key = None;
    }
    identity.encode_to_vec()
}
