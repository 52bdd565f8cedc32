//! Media type stamping for outbound message stanzas.

use crate::proto;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

/// Cache bound; the map is cleared wholesale at this size
pub const MEDIA_TYPE_CACHE_BOUND: usize = 500;

const MEDIA_TYPE_CACHE_CLEAR_INTERVAL: Duration = Duration::from_secs(3600);

/// The `mediatype` attribute value for a message, first match wins
pub fn media_type_for(message: &proto::Message) -> Option<&'static str> {
    if message.image_message.is_some() {
        return Some("image");
    }
    if let Some(video) = &message.video_message {
        return Some(if video.gif_playback.unwrap_or(false) {
            "gif"
        } else {
            "video"
        });
    }
    if let Some(audio) = &message.audio_message {
        return Some(if audio.ptt.unwrap_or(false) {
            "ptt"
        } else {
            "audio"
        });
    }
    if message.document_message.is_some() {
        return Some("document");
    }
    if message.sticker_message.is_some() {
        return Some("sticker");
    }
    if message.contact_message.is_some() {
        return Some("vcard");
    }
    if message.contacts_array_message.is_some() {
        return Some("contact_array");
    }
    if message.live_location_message.is_some() {
        return Some("livelocation");
    }
    if message.list_message.is_some() {
        return Some("list");
    }
    if message.list_response_message.is_some() {
        return Some("list_response");
    }
    if message.buttons_response_message.is_some() {
        return Some("buttons_response");
    }
    if message.order_message.is_some() {
        return Some("order");
    }
    if message.product_message.is_some() {
        return Some("product");
    }
    if message.interactive_response_message.is_some() {
        return Some("native_flow_response");
    }
    if message.group_invite_message.is_some() {
        return Some("url");
    }
    None
}

/// Bounded lookup cache keyed by the hash of the message's populated
/// top-level fields; cleared wholesale on overflow or hourly
pub struct MediaTypeCache {
    map: HashMap<u64, Option<&'static str>>,
    last_clear: Instant,
}

impl MediaTypeCache {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
            last_clear: Instant::now(),
        }
    }

    pub fn lookup(&mut self, message: &proto::Message) -> Option<&'static str> {
        if self.map.len() >= MEDIA_TYPE_CACHE_BOUND
            || self.last_clear.elapsed() > MEDIA_TYPE_CACHE_CLEAR_INTERVAL
        {
            self.map.clear();
            self.last_clear = Instant::now();
        }

        let mut hasher = DefaultHasher::new();
        message.present_fields().hash(&mut hasher);
        // gif/ptt flags change the result without changing field presence
        message
            .video_message
            .as_ref()
            .and_then(|v| v.gif_playback)
            .hash(&mut hasher);
        message
            .audio_message
            .as_ref()
            .and_then(|a| a.ptt)
            .hash(&mut hasher);
        let key = hasher.finish();

        *self
            .map
            .entry(key)
            .or_insert_with(|| media_type_for(message))
    }
}

impl Default for MediaTypeCache {
    fn default() -> Self {
        Self::new()
    }
}
