//! Media retry re-encryption flow helpers.
//!
//! When a download URL for an old message has expired, the sender asks
//! the originating device to re-upload: a signed retry request goes out
//! as a `server-error` receipt, and the answer comes back as an
//! encrypted notification carrying a fresh direct path. Both directions
//! are bound to the message's `mediaKey`.

use crate::{
    binary::Node,
    error::{Error, Result},
    proto::{self, media_retry_notification::ResultType},
    types::{MessageKey, RetryMedia, JID},
    util::crypto::{hkdf_expand, random_bytes, AesGcm},
};
use prost::Message as _;

const MEDIA_RETRY_HKDF_INFO: &[u8] = b"WhatsApp Media Retry Notification";

/// Default hostname for regenerated media URLs
pub const MEDIA_HOSTNAME: &str = "mmg.whatsapp.net";

/// Derive the AES key binding a retry exchange to its media key
pub fn media_retry_key(media_key: &[u8]) -> Result<Vec<u8>> {
    hkdf_expand(media_key, MEDIA_RETRY_HKDF_INFO, 32)
}

/// Build the signed retry request stanza for a message key
pub fn encrypt_media_retry_request(
    key: &MessageKey,
    media_key: &[u8],
    me: &JID,
) -> Result<Node> {
    let receipt = proto::ServerErrorReceipt {
        stanza_id: Some(key.id.clone()),
    };
    let plaintext = receipt.encode_to_vec();

    let retry_key = media_retry_key(media_key)?;
    let iv = random_bytes(12);
    let ciphertext =
        AesGcm::new(&retry_key)?.encrypt_with_aad(&iv, &plaintext, key.id.as_bytes())?;

    let mut rmr = Node::new("rmr")
        .attr("jid", key.remote_jid.to_string())
        .attr("from_me", if key.from_me { "true" } else { "false" });
    if let Some(participant) = &key.participant {
        rmr = rmr.attr("participant", participant.to_string());
    }

    Ok(Node::new("receipt")
        .attr("id", key.id.clone())
        .attr("to", me.to_non_ad())
        .attr("type", "server-error")
        .with_children(vec![
            Node::new("encrypt").with_children(vec![
                Node::new("enc_p").with_binary(ciphertext),
                Node::new("enc_iv").with_binary(iv),
            ]),
            rmr,
        ]))
}

/// Decrypt a media re-upload notification with the original media key
pub fn decrypt_media_retry_data(
    media: &RetryMedia,
    media_key: &[u8],
    message_id: &str,
) -> Result<proto::MediaRetryNotification> {
    let retry_key = media_retry_key(media_key)?;
    let plaintext = AesGcm::new(&retry_key)?.decrypt_with_aad(
        &media.iv,
        &media.ciphertext,
        message_id.as_bytes(),
    )?;
    Ok(proto::MediaRetryNotification::decode(&plaintext[..])?)
}

/// HTTP-like status for a retry result, for caller convenience
pub fn media_retry_status_code(result: i32) -> u16 {
    match ResultType::try_from(result) {
        Ok(ResultType::Success) => 200,
        Ok(ResultType::NotFound) => 404,
        Ok(ResultType::DecryptionError) => 412,
        Ok(ResultType::GeneralError) => 418,
        Err(_) => 404,
    }
}

/// Regenerate a download URL from a refreshed direct path
pub fn url_from_direct_path(direct_path: &str) -> Result<String> {
    let url = url::Url::parse(&format!("https://{}{}", MEDIA_HOSTNAME, direct_path))
        .map_err(|e| Error::Protocol(format!("bad direct path: {}", e)))?;
    Ok(url.to_string())
}
