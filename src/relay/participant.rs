//! Per-recipient participant node construction.

use crate::{
    binary::Node,
    config::MessagePatcher,
    error::Result,
    proto,
    signal::{EncType, SignalRepository},
    types::JID,
};
use futures_util::future::try_join_all;
use std::collections::HashMap;
use std::sync::Arc;

/// Encrypt a message once per recipient device and build the per-device
/// stanza envelopes.
///
/// Returns the `<to>` nodes together with whether any recipient received
/// a `pkmsg`; in that case the caller must attach the signed device
/// identity to the outer stanza. Empty input short-circuits without
/// touching the patch hook or the encryption primitive.
pub(crate) async fn create_participant_nodes(
    signal: &Arc<dyn SignalRepository>,
    patcher: Option<&Arc<dyn MessagePatcher>>,
    jids: &[JID],
    message: &proto::Message,
    extra_attrs: &HashMap<String, String>,
) -> Result<(Vec<Node>, bool)> {
    if jids.is_empty() {
        return Ok((Vec::new(), false));
    }

    let patched = match patcher {
        Some(patcher) => patcher.patch_message(message.clone(), jids).await?,
        None => message.clone(),
    };
    let plaintext = proto::encode_message(&patched);

    let encryptions = jids.iter().map(|jid| {
        let signal = signal.clone();
        let plaintext = &plaintext;
        async move {
            let payload = signal.encrypt_message(jid, plaintext).await?;
            Ok::<_, crate::Error>((jid, payload))
        }
    });
    let encrypted = try_join_all(encryptions).await?;

    let mut include_device_identity = false;
    let nodes = encrypted
        .into_iter()
        .map(|(jid, payload)| {
            if payload.enc_type == EncType::Pkmsg {
                include_device_identity = true;
            }
            let mut enc = Node::new("enc")
                .attr("v", "2")
                .attr("type", payload.enc_type.as_wire_value());
            for (key, value) in extra_attrs {
                enc = enc.attr(key.clone(), value.clone());
            }
            Node::new("to")
                .attr("jid", jid.to_string())
                .with_children(vec![enc.with_binary(payload.ciphertext.to_vec())])
        })
        .collect();

    Ok((nodes, include_device_identity))
}
