//! The outbound relay engine.
//!
//! Fans a logical message out to every recipient device: classifies the
//! destination, resolves devices, asserts pairwise sessions, rotates and
//! distributes group sender keys, chunks large groups into parallel
//! block dispatches, and assembles the final `<message>` stanzas.

pub mod media_type;
pub mod participant;
pub mod receipt;

use crate::{
    binary::Node,
    config::{RelayCollaborators, RelayConfig},
    error::{Error, Result},
    media::conn::{MediaConnInfo, MediaConnLease},
    media::retry::{
        decrypt_media_retry_data, encrypt_media_retry_request, media_retry_status_code,
        url_from_direct_path,
    },
    proto::{self, media_retry_notification::ResultType},
    session::SessionAsserter,
    signal::SignalRepository,
    store::{Category, KeyStore, KeyValueStore, SenderKeyJanitor},
    transport::StanzaTransport,
    types::{
        AuthCreds, Event, EventBus, GroupMetadata, MessageUpdateEvent, PrivacySettings,
        StoredMessage, DEFAULT_USER_SERVER, JID, LID_SERVER,
    },
    usync::DeviceResolver,
    util::generate_message_id,
};
use futures_util::future::try_join_all;
use once_cell::sync::OnceCell;
use participant::create_participant_nodes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Per-call relay options
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Message id override; generated when absent
    pub message_id: Option<String>,
    /// Explicit single-device recipient override
    pub participant: Option<JID>,
    /// Extra attributes stamped onto the `<message>` stanza
    pub additional_attributes: HashMap<String, String>,
    /// Extra children appended to the `<message>` stanza
    pub additional_nodes: Vec<Node>,
    pub use_user_devices_cache: bool,
    pub use_cached_group_metadata: bool,
    /// Recipient list for status broadcasts
    pub status_jid_list: Vec<JID>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            message_id: None,
            participant: None,
            additional_attributes: HashMap::new(),
            additional_nodes: Vec::new(),
            use_user_devices_cache: true,
            use_cached_group_metadata: true,
            status_jid_list: Vec::new(),
        }
    }
}

/// Additional node marking a poll creation message
pub fn poll_creation_meta_node() -> Node {
    Node::new("meta").attr("polltype", "creation")
}

/// The relay engine; see the module docs
pub struct RelayEngine {
    transport: Arc<dyn StanzaTransport>,
    signal: Arc<dyn SignalRepository>,
    keys: KeyStore,
    events: EventBus,
    config: RelayConfig,
    collaborators: RelayCollaborators,
    creds: Option<AuthCreds>,
    resolver: DeviceResolver,
    sessions: SessionAsserter,
    media_conn: MediaConnLease,
    media_types: StdMutex<media_type::MediaTypeCache>,
    privacy: OnceCell<PrivacySettings>,
}

impl RelayEngine {
    pub fn new(
        transport: Arc<dyn StanzaTransport>,
        signal: Arc<dyn SignalRepository>,
        store: Arc<dyn KeyValueStore>,
        creds: Option<AuthCreds>,
        config: RelayConfig,
        collaborators: RelayCollaborators,
    ) -> Self {
        let keys = KeyStore::new(store);
        Self {
            resolver: DeviceResolver::new(transport.clone(), config.user_devices_cache_ttl),
            sessions: SessionAsserter::new(transport.clone(), signal.clone(), keys.clone()),
            media_conn: MediaConnLease::new(transport.clone()),
            transport,
            signal,
            keys,
            events: EventBus::new(),
            config,
            collaborators,
            creds,
            media_types: StdMutex::new(media_type::MediaTypeCache::new()),
            privacy: OnceCell::new(),
        }
    }

    /// The shared event bus; inbound pipelines feed media updates in
    /// through a clone of this
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The transactional key-store façade
    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    /// A janitor over the same key store
    pub fn janitor(&self) -> SenderKeyJanitor {
        SenderKeyJanitor::new(self.keys.clone())
    }

    /// Refresh (or fetch) the media connection lease
    pub async fn refresh_media_conn(&self, force: bool) -> Result<Arc<MediaConnInfo>> {
        self.media_conn.refresh(force).await
    }

    fn creds(&self) -> Result<&AuthCreds> {
        self.creds.as_ref().ok_or(Error::NotAuthenticated)
    }

    fn lookup_media_type(&self, message: &proto::Message) -> Option<&'static str> {
        self.media_types
            .lock()
            .expect("media type cache lock poisoned")
            .lookup(message)
    }

    /// Relay a message to a destination, fanning out to every recipient
    /// device. Returns the message id used on the wire.
    pub async fn relay_message(
        &self,
        jid: &JID,
        message: proto::Message,
        options: RelayOptions,
    ) -> Result<String> {
        self.creds()?;
        let destination = jid.with_device(0);
        let msg_id = options
            .message_id
            .clone()
            .unwrap_or_else(generate_message_id);

        let mut additional_attributes = options.additional_attributes.clone();
        let is_peer =
            additional_attributes.get("category").map(String::as_str) == Some("peer");

        let mut extra_attrs = HashMap::new();
        if let Some(media_type) = self.lookup_media_type(&message) {
            extra_attrs.insert("mediatype".to_string(), media_type.to_string());
        }
        if message.pin_in_chat_message.is_some() {
            extra_attrs.insert("decrypt-fail".to_string(), "hide".to_string());
        }

        if destination.is_group() || destination.is_status_broadcast() {
            self.relay_to_group(
                &destination,
                &message,
                &msg_id,
                &options,
                &mut additional_attributes,
                &extra_attrs,
            )
            .await?;
        } else {
            self.relay_to_user(
                &destination,
                &message,
                &msg_id,
                &options,
                &mut additional_attributes,
                &extra_attrs,
                is_peer,
            )
            .await?;
        }

        info!(id = %msg_id, to = %destination, "relayed message");
        Ok(msg_id)
    }

    /// User / peer branch: direct pairwise fan-out
    #[allow(clippy::too_many_arguments)]
    async fn relay_to_user(
        &self,
        destination: &JID,
        message: &proto::Message,
        msg_id: &str,
        options: &RelayOptions,
        additional_attributes: &mut HashMap<String, String>,
        extra_attrs: &HashMap<String, String>,
        is_peer: bool,
    ) -> Result<()> {
        let creds = self.creds()?;
        let me = creds.me.clone();
        let is_lid = destination.is_lid();

        let mut devices: Vec<JID> = Vec::new();
        if let Some(participant) = &options.participant {
            additional_attributes.insert("device_fanout".to_string(), "false".to_string());
            devices.push(participant.clone());
        } else {
            devices.push(destination.with_device(0));
            // A companion also copies its own primary; a primary sender
            // never encrypts to itself.
            if me.device != 0 && !destination.same_user(&me) {
                devices.push(me.with_device(0));
            }
            if !is_peer {
                let resolved = self
                    .resolver
                    .resolve_devices(
                        &[me.clone(), destination.clone()],
                        options.use_user_devices_cache,
                        true,
                        &me,
                    )
                    .await?;
                devices.extend(resolved);
            }
        }

        // Partition into own and other devices, rewriting users onto the
        // lid server for lid destinations.
        let me_lid_user = creds.lid.as_ref().map(|lid| lid.user.clone());
        let mut me_jids: Vec<JID> = Vec::new();
        let mut other_jids: Vec<JID> = Vec::new();
        for device in devices {
            let is_me = device.user == me.user
                || me_lid_user.as_deref() == Some(device.user.as_str());
            let server = if is_lid { LID_SERVER } else { DEFAULT_USER_SERVER };
            let user = if is_me && is_lid {
                me_lid_user.clone().unwrap_or_else(|| device.user.clone())
            } else {
                device.user.clone()
            };
            let jid = JID {
                user,
                device: device.device,
                server: server.to_string(),
            };
            if is_me {
                me_jids.push(jid);
            } else {
                other_jids.push(jid);
            }
        }

        let patcher = self.collaborators.patch_message.as_ref();
        self.keys
            .transaction(|_keys| async move {
                let mut all = me_jids.clone();
                all.extend(other_jids.iter().cloned());
                self.sessions.assert_sessions(&all, false).await?;

                let me_message = proto::Message {
                    device_sent_message: Some(Box::new(proto::DeviceSentMessage {
                        destination_jid: Some(destination.to_string()),
                        message: Some(Box::new(message.clone())),
                        phash: None,
                    })),
                    ..Default::default()
                };

                let ((me_nodes, me_identity), (other_nodes, other_identity)) = tokio::try_join!(
                    create_participant_nodes(&self.signal, patcher, &me_jids, &me_message, extra_attrs),
                    create_participant_nodes(&self.signal, patcher, &other_jids, message, extra_attrs),
                )?;

                let mut participants = me_nodes;
                participants.extend(other_nodes);
                let include_device_identity = me_identity || other_identity;

                let mut content: Vec<Node> = Vec::new();
                if !participants.is_empty() {
                    if is_peer {
                        // Peer messages carry the single enc child bare.
                        if let Some(enc) = participants
                            .into_iter()
                            .next()
                            .and_then(|node| node.find_child("enc").cloned())
                        {
                            content.push(enc);
                        }
                    } else {
                        content.push(Node::new("participants").with_children(participants));
                    }
                }

                let stanza = self.assemble_message_stanza(
                    msg_id,
                    destination,
                    options,
                    message,
                    content,
                    include_device_identity,
                    additional_attributes,
                )?;
                self.transport.send_node(stanza).await
            })
            .await
    }

    /// Group / status-broadcast branch: sender-key fan-out with optional
    /// block chunking
    async fn relay_to_group(
        &self,
        destination: &JID,
        message: &proto::Message,
        msg_id: &str,
        options: &RelayOptions,
        additional_attributes: &mut HashMap<String, String>,
        extra_attrs: &HashMap<String, String>,
    ) -> Result<()> {
        // The group branch never mutates the stanza attributes; drop to a
        // shared borrow so parallel block dispatches can all read them.
        let additional_attributes: &HashMap<String, String> = additional_attributes;
        let creds = self.creds()?;
        let me = creds.me.clone();
        let is_status = destination.is_status_broadcast();

        let memory_key = destination.to_string();
        let stored = self
            .keys
            .get(Category::SenderKeyMemory, &[memory_key.clone()])
            .await?;
        let mut sender_key_map: HashMap<String, bool> = stored
            .get(&memory_key)
            .and_then(|bytes| serde_json::from_slice(bytes).ok())
            .unwrap_or_default();

        if let Some(override_device) = &options.participant {
            // Override recipients always get the key redistributed.
            let targets = vec![override_device.clone()];
            sender_key_map.insert(override_device.to_string(), true);
            let persist = (memory_key, sender_key_map);
            return self
                .keys
                .transaction(|tx| async move {
                    self.dispatch_group(
                        destination,
                        message,
                        msg_id,
                        options,
                        additional_attributes,
                        extra_attrs,
                        vec![override_device.clone()],
                        targets,
                        Some(persist),
                        &tx,
                    )
                    .await
                })
                .await;
        }

        let participants: Vec<JID> = if is_status {
            options.status_jid_list.clone()
        } else {
            self.group_participants(destination, options.use_cached_group_metadata)
                .await?
        };
        if participants.is_empty() {
            debug!(to = %destination, "no participants, skipping send");
            return Ok(());
        }

        let block_size = self.config.participant_block_size;
        if participants.len() > block_size {
            // Large group: parallel block dispatches over a shared
            // memory map, persisted once at the end.
            let shared_map = Arc::new(Mutex::new(sender_key_map));
            let blocks: Vec<Vec<JID>> = participants
                .chunks(block_size)
                .map(|chunk| chunk.to_vec())
                .collect();
            debug!(blocks = blocks.len(), to = %destination, "block-split group send");

            let dispatches = blocks.into_iter().map(|block| {
                let shared_map = shared_map.clone();
                let me = me.clone();
                async move {
                    let devices = self
                        .resolver
                        .resolve_devices(&block, options.use_user_devices_cache, false, &me)
                        .await?;
                    let targets = {
                        let mut map = shared_map.lock().await;
                        let mut targets = Vec::new();
                        for device in &devices {
                            let key = device.to_string();
                            if !map.get(&key).copied().unwrap_or(false) {
                                map.insert(key, true);
                                targets.push(device.clone());
                            }
                        }
                        targets
                    };
                    self.dispatch_group(
                        destination,
                        message,
                        msg_id,
                        options,
                        additional_attributes,
                        extra_attrs,
                        devices,
                        targets,
                        None,
                        &self.keys,
                    )
                    .await
                }
            });
            try_join_all(dispatches).await?;

            let final_map = shared_map.lock().await.clone();
            self.keys
                .set_one(
                    Category::SenderKeyMemory,
                    &memory_key,
                    Some(serde_json::to_vec(&final_map)?),
                )
                .await?;
            return Ok(());
        }

        let devices = self
            .resolver
            .resolve_devices(&participants, options.use_user_devices_cache, false, &me)
            .await?;
        let mut targets = Vec::new();
        for device in &devices {
            let key = device.to_string();
            if !sender_key_map.get(&key).copied().unwrap_or(false) {
                sender_key_map.insert(key, true);
                targets.push(device.clone());
            }
        }

        let persist = (memory_key, sender_key_map);
        self.keys
            .transaction(|tx| async move {
                self.dispatch_group(
                    destination,
                    message,
                    msg_id,
                    options,
                    additional_attributes,
                    extra_attrs,
                    devices,
                    targets,
                    Some(persist),
                    &tx,
                )
                .await
            })
            .await
    }

    /// One group dispatch: sender-key encryption, SKDM fan-out to the
    /// devices that lack the key, stanza assembly and emission.
    ///
    /// `keys` is the handle the memory write goes through; inside a
    /// transaction it buffers until the dispatch commits.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_group(
        &self,
        destination: &JID,
        message: &proto::Message,
        msg_id: &str,
        options: &RelayOptions,
        additional_attributes: &HashMap<String, String>,
        extra_attrs: &HashMap<String, String>,
        devices: Vec<JID>,
        skdm_targets: Vec<JID>,
        persist: Option<(String, HashMap<String, bool>)>,
        keys: &KeyStore,
    ) -> Result<()> {
        let creds = self.creds()?;
        let me = &creds.me;
        let patcher = self.collaborators.patch_message.as_ref();

        let patched = match patcher {
            Some(patcher) => patcher.patch_message(message.clone(), &devices).await?,
            None => message.clone(),
        };
        let plaintext = proto::encode_message(&patched);
        let group_encrypted = self
            .signal
            .encrypt_group_message(destination, me, &plaintext)
            .await?;

        let mut content: Vec<Node> = Vec::new();
        let mut include_device_identity = false;

        if !skdm_targets.is_empty() {
            self.sessions.assert_sessions(&skdm_targets, false).await?;
            let skdm_message = proto::Message {
                sender_key_distribution_message: Some(proto::SenderKeyDistributionMessage {
                    group_id: Some(destination.to_string()),
                    axolotl_sender_key_distribution_message: Some(
                        group_encrypted.sender_key_distribution.to_vec(),
                    ),
                }),
                ..Default::default()
            };
            let (nodes, identity) = create_participant_nodes(
                &self.signal,
                patcher,
                &skdm_targets,
                &skdm_message,
                extra_attrs,
            )
            .await?;
            include_device_identity = identity;
            if !nodes.is_empty() {
                content.push(Node::new("participants").with_children(nodes));
            }
        }

        let mut enc = Node::new("enc").attr("v", "2").attr("type", "skmsg");
        for (key, value) in extra_attrs {
            enc = enc.attr(key.clone(), value.clone());
        }
        content.push(enc.with_binary(group_encrypted.ciphertext.to_vec()));

        if let Some((memory_key, map)) = persist {
            keys.set_one(
                Category::SenderKeyMemory,
                &memory_key,
                Some(serde_json::to_vec(&map)?),
            )
            .await?;
        }

        let stanza = self.assemble_message_stanza(
            msg_id,
            destination,
            options,
            message,
            content,
            include_device_identity,
            additional_attributes,
        )?;
        self.transport.send_node(stanza).await
    }

    /// Assemble the top-level `<message>` stanza with the addressing
    /// variants and optional device identity
    #[allow(clippy::too_many_arguments)]
    fn assemble_message_stanza(
        &self,
        msg_id: &str,
        destination: &JID,
        options: &RelayOptions,
        message: &proto::Message,
        mut content: Vec<Node>,
        include_device_identity: bool,
        additional_attributes: &HashMap<String, String>,
    ) -> Result<Node> {
        let creds = self.creds()?;
        let msg_type = if message.is_poll_creation() {
            "poll"
        } else {
            "text"
        };

        let mut stanza = Node::new("message")
            .attr("id", msg_id)
            .attr("type", msg_type);
        for (key, value) in additional_attributes {
            stanza = stanza.attr(key.clone(), value.clone());
        }

        match &options.participant {
            Some(participant) => {
                if destination.is_group() || destination.is_status_broadcast() {
                    stanza = stanza
                        .attr("to", destination.to_string())
                        .attr("participant", participant.to_string());
                } else if participant.same_user(&creds.me) {
                    stanza = stanza
                        .attr("to", participant.to_string())
                        .attr("recipient", destination.to_string());
                } else {
                    stanza = stanza.attr("to", participant.to_string());
                }
            }
            None => {
                stanza = stanza.attr("to", destination.to_string());
            }
        }

        if include_device_identity {
            content.push(Node::new("device-identity").with_binary(
                proto::encode_signed_device_identity(&creds.signed_identity, true),
            ));
        }
        content.extend(options.additional_nodes.iter().cloned());

        Ok(stanza.with_children(content))
    }

    /// Group participant users, preferring the cached-metadata
    /// collaborator when permitted
    async fn group_participants(&self, jid: &JID, use_cached: bool) -> Result<Vec<JID>> {
        if use_cached {
            if let Some(provider) = &self.collaborators.cached_group_metadata {
                if let Some(metadata) = provider.cached_group_metadata(jid).await {
                    return Ok(metadata.participants);
                }
            }
        }
        Ok(self.fetch_group_metadata(jid).await?.participants)
    }

    /// Live group metadata fetch
    pub async fn fetch_group_metadata(&self, jid: &JID) -> Result<GroupMetadata> {
        let iq = Node::new("iq")
            .attr("to", jid.to_string())
            .attr("type", "get")
            .attr("xmlns", "w:g2")
            .attr("id", uuid::Uuid::new_v4().to_string())
            .with_children(vec![Node::new("query").attr("request", "interactive")]);

        let response = self.transport.query(iq).await?;
        let group = response.expect_child("group")?;
        let subject = group.get_attr("subject").map(str::to_string);
        let participants = group
            .find_children("participant")
            .into_iter()
            .map(|node| node.attr_or_missing("jid")?.parse())
            .collect::<Result<Vec<JID>>>()?;

        Ok(GroupMetadata {
            jid: jid.clone(),
            subject,
            participants,
        })
    }

    /// Ask the message's originating device to re-upload expired media,
    /// patching the stored message with the refreshed location.
    pub async fn update_media_message(&self, stored: &mut StoredMessage) -> Result<()> {
        let creds = self.creds()?;
        if stored.key.id.is_empty() {
            return Err(Error::Protocol("message key id required".to_string()));
        }
        let media_key = stored
            .message
            .media_content_mut()
            .map(|content| content.media_key)
            .ok_or_else(|| Error::Protocol("message has no media content".to_string()))?;

        let request = encrypt_media_retry_request(&stored.key, &media_key, &creds.me)?;

        // Subscribe before sending so the response cannot be missed.
        let mut rx = self.events.subscribe();
        let message_id = stored.key.id.clone();
        let ((), update) = tokio::try_join!(
            self.transport.send_node(request),
            EventBus::wait_for_media_update(&mut rx, &message_id, self.config.media_retry_timeout),
        )?;

        if let Some(code) = update.error_code {
            return Err(Error::MediaRetryFailed { code });
        }
        let media = update.media.ok_or_else(|| {
            Error::ElementMissing("media payload in retry notification".to_string())
        })?;
        let notification = decrypt_media_retry_data(&media, &media_key, &message_id)?;
        let result = notification.result.unwrap_or(0);
        if !matches!(ResultType::try_from(result), Ok(ResultType::Success)) {
            return Err(Error::MediaRetryFailed {
                code: media_retry_status_code(result),
            });
        }

        let direct_path = notification
            .direct_path
            .ok_or_else(|| Error::ElementMissing("directPath in retry result".to_string()))?;
        let url = url_from_direct_path(&direct_path)?;
        let content = stored
            .message
            .media_content_mut()
            .ok_or_else(|| Error::Protocol("message has no media content".to_string()))?;
        *content.direct_path = Some(direct_path);
        *content.url = Some(url);

        if self.config.emit_own_events {
            self.events.emit(Event::MessagesUpdate(vec![MessageUpdateEvent {
                key: stored.key.clone(),
                message: stored.message.clone(),
            }]));
        }
        info!(id = %message_id, "media message refreshed");
        Ok(())
    }
}
