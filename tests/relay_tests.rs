//! End-to-end relay scenarios over an in-memory transport and a mock
//! Signal repository.

use async_trait::async_trait;
use bytes::Bytes;
use prost::Message as _;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::assert_ok;
use warelay::{
    binary::{Node, NodeContent},
    config::{GroupMetadataProvider, RelayCollaborators, RelayConfig},
    media::retry::media_retry_key,
    proto,
    signal::{EncType, EncryptedPayload, GroupEncryptResult, PreKeyBundle, SignalRepository},
    store::{Category, KeyStore, KeyValueStore, MemoryKeyValueStore, StorePatch},
    transport::StanzaTransport,
    types::{
        AuthCreds, Event, GroupMetadata, MediaUpdateEvent, MessageKey, ReceiptType, RetryMedia,
        StoredMessage, JID,
    },
    usync::DeviceResolver,
    util::crypto::{random_bytes, AesGcm},
    Error, RelayEngine,
};

// ---------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------

/// Key-value store wrapper counting sender-key-memory writes
struct CountingStore {
    inner: MemoryKeyValueStore,
    memory_sets: AtomicUsize,
}

impl CountingStore {
    fn new() -> Self {
        Self {
            inner: MemoryKeyValueStore::new(),
            memory_sets: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl KeyValueStore for CountingStore {
    async fn get(
        &self,
        category: Category,
        keys: &[String],
    ) -> warelay::Result<HashMap<String, Vec<u8>>> {
        self.inner.get(category, keys).await
    }

    async fn set(&self, patch: StorePatch) -> warelay::Result<()> {
        if patch.contains_key(&Category::SenderKeyMemory) {
            self.memory_sets.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.set(patch).await
    }
}

/// Scripted stanza transport: records every send, answers iq queries
/// from configured tables
struct MockTransport {
    sent: Mutex<Vec<Node>>,
    queries: Mutex<Vec<Node>>,
    devices: Mutex<HashMap<String, Vec<u16>>>,
    groups: Mutex<HashMap<String, Vec<String>>>,
    read_receipts: Mutex<String>,
    query_delay: Mutex<Option<Duration>>,
}

impl MockTransport {
    fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            queries: Mutex::new(Vec::new()),
            devices: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
            read_receipts: Mutex::new("all".to_string()),
            query_delay: Mutex::new(None),
        }
    }

    fn set_devices(&self, user: &str, devices: Vec<u16>) {
        self.devices.lock().unwrap().insert(user.to_string(), devices);
    }

    fn set_group(&self, jid: &str, participants: &[&str]) {
        self.groups.lock().unwrap().insert(
            jid.to_string(),
            participants.iter().map(|p| p.to_string()).collect(),
        );
    }

    fn sent_nodes(&self) -> Vec<Node> {
        self.sent.lock().unwrap().clone()
    }

    fn sent_messages(&self) -> Vec<Node> {
        self.sent_nodes()
            .into_iter()
            .filter(|node| node.tag == "message")
            .collect()
    }

    fn query_count(&self, xmlns: &str) -> usize {
        self.queries
            .lock()
            .unwrap()
            .iter()
            .filter(|node| node.get_attr("xmlns") == Some(xmlns))
            .count()
    }

    fn usync_response(&self, request: &Node) -> Node {
        let devices = self.devices.lock().unwrap();
        let usync = request.find_child("usync").unwrap();
        let list = usync.find_child("list").unwrap();

        let users: Vec<Node> = list
            .find_children("user")
            .into_iter()
            .map(|user_node| {
                let jid: JID = user_node.get_attr("jid").unwrap().parse().unwrap();
                let ids = devices.get(&jid.user).cloned().unwrap_or_else(|| vec![0]);
                let device_nodes: Vec<Node> = ids
                    .iter()
                    .map(|id| Node::new("device").attr("id", id.to_string()))
                    .collect();
                Node::new("user").attr("jid", jid.to_non_ad()).with_children(vec![
                    Node::new("devices")
                        .with_children(vec![Node::new("device-list").with_children(device_nodes)]),
                ])
            })
            .collect();

        Node::new("iq").with_children(vec![Node::new("usync")
            .with_children(vec![Node::new("list").with_children(users)])])
    }

    fn prekey_response(&self, request: &Node) -> Node {
        let key_node = request.find_child("key").unwrap();
        let users: Vec<Node> = key_node
            .find_children("user")
            .into_iter()
            .map(|user_node| {
                Node::new("user")
                    .attr("jid", user_node.get_attr("jid").unwrap())
                    .with_children(vec![
                        Node::new("registration").with_binary(vec![0, 0, 48, 57]),
                        Node::new("identity").with_binary(vec![7; 32]),
                        Node::new("skey").with_children(vec![
                            Node::new("id").with_binary(vec![0, 0, 1]),
                            Node::new("value").with_binary(vec![8; 32]),
                            Node::new("signature").with_binary(vec![9; 64]),
                        ]),
                        Node::new("key").with_children(vec![
                            Node::new("id").with_binary(vec![0, 0, 2]),
                            Node::new("value").with_binary(vec![10; 32]),
                        ]),
                    ])
            })
            .collect();

        Node::new("iq").with_children(vec![Node::new("list").with_children(users)])
    }

    fn media_conn_response(&self) -> Node {
        Node::new("iq").with_children(vec![Node::new("media_conn")
            .attr("auth", "auth-token")
            .attr("ttl", "300")
            .with_children(vec![
                Node::new("host")
                    .attr("hostname", "media-arn1-1.cdn.whatsapp.net")
                    .attr("maxContentLengthBytes", "157286400"),
                Node::new("host")
                    .attr("hostname", "mmg.whatsapp.net")
                    .attr("maxContentLengthBytes", "157286400"),
            ])])
    }

    fn privacy_response(&self) -> Node {
        Node::new("iq").with_children(vec![Node::new("privacy").with_children(vec![
            Node::new("category")
                .attr("name", "readreceipts")
                .attr("value", self.read_receipts.lock().unwrap().clone()),
        ])])
    }

    fn group_response(&self, request: &Node) -> Node {
        let jid = request.get_attr("to").unwrap();
        let participants = self
            .groups
            .lock()
            .unwrap()
            .get(jid)
            .cloned()
            .unwrap_or_default();
        let nodes: Vec<Node> = participants
            .iter()
            .map(|p| Node::new("participant").attr("jid", p.clone()))
            .collect();
        Node::new("iq").with_children(vec![Node::new("group")
            .attr("subject", "test group")
            .with_children(nodes)])
    }
}

#[async_trait]
impl StanzaTransport for MockTransport {
    async fn send_node(&self, node: Node) -> warelay::Result<()> {
        self.sent.lock().unwrap().push(node);
        Ok(())
    }

    async fn query(&self, node: Node) -> warelay::Result<Node> {
        let delay = *self.query_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.queries.lock().unwrap().push(node.clone());

        let xmlns = node.get_attr("xmlns").unwrap_or_default();
        let response = match xmlns {
            "usync" => self.usync_response(&node),
            "encrypt" => self.prekey_response(&node),
            "w:m" => self.media_conn_response(),
            "privacy" => match node.get_attr("type") {
                Some("set") => Node::new("iq"),
                _ => self.privacy_response(),
            },
            "w:g2" => self.group_response(&node),
            other => return Err(Error::Transport(format!("unscripted query: {}", other))),
        };
        Ok(response)
    }
}

/// Mock Signal repository: sessions mirror into the key store, the
/// first encryption after a bundle install produces a `pkmsg`
struct MockSignal {
    keys: KeyStore,
    fresh: Mutex<HashSet<String>>,
}

impl MockSignal {
    fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            keys: KeyStore::new(store),
            fresh: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl SignalRepository for MockSignal {
    async fn encrypt_message(
        &self,
        jid: &JID,
        plaintext: &[u8],
    ) -> warelay::Result<EncryptedPayload> {
        let address = jid.signal_address();
        let existing = self.keys.get(Category::Session, &[address.clone()]).await?;
        if existing.is_empty() {
            return Err(Error::Crypto(format!("no session for {}", address)));
        }
        let fresh = self.fresh.lock().unwrap().remove(&address);
        Ok(EncryptedPayload {
            enc_type: if fresh { EncType::Pkmsg } else { EncType::Msg },
            ciphertext: Bytes::from(plaintext.to_vec()),
        })
    }

    async fn encrypt_group_message(
        &self,
        _group: &JID,
        _me: &JID,
        plaintext: &[u8],
    ) -> warelay::Result<GroupEncryptResult> {
        Ok(GroupEncryptResult {
            ciphertext: Bytes::from(plaintext.to_vec()),
            sender_key_distribution: Bytes::from_static(b"skdm-payload"),
        })
    }

    async fn inject_prekey_bundle(&self, jid: &JID, _bundle: PreKeyBundle) -> warelay::Result<()> {
        let address = jid.signal_address();
        self.keys
            .set_one(Category::Session, &address, Some(b"session".to_vec()))
            .await?;
        self.fresh.lock().unwrap().insert(address);
        Ok(())
    }
}

/// Static group metadata provider
struct StaticMetadata(HashMap<String, GroupMetadata>);

#[async_trait]
impl GroupMetadataProvider for StaticMetadata {
    async fn cached_group_metadata(&self, jid: &JID) -> Option<GroupMetadata> {
        self.0.get(&jid.to_string()).cloned()
    }
}

// ---------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------

struct Harness {
    engine: RelayEngine,
    transport: Arc<MockTransport>,
    store: Arc<CountingStore>,
}

fn creds(me: &str) -> AuthCreds {
    AuthCreds {
        me: me.parse().unwrap(),
        lid: None,
        signed_identity: proto::AdvSignedDeviceIdentity {
            details: Some(vec![1, 2, 3]),
            account_signature_key: Some(vec![2; 32]),
            account_signature: Some(vec![3; 64]),
            device_signature: Some(vec![4; 64]),
        },
    }
}

fn harness_with(me: Option<&str>, collaborators: RelayCollaborators) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let transport = Arc::new(MockTransport::new());
    let store = Arc::new(CountingStore::new());
    let signal = Arc::new(MockSignal::new(store.clone()));
    let engine = RelayEngine::new(
        transport.clone(),
        signal,
        store.clone(),
        me.map(creds),
        RelayConfig::default(),
        collaborators,
    );
    Harness {
        engine,
        transport,
        store,
    }
}

fn harness(me: &str) -> Harness {
    harness_with(Some(me), RelayCollaborators::default())
}

fn text_message(text: &str) -> proto::Message {
    proto::Message {
        conversation: Some(text.to_string()),
        ..Default::default()
    }
}

fn participant_nodes(stanza: &Node) -> Vec<Node> {
    stanza
        .find_child("participants")
        .map(|node| node.children().to_vec())
        .unwrap_or_default()
}

fn enc_types(stanza: &Node) -> Vec<String> {
    participant_nodes(stanza)
        .iter()
        .filter_map(|to| to.find_child("enc"))
        .filter_map(|enc| enc.get_attr("type").map(str::to_string))
        .collect()
}

async fn memory_map(store: &CountingStore, group: &str) -> HashMap<String, bool> {
    let bytes = store
        .get(Category::SenderKeyMemory, &[group.to_string()])
        .await
        .unwrap()
        .remove(group);
    match bytes {
        Some(bytes) => serde_json::from_slice(&bytes).unwrap(),
        None => HashMap::new(),
    }
}

// ---------------------------------------------------------------------
// 1:1 sends
// ---------------------------------------------------------------------

#[tokio::test]
async fn fresh_one_to_one_send() {
    let h = harness("111@s.whatsapp.net");
    h.transport.set_devices("111", vec![0]);
    h.transport.set_devices("222", vec![0]);

    let dest: JID = "222@s.whatsapp.net".parse().unwrap();
    let id = h
        .engine
        .relay_message(&dest, text_message("hi"), Default::default())
        .await
        .unwrap();

    assert_eq!(h.transport.query_count("usync"), 1);
    assert_eq!(h.transport.query_count("encrypt"), 1);

    let messages = h.transport.sent_messages();
    assert_eq!(messages.len(), 1);
    let stanza = &messages[0];
    assert_eq!(stanza.get_attr("id"), Some(id.as_str()));
    assert_eq!(stanza.get_attr("to"), Some("222@s.whatsapp.net"));
    assert_eq!(stanza.get_attr("type"), Some("text"));

    // Destination primary queued explicitly plus the USync echo; the
    // sender's own primary never appears.
    let nodes = participant_nodes(stanza);
    assert_eq!(nodes.len(), 2);
    for node in &nodes {
        assert_eq!(node.get_attr("jid"), Some("222@s.whatsapp.net"));
    }
    assert!(enc_types(stanza).contains(&"pkmsg".to_string()));
    assert!(stanza.find_child("device-identity").is_some());
}

#[tokio::test]
async fn repeat_one_to_one_send_uses_caches() {
    let h = harness("111@s.whatsapp.net");
    h.transport.set_devices("111", vec![0]);
    h.transport.set_devices("222", vec![0]);

    let dest: JID = "222@s.whatsapp.net".parse().unwrap();
    h.engine
        .relay_message(&dest, text_message("first"), Default::default())
        .await
        .unwrap();
    h.engine
        .relay_message(&dest, text_message("second"), Default::default())
        .await
        .unwrap();

    // Device cache and verified-session set absorb the second send.
    assert_eq!(h.transport.query_count("usync"), 1);
    assert_eq!(h.transport.query_count("encrypt"), 1);

    let messages = h.transport.sent_messages();
    assert_eq!(messages.len(), 2);
    let second = &messages[1];
    assert!(enc_types(second).iter().all(|t| t == "msg"));
    assert!(second.find_child("device-identity").is_none());
}

#[tokio::test]
async fn companion_sender_includes_own_primary() {
    let h = harness("111:5@s.whatsapp.net");
    h.transport.set_devices("111", vec![0, 5]);
    h.transport.set_devices("222", vec![0]);

    let dest: JID = "222@s.whatsapp.net".parse().unwrap();
    h.engine
        .relay_message(&dest, text_message("hi"), Default::default())
        .await
        .unwrap();

    let stanza = &h.transport.sent_messages()[0];
    let jids: Vec<String> = participant_nodes(stanza)
        .iter()
        .filter_map(|node| node.get_attr("jid").map(str::to_string))
        .collect();
    // Own primary is queued; the sending device itself is not.
    assert!(jids.contains(&"111@s.whatsapp.net".to_string()));
    assert!(!jids.contains(&"111:5@s.whatsapp.net".to_string()));
    assert!(jids.contains(&"222@s.whatsapp.net".to_string()));
}

#[tokio::test]
async fn participant_override_suppresses_fanout() {
    let h = harness("111@s.whatsapp.net");
    let dest: JID = "222@s.whatsapp.net".parse().unwrap();
    let participant: JID = "333:2@s.whatsapp.net".parse().unwrap();

    // Give the override device a session up front.
    h.store
        .set(HashMap::from([(
            Category::Session,
            HashMap::from([("333.2".to_string(), Some(b"session".to_vec()))]),
        )]))
        .await
        .unwrap();

    let options = warelay::relay::RelayOptions {
        participant: Some(participant.clone()),
        ..Default::default()
    };
    h.engine
        .relay_message(&dest, text_message("retry"), options)
        .await
        .unwrap();

    // No device resolution happens for an override.
    assert_eq!(h.transport.query_count("usync"), 0);
    let stanza = &h.transport.sent_messages()[0];
    assert_eq!(stanza.get_attr("to"), Some(participant.to_string().as_str()));
    assert_eq!(stanza.get_attr("device_fanout"), Some("false"));
    assert_eq!(participant_nodes(stanza).len(), 1);
}

#[tokio::test]
async fn unauthenticated_relay_fails() {
    let h = harness_with(None, RelayCollaborators::default());
    let dest: JID = "222@s.whatsapp.net".parse().unwrap();
    let err = h
        .engine
        .relay_message(&dest, text_message("hi"), Default::default())
        .await
        .unwrap_err();
    assert_eq!(err, Error::NotAuthenticated);
}

// ---------------------------------------------------------------------
// Group sends
// ---------------------------------------------------------------------

const GROUP: &str = "12345-67890@g.us";

fn group_harness(members: &[&str]) -> Harness {
    let h = harness("111@s.whatsapp.net");
    h.transport.set_group(GROUP, members);
    for member in members {
        let jid: JID = member.parse().unwrap();
        h.transport.set_devices(&jid.user, vec![0]);
    }
    h
}

#[tokio::test]
async fn first_group_send_distributes_sender_key() {
    let members = ["aaa@s.whatsapp.net", "bbb@s.whatsapp.net", "ccc@s.whatsapp.net"];
    let h = group_harness(&members);
    let group: JID = GROUP.parse().unwrap();

    h.engine
        .relay_message(&group, text_message("hello group"), Default::default())
        .await
        .unwrap();

    assert_eq!(h.transport.query_count("w:g2"), 1);
    assert_eq!(h.transport.query_count("encrypt"), 1);

    let stanza = &h.transport.sent_messages()[0];
    assert_eq!(stanza.get_attr("to"), Some(GROUP));

    // SKDM fan-out to all three members, then the group payload.
    let nodes = participant_nodes(stanza);
    assert_eq!(nodes.len(), 3);
    let top_enc = stanza.find_child("enc").unwrap();
    assert_eq!(top_enc.get_attr("type"), Some("skmsg"));
    assert!(stanza.find_child("device-identity").is_some());

    let memory = memory_map(&h.store, GROUP).await;
    assert_eq!(memory.len(), 3);
    for member in &members {
        assert_eq!(memory.get(*member), Some(&true));
    }
}

#[tokio::test]
async fn second_group_send_skips_distribution() {
    let members = ["aaa@s.whatsapp.net", "bbb@s.whatsapp.net", "ccc@s.whatsapp.net"];
    let h = group_harness(&members);
    let group: JID = GROUP.parse().unwrap();

    h.engine
        .relay_message(&group, text_message("one"), Default::default())
        .await
        .unwrap();
    h.engine
        .relay_message(&group, text_message("two"), Default::default())
        .await
        .unwrap();

    let messages = h.transport.sent_messages();
    let second = &messages[1];
    assert!(second.find_child("participants").is_none());
    assert_eq!(
        second.find_child("enc").unwrap().get_attr("type"),
        Some("skmsg")
    );
    assert!(second.find_child("device-identity").is_none());

    let memory = memory_map(&h.store, GROUP).await;
    assert_eq!(memory.len(), 3);
}

fn big_group_collaborators(count: usize) -> (RelayCollaborators, Vec<String>) {
    let members: Vec<String> = (0..count)
        .map(|i| format!("10{:03}@s.whatsapp.net", i))
        .collect();
    let metadata = GroupMetadata {
        jid: GROUP.parse().unwrap(),
        subject: Some("big group".to_string()),
        participants: members.iter().map(|m| m.parse().unwrap()).collect(),
    };
    let collaborators = RelayCollaborators {
        patch_message: None,
        cached_group_metadata: Some(Arc::new(StaticMetadata(HashMap::from([(
            GROUP.to_string(),
            metadata,
        )])))),
    };
    (collaborators, members)
}

#[tokio::test]
async fn oversized_group_send_splits_into_blocks() {
    let (collaborators, members) = big_group_collaborators(250);
    let h = harness_with(Some("111@s.whatsapp.net"), collaborators);
    let group: JID = GROUP.parse().unwrap();

    h.engine
        .relay_message(&group, text_message("big"), Default::default())
        .await
        .unwrap();

    // Two block dispatches, one memory write for their union.
    let messages = h.transport.sent_messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(h.store.memory_sets.load(Ordering::SeqCst), 1);

    let total_skdm: usize = messages
        .iter()
        .map(|stanza| participant_nodes(stanza).len())
        .sum();
    assert_eq!(total_skdm, 250);

    let memory = memory_map(&h.store, GROUP).await;
    assert_eq!(memory.len(), 250);
    for member in &members {
        assert_eq!(memory.get(member), Some(&true));
    }
}

#[tokio::test]
async fn block_sized_group_send_is_single_dispatch() {
    let (collaborators, _) = big_group_collaborators(200);
    let h = harness_with(Some("111@s.whatsapp.net"), collaborators);
    let group: JID = GROUP.parse().unwrap();

    h.engine
        .relay_message(&group, text_message("exact"), Default::default())
        .await
        .unwrap();

    assert_eq!(h.transport.sent_messages().len(), 1);
    assert_eq!(memory_map(&h.store, GROUP).await.len(), 200);
}

#[tokio::test]
async fn concurrent_relays_commit_independently() {
    let h = harness("111@s.whatsapp.net");
    h.transport.set_group("g1@g.us", &["aaa@s.whatsapp.net"]);
    h.transport.set_group("g2@g.us", &["bbb@s.whatsapp.net"]);
    h.transport.set_devices("aaa", vec![0]);
    h.transport.set_devices("bbb", vec![0]);
    // Slow queries keep both sends in flight at once, so their
    // transactions overlap on the shared engine.
    *h.transport.query_delay.lock().unwrap() = Some(Duration::from_millis(10));

    let g1: JID = "g1@g.us".parse().unwrap();
    let g2: JID = "g2@g.us".parse().unwrap();
    let (r1, r2) = tokio::join!(
        h.engine.relay_message(&g1, text_message("one"), Default::default()),
        h.engine.relay_message(&g2, text_message("two"), Default::default()),
    );
    r1.unwrap();
    r2.unwrap();

    assert_eq!(h.transport.sent_messages().len(), 2);
    // Each relay committed its own sender-key-memory write; the
    // overlapping transactions never merged into one flush.
    assert_eq!(h.store.memory_sets.load(Ordering::SeqCst), 2);
    let m1 = memory_map(&h.store, "g1@g.us").await;
    assert_eq!(m1.get("aaa@s.whatsapp.net"), Some(&true));
    let m2 = memory_map(&h.store, "g2@g.us").await;
    assert_eq!(m2.get("bbb@s.whatsapp.net"), Some(&true));
}

#[tokio::test]
async fn empty_status_broadcast_short_circuits() {
    let h = harness("111@s.whatsapp.net");
    let status: JID = "status@broadcast".parse().unwrap();

    h.engine
        .relay_message(&status, text_message("story"), Default::default())
        .await
        .unwrap();

    assert!(h.transport.sent_messages().is_empty());
    assert_eq!(h.transport.query_count("w:g2"), 0);
}

#[tokio::test]
async fn status_broadcast_uses_caller_list() {
    let h = harness("111@s.whatsapp.net");
    h.transport.set_devices("aaa", vec![0]);
    h.transport.set_devices("bbb", vec![0]);
    let status: JID = "status@broadcast".parse().unwrap();

    let options = warelay::relay::RelayOptions {
        status_jid_list: vec![
            "aaa@s.whatsapp.net".parse().unwrap(),
            "bbb@s.whatsapp.net".parse().unwrap(),
        ],
        ..Default::default()
    };
    h.engine
        .relay_message(&status, text_message("story"), options)
        .await
        .unwrap();

    // No metadata fetch for status sends.
    assert_eq!(h.transport.query_count("w:g2"), 0);
    let stanza = &h.transport.sent_messages()[0];
    assert_eq!(stanza.get_attr("to"), Some("status@broadcast"));
    assert_eq!(participant_nodes(stanza).len(), 2);
}

#[tokio::test]
async fn poll_messages_are_typed_and_stamped() {
    let members = ["aaa@s.whatsapp.net"];
    let h = group_harness(&members);
    let group: JID = GROUP.parse().unwrap();

    let message = proto::Message {
        poll_creation_message: Some(proto::PollCreationMessage {
            name: Some("lunch?".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    };
    let options = warelay::relay::RelayOptions {
        additional_nodes: vec![warelay::relay::poll_creation_meta_node()],
        ..Default::default()
    };
    h.engine.relay_message(&group, message, options).await.unwrap();

    let stanza = &h.transport.sent_messages()[0];
    assert_eq!(stanza.get_attr("type"), Some("poll"));
    let meta = stanza.find_child("meta").unwrap();
    assert_eq!(meta.get_attr("polltype"), Some("creation"));
}

#[tokio::test]
async fn media_and_pin_attributes_ride_the_enc_nodes() {
    let members = ["aaa@s.whatsapp.net"];
    let h = group_harness(&members);
    let group: JID = GROUP.parse().unwrap();

    let message = proto::Message {
        image_message: Some(proto::ImageMessage::default()),
        ..Default::default()
    };
    h.engine
        .relay_message(&group, message, Default::default())
        .await
        .unwrap();

    let stanza = &h.transport.sent_messages()[0];
    let top_enc = stanza.find_child("enc").unwrap();
    assert_eq!(top_enc.get_attr("mediatype"), Some("image"));
    for node in participant_nodes(stanza) {
        let enc = node.find_child("enc").unwrap();
        assert_eq!(enc.get_attr("mediatype"), Some("image"));
    }
}

// ---------------------------------------------------------------------
// Receipts
// ---------------------------------------------------------------------

#[tokio::test]
async fn read_receipt_shape() {
    let h = harness("111@s.whatsapp.net");
    let jid: JID = "222@s.whatsapp.net".parse().unwrap();

    h.engine
        .send_receipt(
            &jid,
            None,
            &["A".to_string(), "B".to_string(), "C".to_string()],
            ReceiptType::Read,
        )
        .await
        .unwrap();

    let sent = h.transport.sent_nodes();
    assert_eq!(sent.len(), 1);
    let receipt = &sent[0];
    assert_eq!(receipt.tag, "receipt");
    assert_eq!(receipt.get_attr("id"), Some("A"));
    assert_eq!(receipt.get_attr("to"), Some(jid.to_string().as_str()));
    assert_eq!(receipt.get_attr("type"), Some("read"));
    assert!(receipt.get_attr("t").is_some());

    let list = receipt.find_child("list").unwrap();
    let items = list.find_children("item");
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].get_attr("id"), Some("B"));
}

#[tokio::test]
async fn sender_receipt_swaps_addressing() {
    let h = harness("111@s.whatsapp.net");
    let jid: JID = "222@s.whatsapp.net".parse().unwrap();
    let participant: JID = "333@s.whatsapp.net".parse().unwrap();

    h.engine
        .send_receipt(&jid, Some(&participant), &["A".to_string()], ReceiptType::Sender)
        .await
        .unwrap();

    let receipt = &h.transport.sent_nodes()[0];
    assert_eq!(receipt.get_attr("recipient"), Some(jid.to_string().as_str()));
    assert_eq!(receipt.get_attr("to"), Some(participant.to_string().as_str()));
    assert!(receipt.get_attr("t").is_none());
}

#[tokio::test]
async fn ack_receipt_has_no_type() {
    let h = harness("111@s.whatsapp.net");
    let jid: JID = "g@g.us".parse().unwrap();
    let participant: JID = "222@s.whatsapp.net".parse().unwrap();

    h.engine
        .send_receipt(&jid, Some(&participant), &["A".to_string()], ReceiptType::Ack)
        .await
        .unwrap();

    let receipt = &h.transport.sent_nodes()[0];
    assert!(receipt.get_attr("type").is_none());
    assert_eq!(receipt.get_attr("participant"), Some(participant.to_string().as_str()));
    assert_eq!(receipt.content, NodeContent::None);
}

#[tokio::test]
async fn empty_receipts_are_noops() {
    let h = harness("111@s.whatsapp.net");
    let jid: JID = "222@s.whatsapp.net".parse().unwrap();

    assert_ok!(h.engine.send_receipt(&jid, None, &[], ReceiptType::Read).await);
    assert_ok!(h.engine.send_receipts(&[], ReceiptType::Read).await);

    assert!(h.transport.sent_nodes().is_empty());
}

#[tokio::test]
async fn read_messages_honors_privacy_setting() {
    let h = harness("111@s.whatsapp.net");
    *h.transport.read_receipts.lock().unwrap() = "none".to_string();

    let keys = vec![MessageKey {
        remote_jid: "222@s.whatsapp.net".parse().unwrap(),
        from_me: false,
        id: "A".to_string(),
        participant: None,
    }];
    h.engine.read_messages(&keys).await.unwrap();
    h.engine.read_messages(&keys).await.unwrap();

    // Privacy settings fetched once, receipts typed read-self.
    assert_eq!(h.transport.query_count("privacy"), 1);
    let receipts = h.transport.sent_nodes();
    assert_eq!(receipts.len(), 2);
    assert_eq!(
        receipts[0].get_attr("type"),
        Some("read-self")
    );
}

#[tokio::test]
async fn privacy_tokens_stanza_shape() {
    let h = harness("111@s.whatsapp.net");
    h.engine
        .send_privacy_tokens(&["222@s.whatsapp.net".parse().unwrap()])
        .await
        .unwrap();

    let queries = h.transport.queries.lock().unwrap();
    let iq = queries
        .iter()
        .find(|node| node.get_attr("type") == Some("set"))
        .unwrap();
    let tokens = iq.find_child("tokens").unwrap();
    let token = tokens.find_child("token").unwrap();
    assert_eq!(token.get_attr("jid"), Some("222@s.whatsapp.net"));
    assert_eq!(token.get_attr("type"), Some("trusted_contact"));
    assert!(token.get_attr("t").is_some());
}

// ---------------------------------------------------------------------
// Media conn & media retry
// ---------------------------------------------------------------------

#[tokio::test]
async fn media_conn_single_flight() {
    let h = harness("111@s.whatsapp.net");
    *h.transport.query_delay.lock().unwrap() = Some(Duration::from_millis(20));

    let (a, b) = tokio::join!(
        h.engine.refresh_media_conn(false),
        h.engine.refresh_media_conn(false)
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    // Concurrent callers observe the same lease instance.
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(h.transport.query_count("w:m"), 1);
    assert_eq!(a.auth, "auth-token");
    assert_eq!(a.ttl, 300);
    assert_eq!(a.hosts.len(), 2);

    // Within the refresh window the cached lease is reused...
    let c = h.engine.refresh_media_conn(false).await.unwrap();
    assert!(Arc::ptr_eq(&a, &c));
    assert_eq!(h.transport.query_count("w:m"), 1);

    // ...and force starts a new fetch.
    let d = h.engine.refresh_media_conn(true).await.unwrap();
    assert!(!Arc::ptr_eq(&a, &d));
    assert_eq!(h.transport.query_count("w:m"), 2);
}

fn encrypted_retry_media(media_key: &[u8], message_id: &str, direct_path: Option<&str>, result: i32) -> RetryMedia {
    let notification = proto::MediaRetryNotification {
        stanza_id: Some(message_id.to_string()),
        direct_path: direct_path.map(|p| p.to_string()),
        result: Some(result),
    };
    let retry_key = media_retry_key(media_key).unwrap();
    let iv = random_bytes(12);
    let ciphertext = AesGcm::new(&retry_key)
        .unwrap()
        .encrypt_with_aad(&iv, &notification.encode_to_vec(), message_id.as_bytes())
        .unwrap();
    RetryMedia {
        ciphertext: Bytes::from(ciphertext),
        iv: Bytes::from(iv),
    }
}

fn stored_image_message(id: &str, media_key: &[u8]) -> StoredMessage {
    StoredMessage {
        key: MessageKey {
            remote_jid: "222@s.whatsapp.net".parse().unwrap(),
            from_me: true,
            id: id.to_string(),
            participant: None,
        },
        message: proto::Message {
            image_message: Some(proto::ImageMessage {
                media_key: Some(media_key.to_vec()),
                url: Some("https://mmg.whatsapp.net/old".to_string()),
                direct_path: Some("/old".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
    }
}

#[tokio::test]
async fn media_retry_success_patches_message() {
    let h = harness("111@s.whatsapp.net");
    let media_key = [9u8; 32];
    let mut stored = stored_image_message("X", &media_key);

    let mut updates_rx = h.engine.events().subscribe();

    let events = h.engine.events().clone();
    let media = encrypted_retry_media(
        &media_key,
        "X",
        Some("/v/t62.7118-24/fresh"),
        proto::media_retry_notification::ResultType::Success as i32,
    );
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        events.emit(Event::MediaUpdate(vec![MediaUpdateEvent {
            key: MessageKey {
                remote_jid: "222@s.whatsapp.net".parse().unwrap(),
                from_me: true,
                id: "X".to_string(),
                participant: None,
            },
            media: Some(media),
            error_code: None,
        }]));
    });

    h.engine.update_media_message(&mut stored).await.unwrap();

    let image = stored.message.image_message.as_ref().unwrap();
    assert_eq!(image.direct_path.as_deref(), Some("/v/t62.7118-24/fresh"));
    assert_eq!(
        image.url.as_deref(),
        Some("https://mmg.whatsapp.net/v/t62.7118-24/fresh")
    );

    // The retry request went out as a signed server-error receipt.
    let sent = h.transport.sent_nodes();
    let receipt = sent.iter().find(|n| n.tag == "receipt").unwrap();
    assert_eq!(receipt.get_attr("type"), Some("server-error"));
    assert!(receipt.find_child("encrypt").is_some());
    assert!(receipt.find_child("rmr").is_some());

    // And the patched message was announced.
    let announced = loop {
        match updates_rx.recv().await.unwrap() {
            Event::MessagesUpdate(updates) => break updates,
            _ => continue,
        }
    };
    assert_eq!(announced[0].key.id, "X");
}

#[tokio::test]
async fn media_retry_not_found_maps_to_404() {
    let h = harness("111@s.whatsapp.net");
    let media_key = [9u8; 32];
    let mut stored = stored_image_message("Y", &media_key);

    let events = h.engine.events().clone();
    let media = encrypted_retry_media(
        &media_key,
        "Y",
        None,
        proto::media_retry_notification::ResultType::NotFound as i32,
    );
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        events.emit(Event::MediaUpdate(vec![MediaUpdateEvent {
            key: MessageKey {
                remote_jid: "222@s.whatsapp.net".parse().unwrap(),
                from_me: true,
                id: "Y".to_string(),
                participant: None,
            },
            media: Some(media),
            error_code: None,
        }]));
    });

    let err = h.engine.update_media_message(&mut stored).await.unwrap_err();
    assert_eq!(err, Error::MediaRetryFailed { code: 404 });
}

#[tokio::test]
async fn media_retry_peer_error_surfaces() {
    let h = harness("111@s.whatsapp.net");
    let mut stored = stored_image_message("Z", &[9u8; 32]);

    let events = h.engine.events().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        events.emit(Event::MediaUpdate(vec![MediaUpdateEvent {
            key: MessageKey {
                remote_jid: "222@s.whatsapp.net".parse().unwrap(),
                from_me: true,
                id: "Z".to_string(),
                participant: None,
            },
            media: None,
            error_code: Some(410),
        }]));
    });

    let err = h.engine.update_media_message(&mut stored).await.unwrap_err();
    assert_eq!(err, Error::MediaRetryFailed { code: 410 });
}

// ---------------------------------------------------------------------
// Resolver & asserter units over the mock transport
// ---------------------------------------------------------------------

#[tokio::test]
async fn resolver_caches_per_user() {
    let transport = Arc::new(MockTransport::new());
    transport.set_devices("222", vec![0, 3]);
    let resolver = DeviceResolver::new(transport.clone(), Duration::from_secs(300));
    let me: JID = "111@s.whatsapp.net".parse().unwrap();
    let peer: JID = "222@s.whatsapp.net".parse().unwrap();

    let first = resolver
        .resolve_devices(&[peer.clone()], true, false, &me)
        .await
        .unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(transport.query_count("usync"), 1);

    let second = resolver
        .resolve_devices(&[peer.clone()], true, false, &me)
        .await
        .unwrap();
    assert_eq!(second, first);
    assert_eq!(transport.query_count("usync"), 1);

    // Cache bypass fetches again.
    resolver
        .resolve_devices(&[peer], false, false, &me)
        .await
        .unwrap();
    assert_eq!(transport.query_count("usync"), 2);
}

#[tokio::test]
async fn resolver_empty_input_is_free() {
    let transport = Arc::new(MockTransport::new());
    let resolver = DeviceResolver::new(transport.clone(), Duration::from_secs(300));
    let me: JID = "111@s.whatsapp.net".parse().unwrap();

    let resolved = resolver.resolve_devices(&[], true, false, &me).await.unwrap();
    assert!(resolved.is_empty());
    assert_eq!(transport.query_count("usync"), 0);
}

#[tokio::test]
async fn resolver_drops_own_and_zero_devices() {
    let transport = Arc::new(MockTransport::new());
    transport.set_devices("111", vec![0, 5, 7]);
    transport.set_devices("222", vec![0, 2]);
    let resolver = DeviceResolver::new(transport.clone(), Duration::from_secs(300));
    let me: JID = "111:5@s.whatsapp.net".parse().unwrap();
    let peer: JID = "222@s.whatsapp.net".parse().unwrap();

    let resolved = resolver
        .resolve_devices(&[me.clone(), peer], true, true, &me)
        .await
        .unwrap();
    let strings: Vec<String> = resolved.iter().map(JID::to_string).collect();

    // Own primary and the sending device are gone; the peer's primary
    // and everyone's companions stay.
    assert!(!strings.contains(&"111@s.whatsapp.net".to_string()));
    assert!(!strings.contains(&"111:5@s.whatsapp.net".to_string()));
    assert!(strings.contains(&"111:7@s.whatsapp.net".to_string()));
    assert!(strings.contains(&"222@s.whatsapp.net".to_string()));
    assert!(strings.contains(&"222:2@s.whatsapp.net".to_string()));
}

#[tokio::test]
async fn asserter_skips_known_sessions() {
    let transport = Arc::new(MockTransport::new());
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
    let signal = Arc::new(MockSignal::new(store.clone()));
    let asserter = warelay::session::SessionAsserter::new(
        transport.clone(),
        signal,
        KeyStore::new(store),
    );

    let jids: Vec<JID> = vec!["222@s.whatsapp.net".parse().unwrap()];
    assert!(asserter.assert_sessions(&jids, false).await.unwrap());
    assert_eq!(transport.query_count("encrypt"), 1);

    // Verified set short-circuits the repeat.
    assert!(!asserter.assert_sessions(&jids, false).await.unwrap());
    assert_eq!(transport.query_count("encrypt"), 1);

    // Force refetches regardless.
    assert!(asserter.assert_sessions(&jids, true).await.unwrap());
    assert_eq!(transport.query_count("encrypt"), 2);
}
