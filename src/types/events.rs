use crate::{
    error::{Error, Result},
    proto,
    types::MessageKey,
};
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::broadcast;

/// Events emitted by the relay core
#[derive(Debug, Clone)]
pub enum Event {
    /// A media re-upload notification arrived for one or more messages
    MediaUpdate(Vec<MediaUpdateEvent>),
    /// One or more stored messages changed (e.g. media URL refreshed)
    MessagesUpdate(Vec<MessageUpdateEvent>),
}

/// Encrypted payload of a media re-upload notification
#[derive(Debug, Clone)]
pub struct RetryMedia {
    pub ciphertext: Bytes,
    pub iv: Bytes,
}

#[derive(Debug, Clone)]
pub struct MediaUpdateEvent {
    pub key: MessageKey,
    pub media: Option<RetryMedia>,
    /// Error status reported by the peer device, if any
    pub error_code: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct MessageUpdateEvent {
    pub key: MessageKey,
    pub message: proto::Message,
}

/// Broadcast-based event bus shared by the relay and its embedder.
///
/// Subscribing before triggering the operation that produces the event is
/// the caller's responsibility; the channel drops events for receivers
/// that subscribe late.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(128);
        Self { tx }
    }

    /// Emit an event to all current subscribers
    pub fn emit(&self, event: Event) {
        // A send error only means nobody is listening.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Wait on an already-subscribed receiver for a media update matching
    /// the given message id
    pub async fn wait_for_media_update(
        rx: &mut broadcast::Receiver<Event>,
        message_id: &str,
        timeout: Duration,
    ) -> Result<MediaUpdateEvent> {
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(Event::MediaUpdate(updates)) => {
                        if let Some(update) = updates.into_iter().find(|u| u.key.id == message_id) {
                            return Ok(update);
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(Error::Transport("event bus closed".to_string()));
                    }
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Timeout("messages.media-update".to_string()))?
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JID;

    fn key(id: &str) -> MessageKey {
        MessageKey {
            remote_jid: JID::new("123", "s.whatsapp.net"),
            from_me: true,
            id: id.to_string(),
            participant: None,
        }
    }

    #[tokio::test]
    async fn test_wait_for_matching_media_update() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(Event::MediaUpdate(vec![MediaUpdateEvent {
            key: key("other"),
            media: None,
            error_code: None,
        }]));
        bus.emit(Event::MediaUpdate(vec![MediaUpdateEvent {
            key: key("target"),
            media: None,
            error_code: Some(404),
        }]));

        let update =
            EventBus::wait_for_media_update(&mut rx, "target", Duration::from_secs(1))
                .await
                .unwrap();
        assert_eq!(update.key.id, "target");
        assert_eq!(update.error_code, Some(404));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let err = EventBus::wait_for_media_update(&mut rx, "x", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
