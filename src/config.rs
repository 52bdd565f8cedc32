use crate::{error::Result, proto, types::GroupMetadata, types::JID};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the relay engine
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Group sends above this participant count split into fixed-size
    /// blocks dispatched in parallel
    pub participant_block_size: usize,
    /// TTL of the per-user device cache
    pub user_devices_cache_ttl: Duration,
    /// Emit events for own sends
    pub emit_own_events: bool,
    /// Ask higher layers for high quality link previews
    pub generate_high_quality_link_preview: bool,
    /// Thumbnail width handed to link-preview builders
    pub link_preview_image_thumbnail_width: u32,
    /// Upper bound on the wait for a media re-upload notification
    pub media_retry_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            participant_block_size: 200,
            user_devices_cache_ttl: Duration::from_secs(300),
            emit_own_events: true,
            generate_high_quality_link_preview: false,
            link_preview_image_thumbnail_width: 192,
            media_retry_timeout: Duration::from_secs(60),
        }
    }
}

/// Hook letting higher layers adjust a message per recipient set just
/// before serialization
#[async_trait]
pub trait MessagePatcher: Send + Sync {
    async fn patch_message(
        &self,
        message: proto::Message,
        recipient_jids: &[JID],
    ) -> Result<proto::Message>;
}

/// Source of cached group metadata; returning `None` makes the engine
/// fall back to a live query
#[async_trait]
pub trait GroupMetadataProvider: Send + Sync {
    async fn cached_group_metadata(&self, jid: &JID) -> Option<GroupMetadata>;
}

/// External collaborators injected into the relay engine
#[derive(Clone, Default)]
pub struct RelayCollaborators {
    pub patch_message: Option<Arc<dyn MessagePatcher>>,
    pub cached_group_metadata: Option<Arc<dyn GroupMetadataProvider>>,
}

impl std::fmt::Debug for RelayCollaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayCollaborators")
            .field("patch_message", &self.patch_message.is_some())
            .field("cached_group_metadata", &self.cached_group_metadata.is_some())
            .finish()
    }
}
