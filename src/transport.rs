use crate::{binary::Node, error::Result};
use async_trait::async_trait;

/// Stanza-level transport capability.
///
/// The relay core never touches sockets or framing; it hands fully built
/// [`Node`] stanzas to this trait and receives parsed response nodes back.
#[async_trait]
pub trait StanzaTransport: Send + Sync {
    /// Emit a stanza without waiting for a reply
    async fn send_node(&self, node: Node) -> Result<()>;

    /// Emit an iq stanza and wait for its matching response.
    ///
    /// Implementations correlate request and response by stanza id and
    /// surface iq-level errors as [`crate::Error::Transport`].
    async fn query(&self, node: Node) -> Result<Node>;
}
