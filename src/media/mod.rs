pub mod conn;
pub mod retry;

pub use conn::{MediaConnInfo, MediaConnLease, MediaHost};

use std::time::Duration;

/// Refreshes are gated on this interval regardless of the server TTL
pub const MEDIA_CONN_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
