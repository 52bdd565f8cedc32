//! Media-server connection lease.
//!
//! The upload endpoints and their auth token are leased from the server
//! and refreshed at most once per minute. Concurrent callers coalesce
//! onto a single in-flight fetch and all observe the same result.

use crate::{
    binary::Node,
    error::Result,
    media::MEDIA_CONN_REFRESH_INTERVAL,
    transport::StanzaTransport,
};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::debug;

/// One media upload host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaHost {
    pub hostname: String,
    pub max_content_length_bytes: u64,
}

/// A leased media connection descriptor
#[derive(Debug, Clone)]
pub struct MediaConnInfo {
    pub hosts: Vec<MediaHost>,
    pub auth: String,
    /// Server-reported lease lifetime in seconds; recorded but the
    /// refresh gate is [`MEDIA_CONN_REFRESH_INTERVAL`]
    pub ttl: u64,
    pub fetched_at: Instant,
}

type SharedFetch = Shared<BoxFuture<'static, Result<Arc<MediaConnInfo>>>>;

#[derive(Default)]
struct LeaseState {
    current: Option<Arc<MediaConnInfo>>,
    last_fetch: Option<Instant>,
    inflight: Option<SharedFetch>,
}

/// Single-flight media connection lease
pub struct MediaConnLease {
    transport: Arc<dyn StanzaTransport>,
    state: Mutex<LeaseState>,
}

impl MediaConnLease {
    pub fn new(transport: Arc<dyn StanzaTransport>) -> Self {
        Self {
            transport,
            state: Mutex::new(LeaseState::default()),
        }
    }

    /// Return the current lease, refreshing it when absent, forced, or
    /// older than the refresh interval. Concurrent callers share one
    /// in-flight fetch.
    pub async fn refresh(&self, force: bool) -> Result<Arc<MediaConnInfo>> {
        let fut = {
            let mut state = self.state.lock().expect("lease lock poisoned");
            if let Some(inflight) = state.inflight.clone() {
                inflight
            } else {
                let stale = state
                    .last_fetch
                    .map(|at| at.elapsed() > MEDIA_CONN_REFRESH_INTERVAL)
                    .unwrap_or(true);
                if state.current.is_none() || force || stale {
                    debug!("refreshing media connection lease");
                    let transport = self.transport.clone();
                    let fut = fetch_media_conn(transport).boxed().shared();
                    state.inflight = Some(fut.clone());
                    fut
                } else {
                    return Ok(state.current.clone().expect("lease present"));
                }
            }
        };

        let result = fut.await;

        let mut state = self.state.lock().expect("lease lock poisoned");
        state.inflight = None;
        if let Ok(info) = &result {
            state.current = Some(info.clone());
            state.last_fetch = Some(Instant::now());
        }
        result
    }
}

async fn fetch_media_conn(transport: Arc<dyn StanzaTransport>) -> Result<Arc<MediaConnInfo>> {
    let iq = Node::new("iq")
        .attr("to", crate::types::DEFAULT_USER_SERVER)
        .attr("type", "set")
        .attr("xmlns", "w:m")
        .attr("id", uuid::Uuid::new_v4().to_string())
        .with_children(vec![Node::new("media_conn")]);

    let response = transport.query(iq).await?;
    let conn_node = response.expect_child("media_conn")?;

    let auth = conn_node.attr_or_missing("auth")?.to_string();
    let ttl = conn_node
        .get_attr("ttl")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let hosts = conn_node
        .find_children("host")
        .into_iter()
        .map(|host| {
            Ok(MediaHost {
                hostname: host.attr_or_missing("hostname")?.to_string(),
                max_content_length_bytes: host
                    .get_attr("maxContentLengthBytes")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Arc::new(MediaConnInfo {
        hosts,
        auth,
        ttl,
        fetched_at: Instant::now(),
    }))
}
