//! Per-connection state of the discovery protocol.
//!
//! Each request either acknowledges the last response sent for its type URL,
//! by echoing that response's nonce, or starts a fresh session. The
//! [`DeltaConnection::should_respond`] state machine decides whether a request
//! needs new work and which resource names it added or removed.

use crate::{api::envoy::service::discovery::v3 as xds, nonce, PushError};
use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use std::{collections::BTreeSet, fmt, sync::Arc};
use strategy_controller_core::{ClientIdentifier, Connection, Rule};
use tokio::{sync::mpsc, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub(crate) type ResponseTx = mpsc::Sender<Result<xds::DiscoveryResponse, tonic::Status>>;

/// What a client watches for one type URL.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WatchedResource {
    pub type_url: String,
    pub resource_names: BTreeSet<String>,

    /// The nonce of the last response sent.
    pub nonce_sent: String,

    /// The nonce of the last response the client acknowledged.
    pub nonce_acked: String,
}

/// The resource names a request added and removed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceDelta {
    pub subscribed: BTreeSet<String>,
    pub unsubscribed: BTreeSet<String>,
}

/// A client stream of the discovery protocol.
#[derive(Clone)]
pub struct DeltaConnection(Arc<Inner>);

struct Inner {
    identifier: ClientIdentifier,
    tx: ResponseTx,
    watched: Mutex<HashMap<String, WatchedResource>>,
    stop: CancellationToken,
}

// === impl DeltaConnection ===

impl DeltaConnection {
    pub(crate) fn new(
        identifier: ClientIdentifier,
        tx: ResponseTx,
        stop: CancellationToken,
    ) -> Self {
        Self(Arc::new(Inner {
            identifier,
            tx,
            watched: Default::default(),
            stop,
        }))
    }

    pub fn watched(&self, type_url: &str) -> Option<WatchedResource> {
        self.0.watched.lock().get(type_url).cloned()
    }

    /// Ends the connection's stream.
    pub fn stop(&self) {
        self.0.stop.cancel();
    }

    /// Updates the watched resources for the request's type URL and decides
    /// whether the request needs a response.
    ///
    /// - A request carrying an error detail is a NACK and changes nothing.
    /// - A request with no resource names stops watching the type URL. The
    ///   previously watched names are reported as unsubscribed.
    /// - A request with no nonce, or for a type URL that is not yet watched,
    ///   starts a fresh session: every requested name is subscribed.
    /// - A request whose nonce is not the last one sent is stale and is
    ///   dropped.
    /// - Otherwise the request acknowledges the last response. It needs a
    ///   response only if its resource names changed.
    pub fn should_respond(&self, req: &xds::DiscoveryRequest) -> (bool, ResourceDelta) {
        if req.error_detail.is_some() {
            return (false, ResourceDelta::default());
        }

        let mut watched = self.0.watched.lock();
        if req.resource_names.is_empty() {
            let unsubscribed = watched
                .remove(&req.type_url)
                .map(|w| w.resource_names)
                .unwrap_or_default();
            return (
                false,
                ResourceDelta {
                    unsubscribed,
                    ..Default::default()
                },
            );
        }

        let requested = req.resource_names.iter().cloned().collect::<BTreeSet<_>>();
        if req.response_nonce.is_empty() || !watched.contains_key(&req.type_url) {
            debug!(
                client = %self.0.identifier,
                version = %req.version_info,
                nonce = %req.response_nonce,
                "New session"
            );
            watched.insert(
                req.type_url.clone(),
                WatchedResource {
                    type_url: req.type_url.clone(),
                    resource_names: requested.clone(),
                    ..Default::default()
                },
            );
            return (
                true,
                ResourceDelta {
                    subscribed: requested,
                    ..Default::default()
                },
            );
        }

        let Some(previous) = watched.get_mut(&req.type_url) else {
            return (false, ResourceDelta::default());
        };

        if req.response_nonce != previous.nonce_sent {
            trace!(
                client = %self.0.identifier,
                received = %req.response_nonce,
                sent = %previous.nonce_sent,
                "Ignoring stale nonce"
            );
            return (false, ResourceDelta::default());
        }

        previous.nonce_acked = req.response_nonce.clone();
        let delta = ResourceDelta {
            subscribed: requested
                .difference(&previous.resource_names)
                .cloned()
                .collect(),
            unsubscribed: previous
                .resource_names
                .difference(&requested)
                .cloned()
                .collect(),
        };
        previous.resource_names = requested;

        let respond = !delta.subscribed.is_empty() || !delta.unsubscribed.is_empty();
        (respond, delta)
    }

    /// Sends `rules` for a watched type URL under a fresh nonce and version.
    ///
    /// The nonce is recorded before the response is sent, so that an
    /// acknowledgement cannot race the bookkeeping. If the send fails the
    /// previous nonce is restored. Nothing is sent when the type URL is not
    /// watched.
    pub async fn push_xds_to_stream(
        &self,
        type_url: &str,
        rules: Vec<Rule>,
        timeout: time::Duration,
    ) -> Result<(), PushError> {
        use mpsc::error::SendTimeoutError;

        let nonce = nonce::generate();
        let previous = {
            let mut watched = self.0.watched.lock();
            let Some(w) = watched.get_mut(type_url) else {
                trace!(client = %self.0.identifier, %type_url, "Not watched");
                return Ok(());
            };
            std::mem::replace(&mut w.nonce_sent, nonce.clone())
        };

        let rsp = xds::DiscoveryResponse {
            version_info: nonce::next_version().to_string(),
            resources: rules,
            type_url: type_url.to_string(),
            nonce: nonce.clone(),
            ..Default::default()
        };
        let error = match self.0.tx.send_timeout(Ok(rsp), timeout).await {
            Ok(()) => return Ok(()),
            Err(SendTimeoutError::Timeout(_)) => PushError::Timeout(self.0.identifier.to_string()),
            Err(SendTimeoutError::Closed(_)) => {
                self.stop();
                PushError::Closed(self.0.identifier.to_string())
            }
        };

        if let Some(w) = self.0.watched.lock().get_mut(type_url) {
            if w.nonce_sent == nonce {
                w.nonce_sent = previous;
            }
        }
        Err(error)
    }
}

impl Connection for DeltaConnection {
    fn identifier(&self) -> &ClientIdentifier {
        &self.0.identifier
    }

    fn is_valid(&self) -> bool {
        !self.0.stop.is_cancelled()
    }
}

impl fmt::Debug for DeltaConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeltaConnection")
            .field("identifier", &self.0.identifier)
            .field("stopped", &self.0.stop.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TYPE_URL: &str = "type.googleapis.com/envoy.config.core.v3.TypedExtensionConfig";

    fn mk_connection() -> (
        DeltaConnection,
        mpsc::Receiver<Result<xds::DiscoveryResponse, tonic::Status>>,
    ) {
        let (tx, rx) = mpsc::channel(4);
        let conn = DeltaConnection::new("node-1".into(), tx, CancellationToken::new());
        (conn, rx)
    }

    fn request(nonce: &str, names: &[&str]) -> xds::DiscoveryRequest {
        xds::DiscoveryRequest {
            type_url: TYPE_URL.to_string(),
            response_nonce: nonce.to_string(),
            resource_names: names.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        }
    }

    fn names(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn set_nonce_sent(conn: &DeltaConnection, nonce: &str) {
        conn.0
            .watched
            .lock()
            .get_mut(TYPE_URL)
            .expect("type must be watched")
            .nonce_sent = nonce.to_string();
    }

    #[test]
    fn fresh_session_subscribes_everything() {
        let (conn, _rx) = mk_connection();
        let (respond, delta) = conn.should_respond(&request("", &["a", "b"]));
        assert!(respond);
        assert_eq!(delta.subscribed, names(&["a", "b"]));
        assert!(delta.unsubscribed.is_empty());
        assert_eq!(
            conn.watched(TYPE_URL).map(|w| w.resource_names),
            Some(names(&["a", "b"]))
        );
    }

    #[test]
    fn fresh_session_without_prior_state_ignores_nonce() {
        let (conn, _rx) = mk_connection();
        let (respond, delta) = conn.should_respond(&request("whatever", &["a"]));
        assert!(respond);
        assert_eq!(delta.subscribed, names(&["a"]));
    }

    #[test]
    fn reconnect_replaces_watched_names() {
        let (conn, _rx) = mk_connection();
        conn.should_respond(&request("", &["a", "b"]));
        set_nonce_sent(&conn, "N1");

        let (respond, delta) = conn.should_respond(&request("", &["c"]));
        assert!(respond);
        assert_eq!(delta.subscribed, names(&["c"]));
        assert!(delta.unsubscribed.is_empty());
        let watched = conn.watched(TYPE_URL).expect("must be watched");
        assert_eq!(watched.resource_names, names(&["c"]));
        assert_eq!(watched.nonce_sent, "");
    }

    #[test]
    fn matching_ack_without_changes() {
        let (conn, _rx) = mk_connection();
        conn.should_respond(&request("", &["a"]));
        set_nonce_sent(&conn, "N1");

        let (respond, delta) = conn.should_respond(&request("N1", &["a"]));
        assert!(!respond);
        assert_eq!(delta, ResourceDelta::default());
        assert_eq!(
            conn.watched(TYPE_URL).map(|w| w.nonce_acked),
            Some("N1".to_string())
        );
    }

    #[test]
    fn stale_nonce_is_dropped() {
        let (conn, _rx) = mk_connection();
        conn.should_respond(&request("", &["a"]));
        set_nonce_sent(&conn, "N1");

        let (respond, delta) = conn.should_respond(&request("stale", &["a", "b"]));
        assert!(!respond);
        assert_eq!(delta, ResourceDelta::default());
        let watched = conn.watched(TYPE_URL).expect("must be watched");
        assert_eq!(watched.resource_names, names(&["a"]));
        assert_eq!(watched.nonce_acked, "");
    }

    #[test]
    fn matching_ack_with_changes() {
        let (conn, _rx) = mk_connection();
        conn.should_respond(&request("", &["a", "b"]));
        set_nonce_sent(&conn, "N1");

        let (respond, delta) = conn.should_respond(&request("N1", &["b", "c"]));
        assert!(respond);
        assert_eq!(delta.subscribed, names(&["c"]));
        assert_eq!(delta.unsubscribed, names(&["a"]));
        assert_eq!(
            conn.watched(TYPE_URL).map(|w| w.resource_names),
            Some(names(&["b", "c"]))
        );
    }

    #[test]
    fn nack_changes_nothing() {
        let (conn, _rx) = mk_connection();
        conn.should_respond(&request("", &["a"]));
        set_nonce_sent(&conn, "N1");
        let before = conn.watched(TYPE_URL);

        let mut nack = request("N1", &["b"]);
        nack.error_detail = Some(Default::default());
        let (respond, delta) = conn.should_respond(&nack);
        assert!(!respond);
        assert_eq!(delta, ResourceDelta::default());
        assert_eq!(conn.watched(TYPE_URL), before);
    }

    #[test]
    fn empty_request_unsubscribes_all() {
        let (conn, _rx) = mk_connection();
        conn.should_respond(&request("", &["a", "b"]));

        let (respond, delta) = conn.should_respond(&request("", &[]));
        assert!(!respond);
        assert_eq!(delta.unsubscribed, names(&["a", "b"]));
        assert_eq!(conn.watched(TYPE_URL), None);
    }

    #[tokio::test]
    async fn push_records_nonce() {
        let (conn, mut rx) = mk_connection();
        conn.should_respond(&request("", &["a"]));

        conn.push_xds_to_stream(TYPE_URL, vec![], time::Duration::from_secs(1))
            .await
            .expect("push must succeed");
        let rsp = rx
            .recv()
            .await
            .expect("response must be sent")
            .expect("response must not be an error");
        assert_eq!(rsp.type_url, TYPE_URL);
        assert_eq!(
            conn.watched(TYPE_URL).map(|w| w.nonce_sent),
            Some(rsp.nonce.clone())
        );

        let (respond, _) = conn.should_respond(&request(&rsp.nonce, &["a"]));
        assert!(!respond);
        assert_eq!(
            conn.watched(TYPE_URL).map(|w| w.nonce_acked),
            Some(rsp.nonce)
        );
    }

    #[tokio::test]
    async fn versions_increase_across_pushes() {
        let (conn, mut rx) = mk_connection();
        conn.should_respond(&request("", &["a"]));

        let mut last = 0;
        for _ in 0..3 {
            conn.push_xds_to_stream(TYPE_URL, vec![], time::Duration::from_secs(1))
                .await
                .expect("push must succeed");
            let rsp = rx.recv().await.expect("must send").expect("must be ok");
            let version = rsp.version_info.parse::<u64>().expect("version must be numeric");
            assert!(version > last);
            last = version;
        }
    }

    #[tokio::test]
    async fn failed_push_restores_nonce() {
        let (conn, rx) = mk_connection();
        conn.should_respond(&request("", &["a"]));
        set_nonce_sent(&conn, "N1");
        drop(rx);

        let res = conn
            .push_xds_to_stream(TYPE_URL, vec![], time::Duration::from_secs(1))
            .await;
        assert!(matches!(res, Err(PushError::Closed(_))));
        assert!(!conn.is_valid());
        assert_eq!(
            conn.watched(TYPE_URL).map(|w| w.nonce_sent),
            Some("N1".to_string())
        );
    }

    #[tokio::test]
    async fn unwatched_types_are_not_pushed() {
        let (conn, mut rx) = mk_connection();
        conn.push_xds_to_stream(TYPE_URL, vec![], time::Duration::from_secs(1))
            .await
            .expect("push must succeed");
        assert!(rx.try_recv().is_err());
    }
}
