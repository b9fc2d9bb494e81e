//! The discovery protocol server.
//!
//! Clients stream discovery requests naming the resources they want as
//! `<kind>/<app>/<namespace>`. Every request after the first echoes the nonce
//! of the response it acknowledges; see [`crate::delta`].

use crate::{
    api::envoy::service::{
        discovery::v3 as xds,
        extension::v3::extension_config_discovery_service_server::{
            ExtensionConfigDiscoveryService, ExtensionConfigDiscoveryServiceServer,
        },
    },
    delta::{DeltaConnection, ResourceDelta, ResponseTx},
    metrics::{PushMetrics, DISCOVERY},
    nonce,
    push::{fan_out, PushConfig, PushError},
    subscribers::SubscribeError,
    Publish, Subscribers,
};
use futures::prelude::*;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use strategy_controller_core::{
    ClientIdentifier, Connection, ConnectionRegistry, ResourceName, Rule, SubscribeTarget,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, trace, warn, Instrument};

pub const TYPE_URL: &str = "type.googleapis.com/envoy.config.core.v3.TypedExtensionConfig";

const STREAM_CAPACITY: usize = 16;

static CONNECTIONS: AtomicU64 = AtomicU64::new(0);

/// Publishes rule updates to discovery clients.
#[derive(Clone, Debug)]
pub struct DiscoveryPush {
    connections: Arc<ConnectionRegistry<DeltaConnection>>,
    config: PushConfig,
    metrics: PushMetrics,
}

#[derive(Clone, Debug)]
pub struct DiscoveryServer {
    subscribers: Subscribers,
    push: DiscoveryPush,
    drain: drain::Watch,
}

// === impl DiscoveryPush ===

impl DiscoveryPush {
    pub fn new(subscribers: &Subscribers, config: PushConfig, metrics: PushMetrics) -> Self {
        Self {
            connections: subscribers.discovery().clone(),
            config,
            metrics,
        }
    }

    async fn send(&self, conn: &DeltaConnection, rules: Vec<Rule>) -> Result<(), PushError> {
        let res = conn
            .push_xds_to_stream(TYPE_URL, rules, self.config.timeout)
            .await;
        self.metrics.pushed(DISCOVERY, res.is_ok());
        res
    }
}

#[async_trait::async_trait]
impl Publish for DiscoveryPush {
    async fn publish(
        &self,
        target: &SubscribeTarget,
        rules: &[Rule],
        _version: i64,
    ) -> Result<(), PushError> {
        let connections = self
            .connections
            .get(target)
            .ok_or_else(|| PushError::NoConnectionsForKind(target.clone()))?;

        fan_out(self.config.fanout, connections, |conn| async move {
            if !conn.is_valid() {
                trace!(client = %conn.identifier(), "Skipping closed connection");
                return Ok(());
            }
            self.send(&conn, rules.to_vec()).await
        })
        .await
    }
}

// === impl DiscoveryServer ===

impl DiscoveryServer {
    pub fn new(subscribers: Subscribers, push: DiscoveryPush, drain: drain::Watch) -> Self {
        Self {
            subscribers,
            push,
            drain,
        }
    }

    pub fn svc(self) -> ExtensionConfigDiscoveryServiceServer<Self> {
        ExtensionConfigDiscoveryServiceServer::new(self)
    }

    /// Serves a client stream.
    ///
    /// Requests are read on a separate task and handed over one at a time.
    /// Nothing is processed until the first request names the client's node.
    pub(crate) async fn serve<S>(self, requests: S, tx: ResponseTx)
    where
        S: Stream<Item = Result<xds::DiscoveryRequest, tonic::Status>> + Send + Unpin + 'static,
    {
        let _guard = self.push.metrics.connection_opened(DISCOVERY);
        let stop = CancellationToken::new();
        let (req_tx, mut req_rx) = mpsc::channel(1);
        tokio::spawn(receive(requests, req_tx, stop.clone()).in_current_span());

        let shutdown = self.drain.clone().signaled();
        tokio::pin!(shutdown);

        let first = tokio::select! {
            req = req_rx.recv() => req,
            _ = &mut shutdown => None,
        };
        let Some(first) = first else {
            stop.cancel();
            return;
        };

        let conn = DeltaConnection::new(connection_id(first.node.as_ref()), tx, stop.clone());
        let span = info_span!("discovery", client = %conn.identifier());
        async move {
            debug!("Connected");
            self.handle(&conn, first).await;
            loop {
                tokio::select! {
                    biased;

                    req = req_rx.recv() => match req {
                        Some(req) => self.handle(&conn, req).await,
                        None => break,
                    },

                    _ = stop.cancelled() => break,

                    _ = &mut shutdown => {
                        debug!("Server shutting down");
                        break;
                    }
                }
            }

            conn.stop();
            self.teardown(conn.identifier());
        }
        .instrument(span)
        .await
    }

    async fn handle(&self, conn: &DeltaConnection, req: xds::DiscoveryRequest) {
        if let Some(status) = req.error_detail.as_ref() {
            warn!(code = status.code, message = %status.message, nonce = %req.response_nonce, "Client rejected push");
        }
        if req.type_url != TYPE_URL {
            debug!(type_url = %req.type_url, "Ignoring unsupported type");
            return;
        }

        let (respond, ResourceDelta { subscribed, unsubscribed }) = conn.should_respond(&req);
        for name in unsubscribed {
            self.unsubscribe(conn, &name);
        }
        if !respond {
            return;
        }
        for name in subscribed {
            self.subscribe(conn, &name).await;
        }
    }

    async fn subscribe(&self, conn: &DeltaConnection, name: &str) {
        let client = conn.identifier();
        let target = match name.parse::<ResourceName>() {
            Ok(name) => name.target(),
            Err(error) => {
                warn!(%error, %client, "Ignoring resource");
                return;
            }
        };

        let registry = self.subscribers.discovery();
        let watcher = match self.subscribers.subscribe(registry, &target, conn.clone()) {
            Ok(watcher) => watcher,
            Err(SubscribeError::Watch(error)) => {
                warn!(%error, %client, %target, "Failed to register watcher");
                return;
            }
            Err(SubscribeError::Registry(error)) => {
                debug!(%error, %client, %target, "Connection closed before subscribing");
                return;
            }
        };
        debug!(%client, %target, "Subscribed");

        let (rules, _) = watcher.get_rules(&target.namespaced_app());
        if rules.is_empty() {
            return;
        }
        if let Err(error) = self.push.send(conn, rules).await {
            warn!(%error, %client, %target, "Failed to push current rules");
        }
    }

    fn unsubscribe(&self, conn: &DeltaConnection, name: &str) {
        let Ok(name) = name.parse::<ResourceName>() else {
            return;
        };
        let target = name.target();
        if self.subscribers.discovery().remove(&target, conn.identifier()) {
            debug!(client = %conn.identifier(), %target, "Unsubscribed");
        }
        self.subscribers.release(&target);
    }

    fn teardown(&self, client: &ClientIdentifier) {
        for target in self.subscribers.discovery().remove_by_identifier(client) {
            self.subscribers.release(&target);
        }
        debug!("Disconnected");
    }

    /// Reads the cached rules for each requested resource name. Names whose
    /// kind is not watched yield no rules.
    fn snapshot(&self, names: &[String]) -> Result<Vec<Rule>, tonic::Status> {
        let mut rules = Vec::new();
        for name in names {
            let name = name
                .parse::<ResourceName>()
                .map_err(|error| tonic::Status::invalid_argument(error.to_string()))?;
            if let Some(watcher) = self.subscribers.watchers().get_watcher(&name.kind) {
                rules.extend(watcher.get_rules(&name.target().namespaced_app()).0);
            }
        }
        Ok(rules)
    }
}

#[async_trait::async_trait]
impl ExtensionConfigDiscoveryService for DiscoveryServer {
    type StreamExtensionConfigsStream =
        ReceiverStream<Result<xds::DiscoveryResponse, tonic::Status>>;

    async fn stream_extension_configs(
        &self,
        req: tonic::Request<tonic::Streaming<xds::DiscoveryRequest>>,
    ) -> Result<tonic::Response<Self::StreamExtensionConfigsStream>, tonic::Status> {
        let requests = req.into_inner();
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        tokio::spawn(self.clone().serve(requests, tx));
        Ok(tonic::Response::new(ReceiverStream::new(rx)))
    }

    async fn fetch_extension_configs(
        &self,
        req: tonic::Request<xds::DiscoveryRequest>,
    ) -> Result<tonic::Response<xds::DiscoveryResponse>, tonic::Status> {
        let req = req.into_inner();
        if !req.type_url.is_empty() && req.type_url != TYPE_URL {
            return Err(tonic::Status::invalid_argument(format!(
                "unsupported type {}",
                req.type_url
            )));
        }

        let resources = self.snapshot(&req.resource_names)?;
        Ok(tonic::Response::new(xds::DiscoveryResponse {
            version_info: nonce::next_version().to_string(),
            resources,
            type_url: TYPE_URL.to_string(),
            nonce: nonce::generate(),
            ..Default::default()
        }))
    }
}

/// Forwards requests from the client stream until it ends, then stops the
/// connection.
async fn receive<S>(
    mut requests: S,
    tx: mpsc::Sender<xds::DiscoveryRequest>,
    stop: CancellationToken,
) where
    S: Stream<Item = Result<xds::DiscoveryRequest, tonic::Status>> + Unpin,
{
    loop {
        tokio::select! {
            req = requests.next() => match req {
                Some(Ok(req)) => {
                    if tx.send(req).await.is_err() {
                        break;
                    }
                }
                Some(Err(status)) => {
                    debug!(%status, "Stream failed");
                    break;
                }
                None => {
                    debug!("Stream closed");
                    break;
                }
            },

            _ = stop.cancelled() => break,
        }
    }
    stop.cancel();
}

fn connection_id(node: Option<&crate::api::envoy::config::core::v3::Node>) -> ClientIdentifier {
    let node = node
        .map(|n| n.id.as_str())
        .filter(|id| !id.is_empty())
        .unwrap_or("unknown");
    let seq = CONNECTIONS.fetch_add(1, Ordering::Relaxed) + 1;
    ClientIdentifier::from(format!("{node}-{seq}"))
}
