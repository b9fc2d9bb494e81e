//! The direct-push transport protocol.
//!
//! Clients open a bidirectional stream and send subscribe or unsubscribe
//! requests naming a `(namespace, app, kinds)` target. The server pushes the
//! current rules for each subscribed target whenever they change, and once
//! immediately on subscribe when rules are already cached.

use crate::{
    api::transport::{
        self as proto,
        open_sergo_universal_transport_service_server::{
            OpenSergoUniversalTransportService, OpenSergoUniversalTransportServiceServer,
        },
    },
    metrics::{PushMetrics, TRANSPORT},
    nonce,
    push::{fan_out, PushConfig, PushError},
    subscribers::SubscribeError,
    Publish, Subscribers,
};
use futures::prelude::*;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use strategy_controller_core::{
    ClientIdentifier, Connection, ConnectionRegistry, ResourceKind, Rule, SubscribeTarget,
};
use tokio::{sync::mpsc, time};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, info_span, trace, warn, Instrument};

pub const CODE_SUCCESS: i32 = 1;
pub const CODE_CLIENT_FORMAT_ERROR: i32 = 4001;
pub const CODE_BAD_REQUEST: i32 = 4002;
pub const CODE_REGISTER_WATCHER_ERROR: i32 = 500;

pub const ACK: &str = "ACK";
pub const NACK: &str = "NACK";

const STREAM_CAPACITY: usize = 16;

type ResponseTx = mpsc::Sender<Result<proto::SubscribeResponse, tonic::Status>>;

/// A client stream of the transport protocol.
#[derive(Clone, Debug)]
pub struct TransportConnection(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    identifier: ClientIdentifier,
    tx: ResponseTx,
    valid: AtomicBool,
}

/// Publishes rule updates to transport clients.
#[derive(Clone, Debug)]
pub struct DirectPush {
    connections: Arc<ConnectionRegistry<TransportConnection>>,
    config: PushConfig,
    control_plane: proto::ControlPlaneDesc,
    metrics: PushMetrics,
}

#[derive(Clone, Debug)]
pub struct TransportServer {
    subscribers: Subscribers,
    push: DirectPush,
    drain: drain::Watch,
}

/// Per-stream state.
#[derive(Debug)]
struct Session {
    tx: ResponseTx,
    connection: Option<TransportConnection>,
}

// === impl TransportConnection ===

impl TransportConnection {
    pub fn new(identifier: ClientIdentifier, tx: ResponseTx) -> Self {
        Self(Arc::new(Inner {
            identifier,
            tx,
            valid: AtomicBool::new(true),
        }))
    }

    /// Marks the connection as closed; pushes skip it until it is removed from
    /// the registry.
    pub fn invalidate(&self) {
        self.0.valid.store(false, Ordering::Release);
    }

    async fn send(
        &self,
        rsp: proto::SubscribeResponse,
        timeout: time::Duration,
    ) -> Result<(), PushError> {
        use mpsc::error::SendTimeoutError;

        match self.0.tx.send_timeout(Ok(rsp), timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                Err(PushError::Timeout(self.0.identifier.to_string()))
            }
            Err(SendTimeoutError::Closed(_)) => {
                self.invalidate();
                Err(PushError::Closed(self.0.identifier.to_string()))
            }
        }
    }
}

impl Connection for TransportConnection {
    fn identifier(&self) -> &ClientIdentifier {
        &self.0.identifier
    }

    fn is_valid(&self) -> bool {
        self.0.valid.load(Ordering::Acquire)
    }
}

// === impl DirectPush ===

impl DirectPush {
    pub fn new(
        subscribers: &Subscribers,
        config: PushConfig,
        control_plane_id: impl ToString,
        metrics: PushMetrics,
    ) -> Self {
        Self {
            connections: subscribers.transport().clone(),
            config,
            control_plane: proto::ControlPlaneDesc {
                identifier: control_plane_id.to_string(),
            },
            metrics,
        }
    }

    /// Sends a response, retrying only sends that time out.
    async fn send_with_retry(
        &self,
        conn: &TransportConnection,
        rsp: proto::SubscribeResponse,
    ) -> Result<(), PushError> {
        let mut attempt = 1;
        loop {
            match conn.send(rsp.clone(), self.config.timeout).await {
                Err(PushError::Timeout(client)) if attempt < self.config.max_attempts => {
                    debug!(%client, attempt, "Retrying push");
                    attempt += 1;
                }
                res => {
                    self.metrics.pushed(TRANSPORT, res.is_ok());
                    return res;
                }
            }
        }
    }

    fn rules_response(
        &self,
        target: &SubscribeTarget,
        rules: Vec<Rule>,
        version: i64,
        response_id: String,
    ) -> proto::SubscribeResponse {
        proto::SubscribeResponse {
            status: Some(status(CODE_SUCCESS, "Get and send rule success")),
            namespace: target.namespace.clone(),
            app: target.app.clone(),
            kind: target.kind.to_string(),
            data_with_version: Some(proto::DataWithVersion {
                data: rules,
                version,
            }),
            control_plane: Some(self.control_plane.clone()),
            response_id,
            ..Default::default()
        }
    }

    /// Builds a response to a request that carries no rules. `ack` is only
    /// set when the request itself is rejected.
    fn status_response(
        &self,
        code: i32,
        message: impl ToString,
        ack: &str,
        response_id: &str,
        target: Option<&SubscribeTarget>,
    ) -> proto::SubscribeResponse {
        let mut rsp = proto::SubscribeResponse {
            status: Some(status(code, message)),
            ack: ack.to_string(),
            control_plane: Some(self.control_plane.clone()),
            response_id: response_id.to_string(),
            ..Default::default()
        };
        if let Some(target) = target {
            rsp.namespace = target.namespace.clone();
            rsp.app = target.app.clone();
            rsp.kind = target.kind.to_string();
        }
        rsp
    }
}

#[async_trait::async_trait]
impl Publish for DirectPush {
    async fn publish(
        &self,
        target: &SubscribeTarget,
        rules: &[Rule],
        version: i64,
    ) -> Result<(), PushError> {
        let connections = self
            .connections
            .get(target)
            .ok_or_else(|| PushError::NoConnectionsForKind(target.clone()))?;

        fan_out(self.config.fanout, connections, |conn| {
            let rsp = self.rules_response(target, rules.to_vec(), version, nonce::generate());
            async move {
                if !conn.is_valid() {
                    trace!(client = %conn.identifier(), "Skipping closed connection");
                    return Ok(());
                }
                self.send_with_retry(&conn, rsp).await
            }
        })
        .await
    }
}

// === impl TransportServer ===

impl TransportServer {
    pub fn new(subscribers: Subscribers, push: DirectPush, drain: drain::Watch) -> Self {
        Self {
            subscribers,
            push,
            drain,
        }
    }

    pub fn svc(self) -> OpenSergoUniversalTransportServiceServer<Self> {
        OpenSergoUniversalTransportServiceServer::new(self)
    }

    /// Processes a client's requests until the stream ends or the server
    /// shuts down, then removes the client's subscriptions.
    pub(crate) async fn serve<S>(self, mut requests: S, tx: ResponseTx)
    where
        S: Stream<Item = Result<proto::SubscribeRequest, tonic::Status>> + Send + Unpin,
    {
        let _guard = self.push.metrics.connection_opened(TRANSPORT);
        let mut session = Session {
            tx,
            connection: None,
        };

        let shutdown = self.drain.clone().signaled();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                req = requests.next() => match req {
                    Some(Ok(req)) => self.handle(&mut session, req).await,
                    Some(Err(status)) => {
                        debug!(%status, "Stream failed");
                        break;
                    }
                    None => {
                        debug!("Stream closed");
                        break;
                    }
                },

                _ = &mut shutdown => {
                    debug!("Server shutting down");
                    break;
                }
            }
        }

        if let Some(conn) = session.connection {
            conn.invalidate();
            self.teardown(conn.identifier());
        }
    }

    async fn handle(&self, session: &mut Session, req: proto::SubscribeRequest) {
        match req.response_ack.as_str() {
            ACK => {
                trace!(request_id = %req.request_id, "Push acknowledged");
                return;
            }
            NACK => {
                let proto::Status { code, message, .. } = req.status.unwrap_or_default();
                if code == CODE_CLIENT_FORMAT_ERROR {
                    warn!(request_id = %req.request_id, %message, "Client could not parse pushed rules");
                } else {
                    warn!(request_id = %req.request_id, code, %message, "Client rejected push");
                }
                return;
            }
            _ => {}
        }

        let conn = session.connection(&req.identifier);
        let (op, targets) = match validate(&req) {
            Ok(valid) => valid,
            Err(reason) => {
                info!(client = %conn.identifier(), request_id = %req.request_id, %reason, "Malformed request");
                let rsp = self.push.status_response(
                    CODE_BAD_REQUEST,
                    reason,
                    NACK,
                    &req.request_id,
                    None,
                );
                if let Err(error) = conn.send(rsp, self.push.config.timeout).await {
                    debug!(%error, "Failed to reject request");
                }
                return;
            }
        };

        for target in targets {
            match op {
                proto::SubscribeOpType::Subscribe => {
                    self.subscribe(&conn, &target, &req.request_id).await
                }
                proto::SubscribeOpType::Unsubscribe => self.unsubscribe(&conn, &target),
            }
        }
    }

    async fn subscribe(
        &self,
        conn: &TransportConnection,
        target: &SubscribeTarget,
        request_id: &str,
    ) {
        let client = conn.identifier();
        let registry = self.subscribers.transport();
        let watcher = match self.subscribers.subscribe(registry, target, conn.clone()) {
            Ok(watcher) => watcher,
            Err(SubscribeError::Watch(error)) => {
                warn!(%error, %client, %target, "Failed to register watcher");
                let rsp = self.push.status_response(
                    CODE_REGISTER_WATCHER_ERROR,
                    "Register watcher error",
                    "",
                    request_id,
                    Some(target),
                );
                if let Err(error) = self.push.send_with_retry(conn, rsp).await {
                    debug!(%error, %client, "Failed to report registration error");
                }
                return;
            }
            Err(SubscribeError::Registry(error)) => {
                debug!(%error, %client, %target, "Connection closed before subscribing");
                return;
            }
        };
        debug!(%client, %target, "Subscribed");

        let (rules, version) = watcher.get_rules(&target.namespaced_app());
        if rules.is_empty() {
            return;
        }
        let rsp = self
            .push
            .rules_response(target, rules, version, request_id.to_string());
        if let Err(error) = self.push.send_with_retry(conn, rsp).await {
            warn!(%error, %client, %target, "Failed to push current rules");
        }
    }

    fn unsubscribe(&self, conn: &TransportConnection, target: &SubscribeTarget) {
        if self.subscribers.transport().remove(target, conn.identifier()) {
            debug!(client = %conn.identifier(), %target, "Unsubscribed");
        }
        self.subscribers.release(target);
    }

    fn teardown(&self, client: &ClientIdentifier) {
        for target in self.subscribers.transport().remove_by_identifier(client) {
            self.subscribers.release(&target);
        }
        debug!(%client, "Removed connection");
    }
}

#[async_trait::async_trait]
impl OpenSergoUniversalTransportService for TransportServer {
    type SubscribeConfigStream = ReceiverStream<Result<proto::SubscribeResponse, tonic::Status>>;

    async fn subscribe_config(
        &self,
        req: tonic::Request<tonic::Streaming<proto::SubscribeRequest>>,
    ) -> Result<tonic::Response<Self::SubscribeConfigStream>, tonic::Status> {
        let requests = req.into_inner();
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        tokio::spawn(
            self.clone()
                .serve(requests, tx)
                .instrument(info_span!("subscribe")),
        );
        Ok(tonic::Response::new(ReceiverStream::new(rx)))
    }
}

// === impl Session ===

impl Session {
    /// Returns the stream's connection, naming it after the first non-empty
    /// identifier the client sends.
    fn connection(&mut self, identifier: &str) -> TransportConnection {
        let tx = &self.tx;
        self.connection
            .get_or_insert_with(|| {
                let identifier = if identifier.is_empty() {
                    ClientIdentifier::from(format!("transport-{}", nonce::generate()))
                } else {
                    ClientIdentifier::from(identifier)
                };
                TransportConnection::new(identifier, tx.clone())
            })
            .clone()
    }
}

fn validate(
    req: &proto::SubscribeRequest,
) -> Result<(proto::SubscribeOpType, Vec<SubscribeTarget>), String> {
    let op = proto::SubscribeOpType::try_from(req.op_type)
        .map_err(|_| format!("unknown operation {}", req.op_type))?;
    let target = req
        .target
        .as_ref()
        .ok_or_else(|| "missing target".to_string())?;
    if target.namespace.is_empty() || target.app.is_empty() {
        return Err("target namespace and app must be set".to_string());
    }
    if target.kinds.is_empty() {
        return Err("target kinds must not be empty".to_string());
    }

    let targets = target
        .kinds
        .iter()
        .map(|kind| SubscribeTarget {
            namespace: target.namespace.clone(),
            app: target.app.clone(),
            kind: ResourceKind::from(kind.as_str()),
        })
        .collect();
    Ok((op, targets))
}

fn status(code: i32, message: impl ToString) -> proto::Status {
    proto::Status {
        code,
        message: message.to_string(),
        details: vec![],
    }
}
