use crate::{
    core::FanoutMode,
    grpc::{
        discovery::{DiscoveryPush, DiscoveryServer},
        metrics::PushMetrics,
        transport::{DirectPush, TransportServer},
        Dispatcher, PushConfig, Publish, Subscribers,
    },
    index::{IndexMetrics, WatcherRegistry},
    kinds, ClusterWatches,
};
use anyhow::{bail, Result};
use clap::Parser;
use futures::prelude::*;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, sync::Arc};
use tokio::time::Duration;
use tonic::transport::{server::Router, Server};
use tracing::{info, info_span, instrument, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "strategy", about = "A fault-tolerance strategy control plane")]
pub struct Args {
    #[clap(
        long,
        default_value = "strategy=info,warn",
        env = "STRATEGY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Serves the subscribe/push transport protocol.
    #[clap(long, default_value = "0.0.0.0:10246")]
    transport_addr: SocketAddr,

    /// Serves the extension config discovery protocol.
    #[clap(long, default_value = "0.0.0.0:10247")]
    discovery_addr: SocketAddr,

    /// Identifies this control plane in every transport response.
    ///
    /// Defaults to `osg-$HOSTNAME`.
    #[clap(long, env = "STRATEGY_CONTROLLER_ID")]
    control_plane_id: Option<String>,

    /// The number of times a timed-out push to a transport client is
    /// attempted.
    #[clap(long, default_value = "3")]
    push_max_attempts: usize,

    #[clap(long, default_value = "3000")]
    push_timeout_ms: u64,

    #[clap(long, default_value = "4")]
    push_workers: usize,

    #[clap(long, default_value = "1024")]
    push_queue_capacity: usize,

    /// Either `fail-fast` or `best-effort`.
    #[clap(long, default_value = "fail-fast")]
    fanout: FanoutMode,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            transport_addr,
            discovery_addr,
            control_plane_id,
            push_max_attempts,
            push_timeout_ms,
            push_workers,
            push_queue_capacity,
            fanout,
        } = self;

        if push_max_attempts == 0 {
            bail!("--push-max-attempts must be at least 1");
        }
        let control_plane_id = control_plane_id.unwrap_or_else(|| {
            let hostname =
                std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string());
            format!("osg-{hostname}")
        });

        let mut prom = <Registry>::default();
        let index_metrics = IndexMetrics::register(prom.sub_registry_with_prefix("index"));
        let push_metrics = PushMetrics::register(prom.sub_registry_with_prefix("push"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Watchers hand rule updates to the dispatcher, whose workers publish
        // them to the clients of both protocols.
        let (dispatcher, workers) = Dispatcher::new(push_workers, push_queue_capacity);
        let watchers = Arc::new(WatcherRegistry::new(
            kinds(),
            Arc::new(ClusterWatches::new(runtime.client())),
            Arc::new(dispatcher),
            index_metrics,
        ));
        let subscribers = Subscribers::new(watchers);

        let config = PushConfig {
            max_attempts: push_max_attempts,
            timeout: Duration::from_millis(push_timeout_ms),
            fanout,
        };
        let direct = DirectPush::new(
            &subscribers,
            config.clone(),
            &control_plane_id,
            push_metrics.clone(),
        );
        let discovery = DiscoveryPush::new(&subscribers, config, push_metrics);
        let engines: Vec<Arc<dyn Publish>> =
            vec![Arc::new(direct.clone()), Arc::new(discovery.clone())];
        workers.spawn(engines);

        let drain = runtime.shutdown_handle();
        let transport = TransportServer::new(subscribers.clone(), direct, drain.clone());
        tokio::spawn(
            grpc(
                transport_addr,
                Server::builder().add_service(transport.svc()),
                drain.clone(),
            )
            .instrument(info_span!("transport")),
        );
        let discovery = DiscoveryServer::new(subscribers, discovery, drain.clone());
        tokio::spawn(
            grpc(
                discovery_addr,
                Server::builder().add_service(discovery.svc()),
                drain,
            )
            .instrument(info_span!("discovery")),
        );
        info!(%control_plane_id, "Started control plane");

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

#[instrument(skip_all, fields(port = %addr.port()))]
async fn grpc(addr: SocketAddr, router: Router, drain: drain::Watch) -> Result<()> {
    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = router.serve_with_shutdown(addr, close_rx.map(|_| {}));
    }

    info!(%addr, "gRPC server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?
        }
    }
    Ok(())
}
