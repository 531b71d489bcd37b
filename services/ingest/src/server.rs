// Full server assembly: producers, route table, registry, rate limiter,
// ack coordinator, and the QUIC listener, wired together with one shutdown
// watch. `main` stays a thin CLI shell around `IngestServer::start`.
use anyhow::{Context, Result};
use fleetline_pipeline::{
    AckCoordinator, ConnectionRegistry, Producer, RateLimiter, RouteTable,
};
use fleetline_transport::QuicServer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::IngestConfig;
use crate::producers;
use crate::tls;
use crate::transport::quic;

/// Shared process state handed to every connection handler.
pub struct ServerState {
    pub config: IngestConfig,
    pub registry: Arc<ConnectionRegistry>,
    pub routes: Arc<RouteTable>,
    pub limiter: Arc<RateLimiter>,
    pub shutdown: watch::Receiver<bool>,
}

pub struct IngestServer {
    local_addr: SocketAddr,
    state: Arc<ServerState>,
    producer_set: Vec<Arc<dyn Producer>>,
    server: Arc<QuicServer>,
    shutdown_tx: watch::Sender<bool>,
}

impl IngestServer {
    pub async fn start(config: IngestConfig) -> Result<Self> {
        config.validate()?;
        let server_config = tls::build_server_config(&config.tls)?;
        let server = Arc::new(
            QuicServer::bind(config.listen, server_config, config.transport_config())
                .context("bind QUIC listener")?,
        );
        let local_addr = server.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry = Arc::new(ConnectionRegistry::new());

        let ack_config = config.ack_config();
        let (ack_tx, ack_rx) = AckCoordinator::channel(&ack_config);
        let producer_map = producers::build(&config, &ack_tx).await?;
        let producer_set: Vec<Arc<dyn Producer>> = producer_map.values().map(Arc::clone).collect();
        let routes = Arc::new(
            RouteTable::build(&config.records, &config.reliable_ack_sources, &producer_map)
                .context("build route table")?,
        );

        let coordinator =
            AckCoordinator::new(Arc::clone(&registry), Arc::clone(&routes), ack_rx, ack_config);
        tokio::spawn(coordinator.run(shutdown_rx.clone()));

        let limiter = Arc::new(RateLimiter::new(config.rate_limit_config()));
        tokio::spawn(Arc::clone(&limiter).run_sweeper(
            Duration::from_secs(config.rate_limit.sweep_interval_secs.max(1)),
            shutdown_rx.clone(),
        ));

        let state = Arc::new(ServerState {
            config,
            registry,
            routes,
            limiter,
            shutdown: shutdown_rx,
        });
        {
            let server = Arc::clone(&server);
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                if let Err(err) = quic::serve(server, state).await {
                    tracing::warn!(error = %err, "accept loop exited");
                }
            });
        }
        tracing::info!(addr = %local_addr, "ingestion listener started");

        Ok(Self {
            local_addr,
            state,
            producer_set,
            server,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Cooperative teardown: stop accepting, drain live connections under
    /// the configured deadline, then close every producer.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for conn in self.state.registry.handles() {
            conn.begin_drain();
        }
        let deadline = tokio::time::Instant::now() + self.state.config.drain_timeout();
        while tokio::time::Instant::now() < deadline && !self.state.registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.server.close(b"shutdown");
        let close_timeout = self.state.config.close_timeout();
        for producer in &self.producer_set {
            if let Err(err) = producer.close(close_timeout).await {
                tracing::warn!(backend = producer.name(), error = %err, "producer close failed");
            }
        }
        tracing::info!("ingestion server stopped");
    }
}
