//! Production runtime for the roomcast relay.
//!
//! This crate is the glue around [`roomcast_core`]'s sans-IO state: tokio
//! tasks own the sockets, per-room locks serialize mutation, and every
//! timing rule is executed here with real clocks.
//!
//! # Architecture
//!
//! - one task accepts ingress connections, plus one reader task per
//!   connection feeding a single bounded queue
//! - one dispatcher task drains that queue into room state, the variable
//!   store, and the RPC router
//! - one broadcaster task ticks the adaptive fan-out, reaping as it goes
//! - the publish endpoint fans out through bounded per-subscriber queues,
//!   dropping at the high-water mark
//! - optional discovery beacon and admin HTTP tasks
//!
//! A single watch channel shuts everything down cooperatively; tasks still
//! running after a bounded drain are aborted.

#![forbid(unsafe_code)]

mod admin;
mod broadcaster;
mod config;
mod discovery;
mod error;
mod ingress;
mod rpc;
mod state;
mod transport;

use std::{net::SocketAddr, sync::Arc, time::Duration};

pub use admin::AdminState;
pub use broadcaster::Broadcaster;
pub use config::{Config, FileConfig, LogFormat, Overrides};
pub use discovery::{DISCOVERY_REQUEST, DiscoveryBeacon};
pub use error::ServerError;
pub use ingress::Dispatcher;
use roomcast_core::RelayCounters;
pub use rpc::{RpcRouter, ServerRpcSink};
pub use state::RoomDirectory;
use tokio::sync::{mpsc, watch};
pub use transport::{INGRESS_QUEUE_DEPTH, IngressListener, PUBLISH_HIGH_WATER_MARK, PubListener, PubSocket};

/// Bounded wait for in-flight work before tasks are aborted at shutdown.
pub const SHUTDOWN_DRAIN: Duration = Duration::from_millis(500);

/// Wall-clock seconds since the Unix epoch.
pub(crate) fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// A fully bound relay server, ready to run.
pub struct Server {
    config: Config,
    rooms: Arc<RoomDirectory>,
    counters: Arc<RelayCounters>,
    ingress: IngressListener,
    publish: PubListener,
    discovery: Option<DiscoveryBeacon>,
    admin: Option<tokio::net::TcpListener>,
    rpc_sink: Option<Arc<dyn ServerRpcSink>>,
}

impl Server {
    /// Bind every configured endpoint.
    ///
    /// Any bind failure is fatal: the caller gets the error before a single
    /// client can connect.
    pub async fn bind(config: Config) -> Result<Self, ServerError> {
        let counters = Arc::new(RelayCounters::new());
        let rooms = Arc::new(RoomDirectory::new(
            config.broadcast_min_period,
            config.broadcast_max_period,
        ));

        let ingress =
            IngressListener::bind(any_addr(config.dealer_port), Arc::clone(&counters)).await?;
        let publish =
            PubListener::bind(any_addr(config.pub_port), Arc::clone(&counters)).await?;

        let discovery = if config.enable_discovery {
            Some(
                DiscoveryBeacon::bind(
                    any_addr(config.discovery_port),
                    ingress.local_addr()?.port(),
                    publish.local_addr()?.port(),
                    &config.server_name,
                )
                .await?,
            )
        } else {
            None
        };

        let admin = if config.admin_enabled {
            let listener = tokio::net::TcpListener::bind(any_addr(config.admin_port))
                .await
                .map_err(|e| {
                    ServerError::Transport(format!("admin bind port {}: {e}", config.admin_port))
                })?;
            tracing::info!("admin interface bound to {}", listener.local_addr()?);
            Some(listener)
        } else {
            None
        };

        Ok(Self {
            config,
            rooms,
            counters,
            ingress,
            publish,
            discovery,
            admin,
            rpc_sink: None,
        })
    }

    /// Attach an in-process consumer for server-bound RPCs.
    #[must_use]
    pub fn with_rpc_sink(mut self, sink: Arc<dyn ServerRpcSink>) -> Self {
        self.rpc_sink = Some(sink);
        self
    }

    /// Address of the ingress endpoint.
    pub fn dealer_addr(&self) -> Result<SocketAddr, ServerError> {
        self.ingress.local_addr()
    }

    /// Address of the publish endpoint.
    pub fn pub_addr(&self) -> Result<SocketAddr, ServerError> {
        self.publish.local_addr()
    }

    /// Address of the discovery beacon, when enabled.
    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.discovery.as_ref().and_then(|beacon| beacon.local_addr().ok())
    }

    /// Address of the admin interface, when enabled.
    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin.as_ref().and_then(|listener| listener.local_addr().ok())
    }

    /// Shared room directory, mainly for tests and embedders.
    pub fn rooms(&self) -> Arc<RoomDirectory> {
        Arc::clone(&self.rooms)
    }

    /// Shared counters.
    pub fn counters(&self) -> Arc<RelayCounters> {
        Arc::clone(&self.counters)
    }

    /// Run until the shutdown signal flips, then drain and stop.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
        let Self { config, rooms, counters, ingress, publish, discovery, admin, rpc_sink } = self;

        let publisher = publish.socket();
        let mut rpc = RpcRouter::new(publisher.clone(), Arc::clone(&counters));
        if let Some(sink) = rpc_sink {
            rpc = rpc.with_sink(sink);
        }

        let (ingress_tx, ingress_rx) = mpsc::channel(INGRESS_QUEUE_DEPTH);
        let dispatcher = Dispatcher::new(Arc::clone(&rooms), Arc::clone(&counters), rpc);
        let broadcaster = Broadcaster::new(
            Arc::clone(&rooms),
            publisher,
            Arc::clone(&counters),
            config.inactivity_timeout,
            config.broadcast_min_period,
        );

        let mut tasks = vec![
            tokio::spawn(ingress.run(ingress_tx, shutdown.clone())),
            tokio::spawn(publish.run(shutdown.clone())),
            tokio::spawn(dispatcher.run(ingress_rx, shutdown.clone())),
            tokio::spawn(broadcaster.run(shutdown.clone())),
        ];
        if let Some(beacon) = discovery {
            tasks.push(tokio::spawn(beacon.run(shutdown.clone())));
        }
        if let Some(listener) = admin {
            let state = AdminState { rooms: Arc::clone(&rooms), counters: Arc::clone(&counters) };
            let admin_shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = admin::serve(listener, state, admin_shutdown).await {
                    tracing::error!("admin interface failed: {e}");
                }
            }));
        }

        tracing::info!(server_name = %config.server_name, "relay running");
        let _ = shutdown.changed().await;
        tracing::info!("shutting down");

        for mut task in tasks {
            if tokio::time::timeout(SHUTDOWN_DRAIN, &mut task).await.is_err() {
                task.abort();
            }
        }
        Ok(())
    }
}

fn any_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], port))
}
