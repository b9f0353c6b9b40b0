//! Hostname-routing reverse proxy for Minecraft Java Edition.
//!
//! The crate accepts TCP connections on one or more gateways, reads the
//! protocol handshake to learn which hostname the client asked for, and
//! relays the connection to the backend server registered for that
//! hostname. Status queries can be answered locally with configured
//! personas, unreachable backends degrade to an offline status or a
//! disconnect message, and all of it is driven by a single declarative
//! configuration file.
//!
//! [`Proxy`] is the assembled system: it owns the gateways, the shared
//! worker pool and the event bus, and supports routing-table reload and
//! graceful shutdown.

pub mod config;
pub mod error;
pub mod event;
pub mod gateway;
pub mod metrics;
pub mod pool;
pub mod processor;
pub mod protocol;
pub mod routing;
pub mod server;
pub mod status;

pub use config::Config;
pub use error::{ProxyError, Result};
pub use event::{Event, EventBus, EventKind, Intent};

use gateway::Gateway;
use pool::ConnectionPool;
use processor::ConnectionProcessor;
use routing::RoutingTable;
use server::BackendServer;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// The assembled proxy: gateways, worker pool and event bus.
pub struct Proxy {
    gateways: HashMap<String, Arc<Gateway>>,
    pool: Arc<ConnectionPool>,
    events: EventBus,
}

impl Proxy {
    /// Build a proxy from a validated configuration. No sockets are bound
    /// until [`Proxy::start`].
    pub fn new(config: Config) -> Result<Self> {
        config
            .validate()
            .map_err(|e| ProxyError::config(e.to_string()))?;

        let events = EventBus::default();
        let processor = Arc::new(ConnectionProcessor::new(events.clone()));
        let pool = ConnectionPool::new(
            config.pool.workers,
            config.pool.effective_queue_size(),
            processor,
        );

        let mut gateways = HashMap::new();
        for (id, gateway_config) in &config.gateways {
            let table = build_table(&config, gateway_config)?;
            gateways.insert(
                id.clone(),
                Gateway::from_config(id, gateway_config, table)?,
            );
        }

        Ok(Self {
            gateways,
            pool,
            events,
        })
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let config =
            Config::load_from_file(path).map_err(|e| ProxyError::config(e.to_string()))?;
        Self::new(config)
    }

    /// Bind every gateway and start accepting. Fails fast: the first
    /// gateway that cannot bind aborts startup.
    pub async fn start(&self) -> Result<()> {
        for gateway in self.gateways.values() {
            gateway.start(Arc::clone(&self.pool)).await?;
        }
        info!(
            gateways = self.gateways.len(),
            workers = self.pool.worker_count(),
            "proxy started"
        );
        Ok(())
    }

    /// Apply a new configuration to the running proxy by swapping each
    /// gateway's routing table. Listener and pool shape changes need a
    /// restart; they are reported and skipped.
    pub fn reload(&self, config: Config) -> Result<()> {
        config
            .validate()
            .map_err(|e| ProxyError::config(e.to_string()))?;

        for (id, gateway_config) in &config.gateways {
            match self.gateways.get(id) {
                Some(gateway) => {
                    gateway.swap_routing_table(build_table(&config, gateway_config)?);
                }
                None => {
                    warn!(gateway = %id, "new gateway in config ignored; restart to add listeners");
                }
            }
        }
        for id in self.gateways.keys() {
            if !config.gateways.contains_key(id) {
                warn!(gateway = %id, "gateway removed from config keeps running; restart to drop it");
            }
        }
        info!("configuration reloaded");
        Ok(())
    }

    /// Stop accepting and shut the pool down. With `drain` set, queued and
    /// in-flight connections finish first; otherwise they are aborted.
    pub async fn shutdown(&self, drain: bool) {
        for gateway in self.gateways.values() {
            gateway.close();
        }
        self.pool.shutdown(drain).await;
        info!("proxy stopped");
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn gateway(&self, id: &str) -> Option<&Arc<Gateway>> {
        self.gateways.get(id)
    }
}

/// Build a gateway's routing table from the servers it references, in the
/// order the configuration lists them.
fn build_table(
    config: &Config,
    gateway_config: &config::GatewayConfig,
) -> Result<RoutingTable> {
    let mut servers = Vec::with_capacity(gateway_config.servers.len());
    for server_id in &gateway_config.servers {
        let server_config = config.servers.get(server_id).ok_or_else(|| {
            ProxyError::config(format!("unknown server '{server_id}' in gateway"))
        })?;
        servers.push(BackendServer::from_config(server_id, server_config)?);
    }
    Ok(RoutingTable::new(&servers))
}
