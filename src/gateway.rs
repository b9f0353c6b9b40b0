//! Listener gateways.
//!
//! A gateway owns a set of TCP listeners and the routing table for the
//! servers behind them. Binding is all-or-nothing: if any listen address is
//! unavailable the gateway fails to start and holds no sockets. Accepted
//! connections are handed to the shared [`ConnectionPool`]; when the pool's
//! queue is full the accept loop blocks, which is the intended backpressure
//! on the listen backlog.

use crate::pool::{ConnectionPool, PendingConnection};
use crate::routing::RoutingTable;
use crate::{ProxyError, Result};
use arc_swap::ArcSwap;
use bytes::Bytes;
use proxy_protocol::{version1, version2, ProxyHeader};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Signature opening every PROXY protocol v2 header.
const PROXY_V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];
/// Maximum size of a PROXY protocol v1 line, including the CRLF.
const PROXY_V1_MAX_LEN: usize = 107;

#[derive(Debug)]
pub struct Gateway {
    id: String,
    binds: Vec<SocketAddr>,
    receive_proxy_protocol: bool,
    receive_real_ip: bool,
    client_timeout: Duration,
    server_not_found_message: String,
    table: ArcSwap<RoutingTable>,
    shutdown_tx: broadcast::Sender<()>,
    /// Addresses actually bound, resolved after `start`. Differs from
    /// `binds` when a port 0 wildcard was configured.
    bound_addrs: Mutex<Vec<SocketAddr>>,
}

impl Gateway {
    pub fn from_config(
        id: &str,
        config: &crate::config::GatewayConfig,
        table: RoutingTable,
    ) -> Result<Arc<Self>> {
        let mut binds = Vec::with_capacity(config.binds.len());
        for bind in &config.binds {
            let addr: SocketAddr = bind.parse().map_err(|_| {
                ProxyError::config(format!("gateway '{id}' has invalid bind address '{bind}'"))
            })?;
            binds.push(addr);
        }
        if binds.is_empty() {
            return Err(ProxyError::config(format!(
                "gateway '{id}' has no bind addresses"
            )));
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Arc::new(Self {
            id: id.to_string(),
            binds,
            receive_proxy_protocol: config.receive_proxy_protocol,
            receive_real_ip: config.receive_real_ip,
            client_timeout: Duration::from_millis(config.client_timeout_ms),
            server_not_found_message: config.server_not_found_message.clone(),
            table: ArcSwap::from_pointee(table),
            shutdown_tx,
            bound_addrs: Mutex::new(Vec::new()),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn receive_real_ip(&self) -> bool {
        self.receive_real_ip
    }

    pub fn client_timeout(&self) -> Duration {
        self.client_timeout
    }

    pub fn server_not_found_message(&self) -> &str {
        &self.server_not_found_message
    }

    /// Current routing table snapshot. Lookups on the returned guard are
    /// lock-free; a concurrent swap does not affect it.
    pub fn routing_table(&self) -> arc_swap::Guard<Arc<RoutingTable>> {
        self.table.load()
    }

    /// Publish a new routing table. In-flight connections keep the snapshot
    /// they already resolved against.
    pub fn swap_routing_table(&self, table: RoutingTable) {
        info!(gateway = %self.id, routes = table.len(), "routing table updated");
        self.table.store(Arc::new(table));
    }

    /// Addresses this gateway is actually listening on, once started.
    pub fn bound_addrs(&self) -> Vec<SocketAddr> {
        self.bound_addrs.lock().map(|a| a.clone()).unwrap_or_default()
    }

    /// Bind every listen address, then run one accept loop per listener.
    /// A single failed bind aborts the whole gateway with no sockets held.
    pub async fn start(self: &Arc<Self>, pool: Arc<ConnectionPool>) -> Result<()> {
        let mut listeners = Vec::with_capacity(self.binds.len());
        for addr in &self.binds {
            let listener = TcpListener::bind(addr).await.map_err(|e| ProxyError::Bind {
                address: addr.to_string(),
                reason: e.to_string(),
            })?;
            listeners.push(listener);
        }

        let mut bound = Vec::with_capacity(listeners.len());
        for listener in &listeners {
            bound.push(listener.local_addr()?);
        }
        if let Ok(mut slot) = self.bound_addrs.lock() {
            *slot = bound.clone();
        }
        info!(gateway = %self.id, addrs = ?bound, "gateway listening");

        for listener in listeners {
            let gateway = Arc::clone(self);
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                gateway.accept_loop(listener, pool).await;
            });
        }
        Ok(())
    }

    /// Stop accepting new connections. Connections already handed to the
    /// pool keep running.
    pub fn close(&self) {
        debug!(gateway = %self.id, "closing listeners");
        let _ = self.shutdown_tx.send(());
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, pool: Arc<ConnectionPool>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(gateway = %self.id, error = %e, "accept failed");
                            continue;
                        }
                    };
                    // Submitting may block on a full queue; that is the
                    // backpressure that keeps excess load in the backlog.
                    match self.admit(stream, peer_addr, &pool).await {
                        Ok(()) => {}
                        Err(ProxyError::PoolClosed) => {
                            info!(gateway = %self.id, "pool closed, stopping accept loop");
                            break;
                        }
                        Err(e) => {
                            debug!(gateway = %self.id, client = %peer_addr, error = %e,
                                "connection dropped before submission");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!(gateway = %self.id, "accept loop stopped");
                    break;
                }
            }
        }
    }

    async fn admit(
        self: &Arc<Self>,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        pool: &ConnectionPool,
    ) -> Result<()> {
        metrics::counter!("hostgate_accepted_total", 1, "gateway" => self.id.clone());
        let _ = stream.set_nodelay(true);

        let client_addr = if self.receive_proxy_protocol {
            let source = timeout(self.client_timeout, read_proxy_header(&mut stream))
                .await
                .map_err(|_| ProxyError::HandshakeTimeout {
                    timeout_ms: self.client_timeout.as_millis() as u64,
                })??;
            source.unwrap_or(peer_addr)
        } else {
            peer_addr
        };

        let conn = PendingConnection::new(stream, client_addr, Arc::clone(self));
        pool.submit(conn).await
    }
}

/// Read and parse a leading PROXY protocol header (v1 or v2), returning the
/// advertised source address. `None` means the header carried no usable
/// address (v1 UNKNOWN, v2 LOCAL/UNSPEC) and the socket peer should be used.
async fn read_proxy_header(stream: &mut TcpStream) -> Result<Option<SocketAddr>> {
    let mut prefix = [0u8; 12];
    stream
        .read_exact(&mut prefix)
        .await
        .map_err(|e| ProxyError::ProtocolHeader {
            reason: format!("truncated header: {e}"),
        })?;

    let raw = if prefix == PROXY_V2_SIGNATURE {
        // Version and command, family, then the 16-bit payload length.
        let mut fixed = [0u8; 4];
        stream
            .read_exact(&mut fixed)
            .await
            .map_err(|e| ProxyError::ProtocolHeader {
                reason: format!("truncated v2 header: {e}"),
            })?;
        let payload_len = u16::from_be_bytes([fixed[2], fixed[3]]) as usize;
        let mut payload = vec![0u8; payload_len];
        stream
            .read_exact(&mut payload)
            .await
            .map_err(|e| ProxyError::ProtocolHeader {
                reason: format!("truncated v2 payload: {e}"),
            })?;

        let mut raw = Vec::with_capacity(16 + payload_len);
        raw.extend_from_slice(&prefix);
        raw.extend_from_slice(&fixed);
        raw.extend_from_slice(&payload);
        raw
    } else if prefix.starts_with(b"PROXY ") {
        let mut raw = prefix.to_vec();
        while !raw.ends_with(b"\r\n") {
            if raw.len() >= PROXY_V1_MAX_LEN {
                return Err(ProxyError::ProtocolHeader {
                    reason: "v1 header exceeds 107 bytes".to_string(),
                });
            }
            let byte = stream
                .read_u8()
                .await
                .map_err(|e| ProxyError::ProtocolHeader {
                    reason: format!("truncated v1 header: {e}"),
                })?;
            raw.push(byte);
        }
        raw
    } else {
        return Err(ProxyError::ProtocolHeader {
            reason: "connection does not start with a PROXY protocol header".to_string(),
        });
    };

    let mut buf = Bytes::from(raw);
    let header = proxy_protocol::parse(&mut buf).map_err(|e| ProxyError::ProtocolHeader {
        reason: e.to_string(),
    })?;

    Ok(match header {
        ProxyHeader::Version1 {
            addresses: version1::ProxyAddresses::Ipv4 { source, .. },
            ..
        } => Some(SocketAddr::V4(source)),
        ProxyHeader::Version1 {
            addresses: version1::ProxyAddresses::Ipv6 { source, .. },
            ..
        } => Some(SocketAddr::V6(source)),
        ProxyHeader::Version2 {
            addresses: version2::ProxyAddresses::Ipv4 { source, .. },
            ..
        } => Some(SocketAddr::V4(source)),
        ProxyHeader::Version2 {
            addresses: version2::ProxyAddresses::Ipv6 { source, .. },
            ..
        } => Some(SocketAddr::V6(source)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn gateway_config(binds: Vec<String>) -> crate::config::GatewayConfig {
        crate::config::GatewayConfig {
            binds,
            receive_proxy_protocol: false,
            receive_real_ip: false,
            client_timeout_ms: 1000,
            servers: vec![],
            server_not_found_message: "no server".to_string(),
        }
    }

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        (client, server_side)
    }

    #[test]
    fn test_invalid_bind_address_rejected() {
        let err = Gateway::from_config(
            "default",
            &gateway_config(vec!["not-an-addr".to_string()]),
            RoutingTable::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[tokio::test]
    async fn test_proxy_v1_header_yields_source_address() {
        let (mut client, mut server_side) = loopback_pair().await;
        client
            .write_all(b"PROXY TCP4 203.0.113.7 10.0.0.1 51234 25565\r\n")
            .await
            .unwrap();

        let source = read_proxy_header(&mut server_side).await.unwrap();
        assert_eq!(source, Some("203.0.113.7:51234".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_proxy_v2_header_yields_source_address() {
        let (mut client, mut server_side) = loopback_pair().await;
        let header = proxy_protocol::encode(ProxyHeader::Version2 {
            command: version2::ProxyCommand::Proxy,
            transport_protocol: version2::ProxyTransportProtocol::Stream,
            addresses: version2::ProxyAddresses::Ipv4 {
                source: "203.0.113.7:51234".parse().unwrap(),
                destination: "10.0.0.1:25565".parse().unwrap(),
            },
        })
        .unwrap();
        client.write_all(&header).await.unwrap();

        let source = read_proxy_header(&mut server_side).await.unwrap();
        assert_eq!(source, Some("203.0.113.7:51234".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_missing_proxy_header_rejected() {
        let (mut client, mut server_side) = loopback_pair().await;
        client.write_all(b"\x10\x00not a proxy head").await.unwrap();

        let err = read_proxy_header(&mut server_side).await.unwrap_err();
        assert_eq!(err.kind(), "proxy_protocol_header");
    }

    #[tokio::test]
    async fn test_swap_routing_table_changes_lookups() {
        let gateway = Gateway::from_config(
            "default",
            &gateway_config(vec!["127.0.0.1:0".to_string()]),
            RoutingTable::default(),
        )
        .unwrap();
        assert!(gateway.routing_table().lookup("a.example.com").is_none());

        let server = crate::server::BackendServer::from_config(
            "a",
            &crate::config::ServerConfig {
                domains: vec!["a.example.com".to_string()],
                address: "127.0.0.1:25566".to_string(),
                proxy_bind: None,
                dial_timeout_ms: 500,
                send_proxy_protocol: false,
                send_real_ip: false,
                disconnect_message: "down".to_string(),
                online_status: Default::default(),
                offline_status: Default::default(),
            },
        )
        .unwrap();
        gateway.swap_routing_table(RoutingTable::new(&[server]));
        assert!(gateway.routing_table().lookup("a.example.com").is_some());
    }
}
