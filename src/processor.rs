//! Connection processing: handshake inspection, routing and relaying.
//!
//! Each pool worker hands a [`PendingConnection`] to the processor, which
//! reads the handshake within the gateway's client timeout, looks the
//! requested hostname up in the routing table, and then either relays the
//! connection to the matched backend, answers a status query locally, or
//! rejects with a disconnect message. Every failure is contained to the one
//! connection that caused it; the client always receives a crafted reply or
//! a clean close, never a raw transport error.

use crate::event::{Event, EventBus, EventKind, Intent};
use crate::pool::PendingConnection;
use crate::protocol::{
    self, read_packet, write_packet, Handshake, Packet, MAX_HANDSHAKE_LEN, MAX_PACKET_LEN,
    PACKET_ID_PING, PACKET_ID_STATUS_REQUEST,
};
use crate::server::BackendServer;
use crate::status::{not_found_payload, StatusPayload};
use crate::{ProxyError, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Metadata shared by all events of one connection.
struct SessionInfo {
    session_id: Uuid,
    gateway_id: String,
}

/// Stateless connection processor; one instance is shared by all workers.
pub struct ConnectionProcessor {
    events: EventBus,
}

impl ConnectionProcessor {
    pub fn new(events: EventBus) -> Self {
        Self { events }
    }

    /// Process one accepted connection to completion. Never returns an
    /// error: failures are logged, emitted as events and end with the
    /// connection closed.
    pub async fn process(&self, conn: PendingConnection) {
        let session = SessionInfo {
            session_id: conn.session_id,
            gateway_id: conn.gateway.id().to_string(),
        };

        metrics::counter!("hostgate_connections_total", 1);
        metrics::increment_gauge!("hostgate_connections_active", 1.0);

        let result = self.handle(conn).await;

        metrics::decrement_gauge!("hostgate_connections_active", 1.0);

        if let Err(e) = result {
            debug!(
                session_id = %session.session_id,
                error = %e,
                "connection rejected"
            );
            self.emit(&session, None, EventKind::Rejected {
                reason: e.kind().to_string(),
            });
        }
    }

    async fn handle(&self, mut conn: PendingConnection) -> Result<()> {
        let gateway = conn.gateway.clone();
        let client_timeout = gateway.client_timeout();
        let session = SessionInfo {
            session_id: conn.session_id,
            gateway_id: gateway.id().to_string(),
        };

        let packet = self
            .read_with_deadline(&mut conn.stream, MAX_HANDSHAKE_LEN, client_timeout)
            .await?;
        let handshake = Handshake::parse(&packet)?;

        // A trusted upstream hop may have decorated the handshake with the
        // original client address; recover it before routing.
        let (handshake, client_addr) = if gateway.receive_real_ip() {
            let (stripped, real_addr) = handshake.strip_real_ip();
            (stripped, real_addr.unwrap_or(conn.client_addr))
        } else {
            (handshake, conn.client_addr)
        };

        let domain = handshake.normalized_address();
        let server = gateway.routing_table().lookup(&domain);

        match server {
            None => {
                self.handle_no_route(&mut conn.stream, &gateway, &session, &handshake, &domain)
                    .await
            }
            Some(server) if handshake.is_status_request() => {
                self.serve_status(
                    &mut conn.stream,
                    &server,
                    &session,
                    &handshake,
                    &domain,
                    client_timeout,
                )
                .await
            }
            Some(server) => {
                self.relay_login(conn, server, session, handshake, domain, client_addr)
                    .await
            }
        }
    }

    /// Unmatched hostname: answer with the gateway's fallback status or
    /// disconnect message, then close. No backend is ever contacted.
    async fn handle_no_route(
        &self,
        stream: &mut TcpStream,
        gateway: &crate::gateway::Gateway,
        session: &SessionInfo,
        handshake: &Handshake,
        domain: &str,
    ) -> Result<()> {
        metrics::counter!("hostgate_no_route_total", 1);
        info!(
            gateway = %gateway.id(),
            domain = %domain,
            "no route for requested domain"
        );

        let intent = if handshake.is_status_request() {
            let payload = not_found_payload(gateway.server_not_found_message());
            // Best effort: a client that hangs up mid-reply changes nothing.
            let _ = self
                .answer_status(stream, &payload, gateway.client_timeout())
                .await;
            Intent::Status
        } else {
            let packet = protocol::disconnect_packet(gateway.server_not_found_message());
            let _ = write_packet(stream, &packet).await;
            Intent::Login
        };

        self.emit(session, None, EventKind::NoRoute {
            domain: domain.to_string(),
            intent,
        });
        Ok(())
    }

    /// Status query: relay the backend's live status with configured
    /// overrides applied, or degrade to the offline persona when the
    /// backend cannot be reached. The client never sees the dial error.
    async fn serve_status(
        &self,
        stream: &mut TcpStream,
        server: &Arc<BackendServer>,
        session: &SessionInfo,
        handshake: &Handshake,
        domain: &str,
        client_timeout: Duration,
    ) -> Result<()> {
        let (payload, online) = match server.fetch_status(handshake.protocol_version).await {
            Ok(live) => (server.status().online_payload(Some(&live)), true),
            Err(e) => {
                debug!(
                    server = %server.id(),
                    error = %e,
                    "live status fetch failed, serving offline persona"
                );
                (server.status().offline_payload(), false)
            }
        };

        self.answer_status(stream, &payload, client_timeout).await?;

        metrics::counter!("hostgate_status_served_total", 1,
            "outcome" => if online { "online" } else { "offline" });
        self.emit(
            session,
            Some(server.id().to_string()),
            EventKind::StatusServed {
                domain: domain.to_string(),
                online,
            },
        );
        Ok(())
    }

    /// Consume the client's status request, send the response and echo the
    /// latency ping.
    async fn answer_status(
        &self,
        stream: &mut TcpStream,
        payload: &StatusPayload,
        client_timeout: Duration,
    ) -> Result<()> {
        let request = self
            .read_with_deadline(stream, MAX_PACKET_LEN, client_timeout)
            .await?;
        if request.id != PACKET_ID_STATUS_REQUEST {
            return Err(ProxyError::malformed(format!(
                "expected status request, got packet id 0x{:02X}",
                request.id
            )));
        }

        let response = protocol::status_response_packet(&payload.to_json()?);
        write_packet(stream, &response).await?;

        // The client usually follows up with a ping carrying a timestamp
        // payload; echo it verbatim. A client that just hangs up is fine.
        match self
            .read_with_deadline(stream, MAX_PACKET_LEN, client_timeout)
            .await
        {
            Ok(ping) if ping.id == PACKET_ID_PING => {
                write_packet(stream, &ping).await?;
            }
            Ok(_) | Err(_) => {}
        }
        Ok(())
    }

    /// Login intent: dial the backend, replay the (possibly decorated)
    /// handshake and enter the bidirectional relay.
    async fn relay_login(
        &self,
        conn: PendingConnection,
        server: Arc<BackendServer>,
        session: SessionInfo,
        handshake: Handshake,
        domain: String,
        client_addr: SocketAddr,
    ) -> Result<()> {
        let mut client = conn.stream;

        let mut backend = match server.dial().await {
            Ok(stream) => stream,
            Err(e) => {
                // The client is still waiting on the open connection; give
                // it the configured disconnect message instead of a reset.
                warn!(
                    server = %server.id(),
                    error = %e,
                    "backend dial failed, disconnecting client"
                );
                let packet = protocol::disconnect_packet(server.disconnect_message());
                let _ = write_packet(&mut client, &packet).await;
                self.emit(
                    &session,
                    Some(server.id().to_string()),
                    EventKind::Rejected {
                        reason: e.kind().to_string(),
                    },
                );
                return Ok(());
            }
        };

        if let Err(e) = self
            .decorate_backend(&mut backend, &server, &handshake, client_addr)
            .await
        {
            warn!(
                server = %server.id(),
                error = %e,
                "failed to prepare backend connection"
            );
            let packet = protocol::disconnect_packet(server.disconnect_message());
            let _ = write_packet(&mut client, &packet).await;
            self.emit(
                &session,
                Some(server.id().to_string()),
                EventKind::Rejected {
                    reason: e.kind().to_string(),
                },
            );
            return Ok(());
        }

        info!(
            gateway = %session.gateway_id,
            server = %server.id(),
            domain = %domain,
            client = %client_addr,
            "relaying connection"
        );
        self.emit(
            &session,
            Some(server.id().to_string()),
            EventKind::Connected {
                domain: domain.clone(),
                client_addr,
            },
        );

        let start = Instant::now();
        let (client_to_server, server_to_client) = relay(client, backend).await;
        let duration = start.elapsed();

        metrics::counter!(
            "hostgate_bytes_transferred_total",
            client_to_server + server_to_client
        );
        info!(
            server = %server.id(),
            client_to_server,
            server_to_client,
            duration_ms = duration.as_millis() as u64,
            "relay ended"
        );
        self.emit(
            &session,
            Some(server.id().to_string()),
            EventKind::Disconnected {
                bytes_client_to_server: client_to_server,
                bytes_server_to_client: server_to_client,
                duration,
            },
        );
        Ok(())
    }

    /// Write the optional PROXY protocol header and replay the handshake,
    /// both reflecting the original client address.
    async fn decorate_backend(
        &self,
        backend: &mut TcpStream,
        server: &BackendServer,
        handshake: &Handshake,
        client_addr: SocketAddr,
    ) -> Result<()> {
        if server.send_proxy_protocol() {
            let local_addr = backend.local_addr()?;
            let header = server.proxy_protocol_header(client_addr, local_addr)?;
            backend.write_all(&header).await?;
        }

        let outbound = if server.send_real_ip() {
            handshake.with_real_ip(client_addr)
        } else {
            handshake.clone()
        };
        write_packet(backend, &outbound.encode()).await
    }

    async fn read_with_deadline(
        &self,
        stream: &mut TcpStream,
        max_len: usize,
        deadline: Duration,
    ) -> Result<Packet> {
        timeout(deadline, read_packet(stream, max_len))
            .await
            .map_err(|_| ProxyError::HandshakeTimeout {
                timeout_ms: deadline.as_millis() as u64,
            })?
    }

    fn emit(&self, session: &SessionInfo, server_id: Option<String>, kind: EventKind) {
        self.events.emit(Event {
            session_id: session.session_id,
            gateway_id: session.gateway_id.clone(),
            server_id,
            kind,
        });
    }
}

/// Bidirectional byte relay between client and backend.
///
/// Two copy directions run concurrently; when either side closes or errors
/// the other direction is dropped, which closes both sockets promptly.
/// Returns the byte counts (client->server, server->client).
async fn relay(client: TcpStream, backend: TcpStream) -> (u64, u64) {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut backend_read, mut backend_write) = backend.into_split();

    let client_to_server = AtomicU64::new(0);
    let server_to_client = AtomicU64::new(0);

    tokio::select! {
        _ = copy_stream(&mut client_read, &mut backend_write, &client_to_server) => {
            debug!("client -> backend stream ended");
        }
        _ = copy_stream(&mut backend_read, &mut client_write, &server_to_client) => {
            debug!("backend -> client stream ended");
        }
    }

    (
        client_to_server.load(Ordering::Relaxed),
        server_to_client.load(Ordering::Relaxed),
    )
}

/// Copy bytes in one direction, tracking the running total so the final
/// counts survive the other direction winning the relay select.
async fn copy_stream<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64)
where
    R: AsyncReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    let mut buffer = vec![0u8; 8192];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => break, // EOF
            Ok(n) => {
                if writer.write_all(&buffer[..n]).await.is_err() {
                    break;
                }
                counter.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => {
                debug!(error = %e, "relay read failed");
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, OfflineStatusConfig, ServerConfig};
    use crate::gateway::Gateway;
    use crate::protocol::{STATE_LOGIN, STATE_STATUS};
    use crate::routing::RoutingTable;
    use tokio::net::TcpListener;

    fn server_config(address: &str) -> ServerConfig {
        ServerConfig {
            domains: vec!["a.example.com".to_string()],
            address: address.to_string(),
            proxy_bind: None,
            dial_timeout_ms: 500,
            send_proxy_protocol: false,
            send_real_ip: false,
            disconnect_message: "backend down".to_string(),
            online_status: Default::default(),
            offline_status: OfflineStatusConfig {
                motd: "Maintenance".to_string(),
                ..Default::default()
            },
        }
    }

    fn gateway_with(servers: Vec<Arc<BackendServer>>) -> Arc<Gateway> {
        let config = GatewayConfig {
            binds: vec!["127.0.0.1:0".to_string()],
            receive_proxy_protocol: false,
            receive_real_ip: false,
            client_timeout_ms: 1000,
            servers: servers.iter().map(|s| s.id().to_string()).collect(),
            server_not_found_message: "There is no server with that address.".to_string(),
        };
        Gateway::from_config("default", &config, RoutingTable::new(&servers)).unwrap()
    }

    /// Run the processor against the server side of a loopback pair and
    /// return the client side.
    async fn process_connection(gateway: Arc<Gateway>) -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_side, peer) = listener.accept().await.unwrap();

        let conn = PendingConnection::new(server_side, peer, gateway);
        tokio::spawn(async move {
            ConnectionProcessor::new(EventBus::new(16)).process(conn).await;
        });
        client
    }

    fn handshake(address: &str, next_state: i32) -> Handshake {
        Handshake {
            protocol_version: 765,
            server_address: address.to_string(),
            server_port: 25565,
            next_state,
        }
    }

    #[tokio::test]
    async fn test_mixed_case_host_routes_to_backend() {
        // Backend that records the replayed handshake.
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        let received = tokio::spawn(async move {
            let (mut stream, _) = backend.accept().await.unwrap();
            read_packet(&mut stream, MAX_HANDSHAKE_LEN).await.unwrap()
        });

        let server =
            BackendServer::from_config("a", &server_config(&backend_addr.to_string())).unwrap();
        let gateway = gateway_with(vec![server]);

        let mut client = process_connection(gateway).await;
        let hs = handshake("A.Example.Com.", STATE_LOGIN);
        client.write_all(&hs.encode().encode()).await.unwrap();

        let replayed = tokio::time::timeout(Duration::from_secs(2), received)
            .await
            .expect("backend never contacted")
            .unwrap();
        let replayed = Handshake::parse(&replayed).unwrap();
        // Replayed verbatim, not normalized.
        assert_eq!(replayed.server_address, "A.Example.Com.");
    }

    #[tokio::test]
    async fn test_offline_persona_served_when_backend_down() {
        // Reserve an address that refuses connections.
        let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = reserved.local_addr().unwrap();
        drop(reserved);

        let server =
            BackendServer::from_config("a", &server_config(&dead_addr.to_string())).unwrap();
        let gateway = gateway_with(vec![server]);

        let mut client = process_connection(gateway).await;
        let hs = handshake("a.example.com", STATE_STATUS);
        client.write_all(&hs.encode().encode()).await.unwrap();
        client
            .write_all(&protocol::status_request_packet().encode())
            .await
            .unwrap();

        let response = read_packet(&mut client, MAX_PACKET_LEN).await.unwrap();
        let mut reader = protocol::Reader::new(&response.body);
        let payload = StatusPayload::from_json(&reader.read_string(MAX_PACKET_LEN).unwrap()).unwrap();
        assert_eq!(payload.description.text, "Maintenance");
        assert_eq!(payload.players.max, 0);
        assert_eq!(payload.players.online, 0);
    }

    #[tokio::test]
    async fn test_status_ping_is_echoed() {
        let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = reserved.local_addr().unwrap();
        drop(reserved);

        let server =
            BackendServer::from_config("a", &server_config(&dead_addr.to_string())).unwrap();
        let gateway = gateway_with(vec![server]);

        let mut client = process_connection(gateway).await;
        let hs = handshake("a.example.com", STATE_STATUS);
        client.write_all(&hs.encode().encode()).await.unwrap();
        client
            .write_all(&protocol::status_request_packet().encode())
            .await
            .unwrap();
        let _ = read_packet(&mut client, MAX_PACKET_LEN).await.unwrap();

        let ping = Packet::new(PACKET_ID_PING, 7i64.to_be_bytes().to_vec());
        client.write_all(&ping.encode()).await.unwrap();
        let pong = read_packet(&mut client, MAX_PACKET_LEN).await.unwrap();
        assert_eq!(pong, ping);
    }

    #[tokio::test]
    async fn test_unknown_domain_login_gets_not_found_disconnect() {
        let gateway = gateway_with(vec![]);

        let mut client = process_connection(gateway).await;
        let hs = handshake("c.example.com", STATE_LOGIN);
        client.write_all(&hs.encode().encode()).await.unwrap();

        let disconnect = tokio::time::timeout(
            Duration::from_secs(1),
            read_packet(&mut client, MAX_PACKET_LEN),
        )
        .await
        .expect("no disconnect within client timeout")
        .unwrap();
        let mut reader = protocol::Reader::new(&disconnect.body);
        let chat: serde_json::Value =
            serde_json::from_str(&reader.read_string(MAX_PACKET_LEN).unwrap()).unwrap();
        assert_eq!(chat["text"], "There is no server with that address.");

        // The socket closes cleanly afterwards.
        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_relay_preserves_bytes_in_both_directions() {
        // Echo backend: replays the handshake read, then echoes raw bytes.
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = backend.accept().await.unwrap();
            let _ = read_packet(&mut stream, MAX_HANDSHAKE_LEN).await.unwrap();
            let mut buf = vec![0u8; 4096];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let server =
            BackendServer::from_config("a", &server_config(&backend_addr.to_string())).unwrap();
        let gateway = gateway_with(vec![server]);

        let mut client = process_connection(gateway).await;
        let hs = handshake("a.example.com", STATE_LOGIN);
        client.write_all(&hs.encode().encode()).await.unwrap();

        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        client.write_all(&payload).await.unwrap();

        let mut echoed = vec![0u8; payload.len()];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload);
    }

    #[tokio::test]
    async fn test_dial_failure_on_login_sends_disconnect_message() {
        let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = reserved.local_addr().unwrap();
        drop(reserved);

        let server =
            BackendServer::from_config("a", &server_config(&dead_addr.to_string())).unwrap();
        let gateway = gateway_with(vec![server]);

        let mut client = process_connection(gateway).await;
        let hs = handshake("a.example.com", STATE_LOGIN);
        client.write_all(&hs.encode().encode()).await.unwrap();

        let disconnect = read_packet(&mut client, MAX_PACKET_LEN).await.unwrap();
        let mut reader = protocol::Reader::new(&disconnect.body);
        let chat: serde_json::Value =
            serde_json::from_str(&reader.read_string(MAX_PACKET_LEN).unwrap()).unwrap();
        assert_eq!(chat["text"], "backend down");
    }
}
