//! Backend server descriptions and outbound connection handling.
//!
//! A [`BackendServer`] is an immutable, shareable description of one
//! routable destination: its domains, dial parameters, outbound connection
//! decorations and status personas. Instances are built once per
//! configuration generation and shared read-only by the routing table and
//! every connection processor.

use crate::config::ServerConfig;
use crate::protocol::{
    self, read_packet, write_packet, Handshake, MAX_PACKET_LEN, PACKET_ID_STATUS_RESPONSE,
    STATE_STATUS,
};
use crate::status::{StatusPayload, StatusResponder};
use crate::{ProxyError, Result};
use proxy_protocol::{version2, ProxyHeader};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::debug;

#[derive(Debug)]
pub struct BackendServer {
    id: String,
    domains: Vec<String>,
    address: String,
    proxy_bind: Option<IpAddr>,
    dial_timeout: Duration,
    send_proxy_protocol: bool,
    send_real_ip: bool,
    disconnect_message: String,
    status: StatusResponder,
}

impl BackendServer {
    pub fn from_config(id: &str, config: &ServerConfig) -> Result<Arc<Self>> {
        let proxy_bind = config
            .proxy_bind
            .as_deref()
            .map(|bind| {
                bind.parse::<IpAddr>().map_err(|_| {
                    ProxyError::config(format!("server '{id}' has invalid proxy_bind '{bind}'"))
                })
            })
            .transpose()?;

        Ok(Arc::new(Self {
            id: id.to_string(),
            domains: config.domains.clone(),
            address: config.address.clone(),
            proxy_bind,
            dial_timeout: Duration::from_millis(config.dial_timeout_ms),
            send_proxy_protocol: config.send_proxy_protocol,
            send_real_ip: config.send_real_ip,
            disconnect_message: config.disconnect_message.clone(),
            status: StatusResponder::from_config(&config.online_status, &config.offline_status)?,
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn send_proxy_protocol(&self) -> bool {
        self.send_proxy_protocol
    }

    pub fn send_real_ip(&self) -> bool {
        self.send_real_ip
    }

    pub fn disconnect_message(&self) -> &str {
        &self.disconnect_message
    }

    pub fn status(&self) -> &StatusResponder {
        &self.status
    }

    /// Open a connection to the backend within the configured dial timeout,
    /// binding the local egress address when one is configured.
    pub async fn dial(&self) -> Result<TcpStream> {
        let target = self.resolve_target().await?;

        let connect = async {
            let stream = match self.proxy_bind {
                Some(bind_ip) => {
                    let socket = match target {
                        SocketAddr::V4(_) => TcpSocket::new_v4(),
                        SocketAddr::V6(_) => TcpSocket::new_v6(),
                    }
                    .map_err(|e| self.dial_error(e))?;
                    socket
                        .bind(SocketAddr::new(bind_ip, 0))
                        .map_err(|e| self.dial_error(e))?;
                    socket.connect(target).await.map_err(|e| self.dial_error(e))?
                }
                None => TcpStream::connect(target)
                    .await
                    .map_err(|e| self.dial_error(e))?,
            };
            stream.set_nodelay(true).map_err(|e| self.dial_error(e))?;
            Ok(stream)
        };

        timeout(self.dial_timeout, connect)
            .await
            .map_err(|_| ProxyError::DialTimeout {
                server: self.id.clone(),
                timeout_ms: self.dial_timeout.as_millis() as u64,
            })?
    }

    /// Ask the backend for its live status over a short-lived connection.
    /// Any failure is returned to the caller, which degrades to the offline
    /// persona instead of surfacing a raw error to the client.
    pub async fn fetch_status(&self, protocol_version: i32) -> Result<StatusPayload> {
        let exchange = async {
            let mut stream = self.dial().await?;

            let (host, port) = self.split_address();
            let handshake = Handshake {
                protocol_version,
                server_address: host,
                server_port: port,
                next_state: STATE_STATUS,
            };
            write_packet(&mut stream, &handshake.encode()).await?;
            write_packet(&mut stream, &protocol::status_request_packet()).await?;

            let response = read_packet(&mut stream, MAX_PACKET_LEN).await?;
            if response.id != PACKET_ID_STATUS_RESPONSE {
                return Err(ProxyError::status(format!(
                    "unexpected packet id 0x{:02X} in status response",
                    response.id
                )));
            }
            let mut reader = protocol::Reader::new(&response.body);
            let json = reader.read_string(MAX_PACKET_LEN)?;
            StatusPayload::from_json(&json)
        };

        // The dial inside carries its own timeout; this one bounds the
        // status exchange as a whole.
        timeout(self.dial_timeout, exchange)
            .await
            .map_err(|_| ProxyError::status(format!("status fetch from '{}' timed out", self.id)))?
    }

    /// Encode a PROXY protocol v2 header carrying the original client
    /// address, written as the first bytes on the backend connection.
    pub fn proxy_protocol_header(
        &self,
        client_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Result<Vec<u8>> {
        let addresses = match (client_addr, local_addr) {
            (SocketAddr::V4(source), SocketAddr::V4(destination)) => {
                version2::ProxyAddresses::Ipv4 {
                    source,
                    destination,
                }
            }
            (SocketAddr::V6(source), SocketAddr::V6(destination)) => {
                version2::ProxyAddresses::Ipv6 {
                    source,
                    destination,
                }
            }
            // Mixed address families fall back to UNSPEC.
            _ => version2::ProxyAddresses::Unspec,
        };

        proxy_protocol::encode(ProxyHeader::Version2 {
            command: version2::ProxyCommand::Proxy,
            transport_protocol: version2::ProxyTransportProtocol::Stream,
            addresses,
        })
        .map(|buf| buf.to_vec())
        .map_err(|e| ProxyError::ProtocolHeader {
            reason: e.to_string(),
        })
    }

    async fn resolve_target(&self) -> Result<SocketAddr> {
        let mut addrs = lookup_host(&self.address)
            .await
            .map_err(|e| self.dial_error(e))?;
        addrs.next().ok_or_else(|| ProxyError::Dial {
            server: self.id.clone(),
            reason: format!("address '{}' resolved to nothing", self.address),
        })
    }

    fn split_address(&self) -> (String, u16) {
        match self.address.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().unwrap_or(25565);
                (host.to_string(), port)
            }
            None => (self.address.clone(), 25565),
        }
    }

    fn dial_error(&self, err: std::io::Error) -> ProxyError {
        debug!(server = %self.id, error = %err, "backend dial failed");
        ProxyError::Dial {
            server: self.id.clone(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OfflineStatusConfig;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn test_server(address: &str) -> Arc<BackendServer> {
        let config = ServerConfig {
            domains: vec!["play.example.com".to_string()],
            address: address.to_string(),
            proxy_bind: None,
            dial_timeout_ms: 500,
            send_proxy_protocol: false,
            send_real_ip: false,
            disconnect_message: "unreachable".to_string(),
            online_status: Default::default(),
            offline_status: OfflineStatusConfig {
                motd: "Maintenance".to_string(),
                ..Default::default()
            },
        };
        BackendServer::from_config("test", &config).unwrap()
    }

    #[tokio::test]
    async fn test_dial_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = test_server(&addr.to_string());
        let stream = server.dial().await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_dial_refused_is_dial_error() {
        // Bind then drop to get a port that refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let server = test_server(&addr.to_string());
        let err = server.dial().await.unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Dial { .. } | ProxyError::DialTimeout { .. }
        ));
    }

    #[tokio::test]
    async fn test_fetch_status_parses_backend_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // Consume handshake and status request.
            let _ = read_packet(&mut stream, MAX_PACKET_LEN).await.unwrap();
            let _ = read_packet(&mut stream, MAX_PACKET_LEN).await.unwrap();

            let json = r#"{"version":{"name":"1.20.4","protocol":765},"players":{"max":20,"online":3,"sample":[]},"description":{"text":"hi"}}"#;
            let packet = protocol::status_response_packet(json);
            stream.write_all(&packet.encode()).await.unwrap();
        });

        let server = test_server(&addr.to_string());
        let payload = server.fetch_status(765).await.unwrap();
        assert_eq!(payload.version.protocol, 765);
        assert_eq!(payload.players.online, 3);
        assert_eq!(payload.description.text, "hi");
    }

    #[test]
    fn test_proxy_protocol_header_v4() {
        let server = test_server("127.0.0.1:25566");
        let client: SocketAddr = "203.0.113.7:51234".parse().unwrap();
        let local: SocketAddr = "10.0.0.1:40000".parse().unwrap();
        let header = server.proxy_protocol_header(client, local).unwrap();
        // v2 signature bytes.
        assert_eq!(&header[..12], b"\r\n\r\n\x00\r\nQUIT\n");
    }

    #[test]
    fn test_split_address() {
        let server = test_server("mc.internal:25599");
        assert_eq!(server.split_address(), ("mc.internal".to_string(), 25599));
        let server = test_server("mc.internal");
        assert_eq!(server.split_address(), ("mc.internal".to_string(), 25565));
    }
}
