//! Minecraft Java Edition wire protocol primitives.
//!
//! This module implements the small slice of the protocol the gateway needs
//! to route connections: VarInt coding, length-prefixed packet framing, the
//! handshake packet, and the status/login packets exchanged before a
//! connection is either relayed to a backend or answered locally.

use crate::{ProxyError, Result};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted length for any frame read before routing.
pub const MAX_PACKET_LEN: usize = 65535;
/// Maximum accepted length for the handshake frame body.
pub const MAX_HANDSHAKE_LEN: usize = 1024;
/// Maximum length of the server address string in a handshake.
pub const MAX_SERVER_ADDRESS_LEN: usize = 255;

/// Packet id shared by handshake, status request/response and login disconnect.
pub const PACKET_ID_HANDSHAKE: i32 = 0x00;
pub const PACKET_ID_STATUS_REQUEST: i32 = 0x00;
pub const PACKET_ID_STATUS_RESPONSE: i32 = 0x00;
pub const PACKET_ID_PING: i32 = 0x01;
pub const PACKET_ID_LOGIN_DISCONNECT: i32 = 0x00;

/// Handshake next-state indicating a status query.
pub const STATE_STATUS: i32 = 1;
/// Handshake next-state indicating login/play intent.
pub const STATE_LOGIN: i32 = 2;

/// Separator used by the real-IP handshake decoration
/// (`<host>///<client addr>///<unix seconds>`).
const REAL_IP_SEPARATOR: &str = "///";

/// A single length-framed protocol packet: id plus raw body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub body: Vec<u8>,
}

impl Packet {
    pub fn new(id: i32, body: Vec<u8>) -> Self {
        Self { id, body }
    }

    /// Encode the packet as it appears on the wire: a VarInt length prefix
    /// followed by the VarInt id and the body.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.body.len() + 5);
        write_varint(&mut payload, self.id);
        payload.extend_from_slice(&self.body);

        let mut frame = Vec::with_capacity(payload.len() + 5);
        write_varint(&mut frame, payload.len() as i32);
        frame.extend_from_slice(&payload);
        frame
    }
}

/// Read one framed packet from the stream, rejecting frames larger than
/// `max_len`.
pub async fn read_packet<R>(reader: &mut R, max_len: usize) -> Result<Packet>
where
    R: AsyncRead + Unpin,
{
    let len = read_varint_async(reader).await?;
    if len <= 0 || len as usize > max_len {
        return Err(ProxyError::malformed(format!(
            "invalid frame length {len} (max {max_len})"
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| ProxyError::malformed(format!("truncated frame: {e}")))?;

    let mut cursor = Reader::new(&payload);
    let id = cursor.read_varint()?;
    Ok(Packet::new(id, cursor.remaining().to_vec()))
}

/// Write one framed packet and flush it.
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&packet.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a VarInt directly off a stream, one byte at a time.
pub async fn read_varint_async<R>(reader: &mut R) -> Result<i32>
where
    R: AsyncRead + Unpin,
{
    let mut result: i32 = 0;
    for shift in 0..5 {
        let byte = reader
            .read_u8()
            .await
            .map_err(|e| ProxyError::malformed(format!("truncated varint: {e}")))?;
        result |= ((byte & 0x7F) as i32) << (7 * shift);
        if byte & 0x80 == 0 {
            return Ok(result);
        }
    }
    Err(ProxyError::malformed("varint exceeds 5 bytes"))
}

/// Append a VarInt to a buffer.
pub fn write_varint(buf: &mut Vec<u8>, value: i32) {
    let mut value = value as u32;
    loop {
        if value & !0x7F == 0 {
            buf.push(value as u8);
            return;
        }
        buf.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
}

/// Append a length-prefixed UTF-8 string to a buffer.
pub fn write_string(buf: &mut Vec<u8>, value: &str) {
    write_varint(buf, value.len() as i32);
    buf.extend_from_slice(value.as_bytes());
}

/// Cursor for decoding packet bodies from a byte slice.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn read_varint(&mut self) -> Result<i32> {
        let mut result: i32 = 0;
        for shift in 0..5 {
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or_else(|| ProxyError::malformed("truncated varint"))?;
            self.pos += 1;
            result |= ((byte & 0x7F) as i32) << (7 * shift);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(ProxyError::malformed("varint exceeds 5 bytes"))
    }

    pub fn read_string(&mut self, max_len: usize) -> Result<String> {
        let len = self.read_varint()?;
        if len < 0 || len as usize > max_len {
            return Err(ProxyError::malformed(format!(
                "string length {len} out of bounds (max {max_len})"
            )));
        }
        let end = self.pos + len as usize;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| ProxyError::malformed("truncated string"))?;
        self.pos = end;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ProxyError::malformed("string is not valid UTF-8"))
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let end = self.pos + 2;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| ProxyError::malformed("truncated u16"))?;
        self.pos = end;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

/// The first packet a client sends: target address, port and intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub next_state: i32,
}

impl Handshake {
    /// Decode a handshake from a framed packet.
    pub fn parse(packet: &Packet) -> Result<Self> {
        if packet.id != PACKET_ID_HANDSHAKE {
            return Err(ProxyError::malformed(format!(
                "expected handshake packet id 0x00, got 0x{:02X}",
                packet.id
            )));
        }

        let mut reader = Reader::new(&packet.body);
        let protocol_version = reader.read_varint()?;
        // The address field may carry real-IP or mod-loader decorations and
        // can exceed the nominal 255-character cap; bound it by the frame cap.
        let server_address = reader.read_string(MAX_HANDSHAKE_LEN)?;
        let server_port = reader.read_u16()?;
        let next_state = reader.read_varint()?;

        if next_state != STATE_STATUS && next_state != STATE_LOGIN {
            return Err(ProxyError::malformed(format!(
                "invalid next state {next_state}"
            )));
        }

        Ok(Self {
            protocol_version,
            server_address,
            server_port,
            next_state,
        })
    }

    /// Re-encode the handshake as a framed packet.
    pub fn encode(&self) -> Packet {
        let mut body = Vec::with_capacity(self.server_address.len() + 8);
        write_varint(&mut body, self.protocol_version);
        write_string(&mut body, &self.server_address);
        body.extend_from_slice(&self.server_port.to_be_bytes());
        write_varint(&mut body, self.next_state);
        Packet::new(PACKET_ID_HANDSHAKE, body)
    }

    pub fn is_status_request(&self) -> bool {
        self.next_state == STATE_STATUS
    }

    pub fn is_login_request(&self) -> bool {
        self.next_state == STATE_LOGIN
    }

    /// The requested hostname, normalized for routing lookup.
    pub fn normalized_address(&self) -> String {
        normalize_domain(&self.server_address)
    }

    /// Rewrite the address field with a real-IP decoration carrying the
    /// original client address (`<host>///<client addr>///<unix seconds>`).
    pub fn with_real_ip(&self, client_addr: std::net::SocketAddr) -> Self {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut decorated = self.clone();
        decorated.server_address = format!(
            "{}{REAL_IP_SEPARATOR}{}{REAL_IP_SEPARATOR}{}",
            self.server_address, client_addr, ts
        );
        decorated
    }

    /// Extract a real-IP decoration left by an upstream hop, returning the
    /// undecorated handshake and the original client address when present.
    pub fn strip_real_ip(&self) -> (Self, Option<std::net::SocketAddr>) {
        let mut parts = self.server_address.split(REAL_IP_SEPARATOR);
        let host = match parts.next() {
            Some(h) => h,
            None => return (self.clone(), None),
        };
        let addr = parts.next().and_then(|a| a.parse().ok());
        if addr.is_none() {
            return (self.clone(), None);
        }
        let mut stripped = self.clone();
        stripped.server_address = host.to_string();
        (stripped, addr)
    }
}

/// Normalize a requested hostname for routing lookup: drop mod-loader
/// suffixes after a NUL marker, strip a trailing dot, and lowercase.
pub fn normalize_domain(raw: &str) -> String {
    let host = raw.split('\0').next().unwrap_or("");
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Build a login-state disconnect packet with a JSON chat message.
pub fn disconnect_packet(message: &str) -> Packet {
    let chat = serde_json::json!({ "text": message }).to_string();
    let mut body = Vec::with_capacity(chat.len() + 5);
    write_string(&mut body, &chat);
    Packet::new(PACKET_ID_LOGIN_DISCONNECT, body)
}

/// Build a status-state response packet from a JSON payload.
pub fn status_response_packet(json: &str) -> Packet {
    let mut body = Vec::with_capacity(json.len() + 5);
    write_string(&mut body, json);
    Packet::new(PACKET_ID_STATUS_RESPONSE, body)
}

/// The empty status request packet.
pub fn status_request_packet() -> Packet {
    Packet::new(PACKET_ID_STATUS_REQUEST, Vec::new())
}
