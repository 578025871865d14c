//! Game query protocols behind the health probe
//!
//! A server counts as healthy only when it answers its game's status
//! request. An accepted TCP connection is not enough: the kernel completes
//! the handshake into the listen backlog even when the game process hangs.

use crate::health::QueryProbe;
use async_trait::async_trait;
use ssm_foundation::{Error, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Probe ids this crate speaks
pub const MINECRAFT: &str = "minecraft";

/// -1 asks the server to report its own protocol version
const SLP_PROTOCOL_VERSION: i32 = -1;
const SLP_NEXT_STATE_STATUS: i32 = 1;
const SLP_PACKET_ID: i32 = 0x00;

const VARINT_MAX_BYTES: u32 = 5;
const MAX_PACKET_BYTES: usize = 1 << 20;

// ============================================================================
// GameQueryProbe
// ============================================================================

/// Probe speaking each game's own status protocol
pub struct GameQueryProbe {
    timeout: Duration,
}

impl GameQueryProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl QueryProbe for GameQueryProbe {
    fn name(&self) -> &'static str {
        "game-query"
    }

    fn supports(&self, protocol: &str) -> bool {
        protocol == MINECRAFT
    }

    async fn query(&self, protocol: &str, host: &str, port: u16) -> Result<()> {
        if !self.supports(protocol) {
            return Err(Error::Internal(format!("unsupported query protocol: {}", protocol)));
        }
        match timeout(self.timeout, minecraft_status(host, port)).await {
            Ok(status) => status.map(|_| ()),
            Err(_) => Err(Error::Timeout(format!(
                "{} query on {}:{} unanswered after {}ms",
                protocol,
                host,
                port,
                self.timeout.as_millis()
            ))),
        }
    }
}

// ============================================================================
// Minecraft server-list ping
// ============================================================================

/// Send a handshake plus status request and return the status document
pub async fn minecraft_status(host: &str, port: u16) -> Result<serde_json::Value> {
    let mut stream = TcpStream::connect((host, port)).await?;
    stream.write_all(&status_request(host, port)).await?;
    stream.flush().await?;

    let packet = read_packet(&mut stream).await?;
    let mut body = packet.as_slice();
    let id = read_varint(&mut body).await?;
    if id != SLP_PACKET_ID {
        return Err(Error::Internal(format!("unexpected status packet id {:#x}", id)));
    }
    let len = read_len(&mut body).await?;
    if len > body.len() {
        return Err(Error::Internal("status string overruns packet".to_string()));
    }
    Ok(serde_json::from_slice(&body[..len])?)
}

/// Handshake (next state: status) followed by an empty status request
fn status_request(host: &str, port: u16) -> Vec<u8> {
    let mut handshake = Vec::new();
    write_varint(&mut handshake, SLP_PACKET_ID);
    write_varint(&mut handshake, SLP_PROTOCOL_VERSION);
    write_string(&mut handshake, host);
    handshake.extend_from_slice(&port.to_be_bytes());
    write_varint(&mut handshake, SLP_NEXT_STATE_STATUS);

    let mut status = Vec::new();
    write_varint(&mut status, SLP_PACKET_ID);

    let mut request = Vec::new();
    write_packet(&mut request, &handshake);
    write_packet(&mut request, &status);
    request
}

fn write_packet(out: &mut Vec<u8>, body: &[u8]) {
    write_varint(out, body.len() as i32);
    out.extend_from_slice(body);
}

fn write_string(out: &mut Vec<u8>, value: &str) {
    write_varint(out, value.len() as i32);
    out.extend_from_slice(value.as_bytes());
}

/// LEB128 over the two's-complement bits; negatives take five bytes
fn write_varint(out: &mut Vec<u8>, value: i32) {
    let mut rest = value as u32;
    loop {
        let byte = (rest & 0x7f) as u8;
        rest >>= 7;
        if rest == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<i32> {
    let mut value: u32 = 0;
    for i in 0..VARINT_MAX_BYTES {
        let byte = reader.read_u8().await?;
        value |= u32::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    Err(Error::Internal("VarInt longer than five bytes".to_string()))
}

/// A VarInt used as a length: non-negative and bounded
async fn read_len<R: AsyncRead + Unpin>(reader: &mut R) -> Result<usize> {
    let len = read_varint(reader).await?;
    match usize::try_from(len) {
        Ok(len) if len <= MAX_PACKET_BYTES => Ok(len),
        _ => Err(Error::Internal(format!("bad packet length {}", len))),
    }
}

async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let len = read_len(reader).await?;
    let mut packet = vec![0u8; len];
    reader.read_exact(&mut packet).await?;
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const STATUS: &str = r#"{"version":{"name":"1.20.4","protocol":765},"players":{"max":20,"online":0}}"#;

    fn probe() -> GameQueryProbe {
        GameQueryProbe::new(Duration::from_millis(300))
    }

    /// Accept one client, check its handshake and answer with `STATUS`
    async fn answering_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let handshake = read_packet(&mut socket).await.unwrap();
            let n = handshake.len();
            assert_eq!(handshake[0], 0x00);
            assert_eq!(handshake[n - 3..n - 1], port.to_be_bytes());
            assert_eq!(handshake[n - 1], 1);
            assert_eq!(read_packet(&mut socket).await.unwrap(), vec![0x00]);

            let mut body = Vec::new();
            write_varint(&mut body, SLP_PACKET_ID);
            write_string(&mut body, STATUS);
            let mut reply = Vec::new();
            write_packet(&mut reply, &body);
            socket.write_all(&reply).await.unwrap();
        });
        port
    }

    #[test]
    fn test_varint_encoding() {
        for (value, bytes) in [
            (0, vec![0x00]),
            (1, vec![0x01]),
            (127, vec![0x7f]),
            (300, vec![0xac, 0x02]),
            (-1, vec![0xff, 0xff, 0xff, 0xff, 0x0f]),
        ] {
            let mut out = Vec::new();
            write_varint(&mut out, value);
            assert_eq!(out, bytes, "{}", value);
        }
    }

    #[tokio::test]
    async fn test_answering_server_is_healthy() {
        let port = answering_server().await;
        let status = minecraft_status("127.0.0.1", port).await.unwrap();
        assert_eq!(status["players"]["max"], 20);

        let port = answering_server().await;
        probe().query(MINECRAFT, "127.0.0.1", port).await.unwrap();
    }

    #[tokio::test]
    async fn test_hung_server_is_unhealthy() {
        // Bound but never accepting: connects land in the backlog and nobody answers
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let err = probe().query(MINECRAFT, "127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        drop(listener);
    }

    #[tokio::test]
    async fn test_silent_close_is_unhealthy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });
        assert!(probe().query(MINECRAFT, "127.0.0.1", port).await.is_err());
    }

    #[tokio::test]
    async fn test_closed_port_is_unhealthy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(probe().query(MINECRAFT, "127.0.0.1", port).await.is_err());
    }

    #[tokio::test]
    async fn test_unsupported_protocol() {
        let probe = probe();
        assert!(!probe.supports("terraria"));
        let err = probe.query("terraria", "127.0.0.1", 1).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
