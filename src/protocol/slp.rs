use super::{ProtocolError, StatusSnapshot};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::Deserialize;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use crate::utils::unix_now;

/// Server List Ping 클라이언트 (Minecraft Java Edition)
///
/// 프로토콜 요약:
/// - 모든 패킷은 VarInt 길이 + VarInt 패킷 ID + 데이터
/// - Handshake(0x00, next state = 1) → Status Request(0x00) → Status Response(0x00, JSON)
/// - 1.6 이하 서버는 레거시 0xFE 0x01 핑으로 응답
#[derive(Debug, Clone)]
pub struct StatusProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

/// Protocol number sent in the handshake. Servers answer status for any value.
pub const HANDSHAKE_PROTOCOL: i32 = 47;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
/// Status JSON can carry a base64 favicon, but never this much.
const MAX_PACKET_LEN: usize = 2 * 1024 * 1024;

impl StatusProbe {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        // server-ip= 가 비어 있으면 모든 인터페이스에서 대기 중
        let host = if host.trim().is_empty() {
            "127.0.0.1".to_string()
        } else {
            host.trim().to_string()
        };
        Self {
            host,
            port,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Query the server, falling back to the legacy ping when the modern
    /// handshake is answered with garbage.
    pub fn query(&self) -> Result<StatusSnapshot, ProtocolError> {
        match self.query_modern() {
            Ok(snap) => Ok(snap),
            Err(e) if e.is_protocol_level() => {
                tracing::debug!("Modern ping to {}:{} failed ({}), trying legacy", self.host, self.port, e);
                self.query_legacy()
            }
            Err(e) => Err(e),
        }
    }

    /// `query`를 블로킹 스레드풀에서 실행
    pub async fn query_async(&self) -> Result<StatusSnapshot, ProtocolError> {
        let probe = self.clone();
        tokio::task::spawn_blocking(move || probe.query())
            .await
            .map_err(|e| ProtocolError::ConnectionError(format!("probe task failed: {}", e)))?
    }

    fn connect(&self) -> Result<TcpStream, ProtocolError> {
        let addr = format!("{}:{}", self.host, self.port);
        let sock_addr = addr
            .to_socket_addrs()
            .map_err(|e| ProtocolError::ConnectionError(format!("Failed to resolve {}: {}", addr, e)))?
            .next()
            .ok_or_else(|| ProtocolError::ConnectionError(format!("No address for {}", addr)))?;

        let stream = TcpStream::connect_timeout(&sock_addr, self.timeout)
            .map_err(|e| ProtocolError::ConnectionError(format!("Failed to connect to {}: {}", addr, e)))?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn query_modern(&self) -> Result<StatusSnapshot, ProtocolError> {
        let mut stream = self.connect()?;

        // Handshake
        let mut handshake = Vec::with_capacity(32 + self.host.len());
        write_varint(&mut handshake, 0x00);
        write_varint(&mut handshake, HANDSHAKE_PROTOCOL);
        write_string(&mut handshake, &self.host);
        handshake.write_u16::<BigEndian>(self.port)?;
        write_varint(&mut handshake, 1);
        write_packet(&mut stream, &handshake)?;

        // Status Request
        let started = Instant::now();
        write_packet(&mut stream, &[0x00])?;

        let packet = read_packet(&mut stream)?;
        let latency = started.elapsed();
        let mut cursor = &packet[..];
        let packet_id = read_varint(&mut cursor)?;
        if packet_id != 0x00 {
            return Err(ProtocolError::ProtocolError(format!(
                "Unexpected packet id 0x{:02x}",
                packet_id
            )));
        }
        let json = read_string(&mut cursor)?;

        let mut snap = parse_status_json(&json)?;
        snap.latency_ms = latency.as_millis() as u64;
        snap.fetched_at = Some(unix_now());
        Ok(snap)
    }

    fn query_legacy(&self) -> Result<StatusSnapshot, ProtocolError> {
        let mut stream = self.connect()?;
        let started = Instant::now();
        stream.write_all(&[0xFE, 0x01])?;

        let kick = stream.read_u8()?;
        if kick != 0xFF {
            return Err(ProtocolError::ProtocolError(format!(
                "Legacy ping answered with 0x{:02x}",
                kick
            )));
        }
        let chars = stream.read_u16::<BigEndian>()? as usize;
        let mut units = Vec::with_capacity(chars);
        for _ in 0..chars {
            units.push(stream.read_u16::<BigEndian>()?);
        }
        let text = String::from_utf16_lossy(&units);

        let mut snap = parse_legacy_response(&text)?;
        snap.latency_ms = started.elapsed().as_millis() as u64;
        snap.fetched_at = Some(unix_now());
        Ok(snap)
    }
}

// ─── Payload ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PingPayload {
    #[serde(default)]
    version: PingVersion,
    #[serde(default)]
    players: PingPlayers,
    #[serde(default)]
    description: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct PingVersion {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct PingPlayers {
    #[serde(default)]
    max: u32,
    #[serde(default)]
    online: u32,
    /// 서버 설정에 따라 생략될 수 있음
    #[serde(default)]
    sample: Option<Vec<PingPlayer>>,
}

#[derive(Debug, Deserialize)]
struct PingPlayer {
    name: String,
}

/// Parse the status response JSON into a snapshot (latency/time left unset).
pub fn parse_status_json(json: &str) -> Result<StatusSnapshot, ProtocolError> {
    let payload: PingPayload =
        serde_json::from_str(json).map_err(|e| ProtocolError::PayloadError(e.to_string()))?;

    Ok(StatusSnapshot {
        online: payload.players.online,
        max_players: payload.players.max,
        players: payload
            .players
            .sample
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.name)
            .collect(),
        version: payload.version.name,
        motd: flatten_chat(&payload.description),
        latency_ms: 0,
        fetched_at: None,
    })
}

/// Flatten a chat component (plain string or `{text, extra: [...]}`) to text.
fn flatten_chat(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(map) => {
            let mut out = map
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string();
            if let Some(serde_json::Value::Array(extra)) = map.get("extra") {
                for part in extra {
                    out.push_str(&flatten_chat(part));
                }
            }
            out
        }
        serde_json::Value::Array(parts) => parts.iter().map(flatten_chat).collect(),
        _ => String::new(),
    }
}

/// `§1\0<protocol>\0<version>\0<motd>\0<online>\0<max>` (1.4+) or `motd§online§max` (beta).
pub fn parse_legacy_response(text: &str) -> Result<StatusSnapshot, ProtocolError> {
    let bad = || ProtocolError::PayloadError(format!("Malformed legacy response: {:?}", text));

    let (version, motd, online, max) = if let Some(rest) = text.strip_prefix("\u{a7}1\0") {
        let fields: Vec<&str> = rest.split('\0').collect();
        if fields.len() < 5 {
            return Err(bad());
        }
        (fields[1].to_string(), fields[2].to_string(), fields[3], fields[4])
    } else {
        let fields: Vec<&str> = text.rsplitn(3, '\u{a7}').collect();
        if fields.len() < 3 {
            return Err(bad());
        }
        // rsplitn은 역순
        (String::new(), fields[2].to_string(), fields[1], fields[0])
    };

    Ok(StatusSnapshot {
        online: online.trim().parse().map_err(|_| bad())?,
        max_players: max.trim().parse().map_err(|_| bad())?,
        players: Vec::new(),
        version,
        motd,
        latency_ms: 0,
        fetched_at: None,
    })
}

// ─── Wire helpers ────────────────────────────────────────────

pub fn write_varint(buf: &mut Vec<u8>, value: i32) {
    let mut v = value as u32;
    loop {
        if v & !0x7F == 0 {
            buf.push(v as u8);
            return;
        }
        buf.push((v & 0x7F) as u8 | 0x80);
        v >>= 7;
    }
}

pub fn read_varint<R: Read>(reader: &mut R) -> Result<i32, ProtocolError> {
    let mut result: u32 = 0;
    for i in 0..5 {
        let byte = reader.read_u8()?;
        result |= ((byte & 0x7F) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(result as i32);
        }
    }
    Err(ProtocolError::ProtocolError("VarInt is too big".to_string()))
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_varint(buf, s.len() as i32);
    buf.extend_from_slice(s.as_bytes());
}

fn read_string<R: Read>(reader: &mut R) -> Result<String, ProtocolError> {
    let len = read_len(reader)?;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| ProtocolError::PayloadError(e.to_string()))
}

fn read_len<R: Read>(reader: &mut R) -> Result<usize, ProtocolError> {
    let len = read_varint(reader)?;
    if len < 0 || len as usize > MAX_PACKET_LEN {
        return Err(ProtocolError::ProtocolError(format!("Invalid length: {}", len)));
    }
    Ok(len as usize)
}

fn write_packet<W: Write>(writer: &mut W, body: &[u8]) -> Result<(), ProtocolError> {
    let mut framed = Vec::with_capacity(body.len() + 5);
    write_varint(&mut framed, body.len() as i32);
    framed.extend_from_slice(body);
    writer.write_all(&framed)?;
    writer.flush()?;
    Ok(())
}

fn read_packet<R: Read>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let len = read_len(reader)?;
    let mut packet = vec![0u8; len];
    reader.read_exact(&mut packet)?;
    Ok(packet)
}
