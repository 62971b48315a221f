pub mod slp;

pub use slp::StatusProbe;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 상태 조회 오류 타입
///
/// None of these are fatal to the caller: the supervisor logs them at debug
/// level and keeps serving the last cached `StatusSnapshot`.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Connection failed: {0}")]
    ConnectionError(String),

    #[error("Timeout: {0}")]
    TimeoutError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Invalid status payload: {0}")]
    PayloadError(String),
}

impl ProtocolError {
    /// Whether the peer answered at all (worth retrying with the legacy ping).
    pub fn is_protocol_level(&self) -> bool {
        matches!(self, Self::ProtocolError(_) | Self::PayloadError(_))
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Self::TimeoutError(e.to_string()),
            ErrorKind::UnexpectedEof | ErrorKind::InvalidData => Self::ProtocolError(e.to_string()),
            _ => Self::ConnectionError(e.to_string()),
        }
    }
}

/// Result of one successful status query. Replaced as a whole, never mutated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub online: u32,
    pub max_players: u32,
    /// Sampled player names; may be empty even when `online > 0`
    pub players: Vec<String>,
    pub version: String,
    pub motd: String,
    /// Round trip of the status request
    pub latency_ms: u64,
    /// Unix timestamp of the probe, `None` for the never-answered default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<u64>,
}

impl StatusSnapshot {
    pub fn is_fresh(&self) -> bool {
        self.fetched_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_snapshot_is_empty() {
        let snap = StatusSnapshot::default();
        assert!(!snap.is_fresh());
        assert_eq!(snap.online, 0);
        assert!(snap.players.is_empty());
        assert_eq!(snap.version, "");
    }

    #[test]
    fn test_io_error_mapping() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(ProtocolError::from(refused), ProtocolError::ConnectionError(_)));

        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let err = ProtocolError::from(eof);
        assert!(err.is_protocol_level());

        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(matches!(ProtocolError::from(timeout), ProtocolError::TimeoutError(_)));
    }
}
