use crate::protocol::RejectCode;
use thiserror::Error;

/// Errors produced by the gateway protocol layer.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    #[error("format error: {0}")]
    Format(String),

    #[error("decrypt error: {0}")]
    Decrypt(String),

    #[error("dial {addr} timed out")]
    DialTimeout { addr: String },

    #[error("dial {addr} failed: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("peer requested close")]
    PeerClosed,

    #[error("timeout")]
    Timeout,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GateError {
    /// Wire rejection code for errors that have one.
    ///
    /// Protocol-stage errors carry their code at the call site (the same
    /// `Protocol` error can mean several things on the binary front end), so
    /// only resolution and dial failures are mapped here.
    pub fn reject_code(&self) -> Option<RejectCode> {
        match self {
            GateError::Format(_) | GateError::Decrypt(_) => Some(RejectCode::DecryptFailed),
            GateError::DialTimeout { .. } => Some(RejectCode::DialTimeout),
            GateError::Dial { .. } => Some(RejectCode::DialFailed),
            _ => None,
        }
    }
}

pub type GateResult<T> = Result<T, GateError>;
