//! WebSocket frame codec (RFC 6455 section 5.2).
//!
//! Frame layout:
//!
//! ```text
//! byte 0: FIN | RSV1 | RSV2 | RSV3 | opcode(4)
//! byte 1: MASK | payload len(7)
//! len 126 => 2-byte big-endian length follows
//! len 127 => 8-byte big-endian length follows
//! [4-byte mask key if MASK]
//! payload
//! ```

use crate::error::{GateError, GateResult};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

pub const FIN_BIT: u8 = 1 << 7;
pub const RSV1_BIT: u8 = 1 << 6;
pub const RSV2_BIT: u8 = 1 << 5;
pub const RSV3_BIT: u8 = 1 << 4;
pub const MASK_BIT: u8 = 1 << 7;

pub const OP_CONTINUATION: u8 = 0x0;
pub const OP_TEXT: u8 = 0x1;
pub const OP_BINARY: u8 = 0x2;
pub const OP_CLOSE: u8 = 0x8;
pub const OP_PING: u8 = 0x9;
pub const OP_PONG: u8 = 0xa;

/// Largest length that fits the 7-bit field directly.
const MAX_DIRECT_LEN: u64 = 125;
const LEN_16: u8 = 126;
const LEN_64: u8 = 127;

/// Default cap on a single frame payload and on an assembled message (1 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 1_048_576;

/// One WebSocket frame. `payload` is always held unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: u8,
    pub mask: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// A final, unmasked binary frame.
    pub fn binary(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode: OP_BINARY,
            mask: None,
            payload: payload.into(),
        }
    }

    pub fn with_mask(mut self, mask: [u8; 4]) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    pub fn is_control(&self) -> bool {
        self.opcode & 0x8 != 0
    }

    /// Serialize to wire bytes, choosing the smallest length tier and masking
    /// the payload when a mask key is set.
    pub fn encode(&self) -> Vec<u8> {
        let len = self.payload.len() as u64;
        let mut out = Vec::with_capacity(2 + 8 + 4 + self.payload.len());

        let mut b0 = self.opcode & 0x0f;
        if self.fin {
            b0 |= FIN_BIT;
        }
        out.push(b0);

        let mask_flag = if self.mask.is_some() { MASK_BIT } else { 0 };
        if len <= MAX_DIRECT_LEN {
            out.push(mask_flag | len as u8);
        } else if len <= u16::MAX as u64 {
            out.push(mask_flag | LEN_16);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(mask_flag | LEN_64);
            out.extend_from_slice(&len.to_be_bytes());
        }

        match self.mask {
            Some(key) => {
                out.extend_from_slice(&key);
                let start = out.len();
                out.extend_from_slice(&self.payload);
                apply_mask(&mut out[start..], key);
            }
            None => out.extend_from_slice(&self.payload),
        }
        out
    }
}

/// XOR each byte with `key[i % 4]`. Masking and unmasking are the same operation.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, b) in data.iter_mut().enumerate() {
        *b ^= key[i % 4];
    }
}

/// Read a single frame.
///
/// A close opcode ends the read with [`GateError::PeerClosed`]; nonzero
/// reserved bits and lengths above `max_payload` are protocol errors, the
/// latter checked before anything is allocated.
pub async fn read_frame<R>(reader: &mut R, max_payload: u64) -> GateResult<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    reader.read_exact(&mut header).await?;

    let fin = header[0] & FIN_BIT != 0;
    let rsv = header[0] & (RSV1_BIT | RSV2_BIT | RSV3_BIT);
    if rsv != 0 {
        return Err(GateError::Protocol(format!(
            "unexpected reserved bits 0x{rsv:x}"
        )));
    }

    let opcode = header[0] & 0x0f;
    if opcode == OP_CLOSE {
        return Err(GateError::PeerClosed);
    }

    let masked = header[1] & MASK_BIT != 0;
    let length = match header[1] & 0x7f {
        LEN_16 => reader.read_u16().await? as u64,
        LEN_64 => reader.read_u64().await?,
        n => n as u64,
    };

    if length > max_payload {
        return Err(GateError::Protocol(format!(
            "frame too large: {length} bytes (max {max_payload})"
        )));
    }

    let mask = if masked {
        let mut key = [0u8; 4];
        reader.read_exact(&mut key).await?;
        Some(key)
    } else {
        None
    };

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;
    if let Some(key) = mask {
        apply_mask(&mut payload, key);
    }

    Ok(Frame {
        fin,
        opcode,
        mask,
        payload,
    })
}

/// Read frames until one carries the final flag and return the concatenated
/// payload.
///
/// Ping and pong frames may be interleaved with a fragmented message; their
/// payloads are not part of it and are skipped. Any frame error, including a
/// close, is returned as the terminal error.
pub async fn read_message<R>(reader: &mut R, max_size: u64) -> GateResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut message = Vec::new();
    loop {
        let remaining = max_size.saturating_sub(message.len() as u64);
        let frame = read_frame(reader, remaining).await?;

        // Close never gets here; read_frame turns it into PeerClosed.
        if frame.is_control() {
            debug!(opcode = frame.opcode, "skipping control frame");
            continue;
        }

        message.extend_from_slice(&frame.payload);
        if frame.fin {
            return Ok(message);
        }
    }
}
