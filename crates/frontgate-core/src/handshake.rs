//! WebSocket opening handshake (RFC 6455 section 4.2).
//!
//! Only `Sec-WebSocket-Key` is consulted; every other request header is read
//! and ignored. The response is a fixed `101 Switching Protocols`.

use crate::error::{GateError, GateResult};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// GUID appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the whole request header block.
pub const MAX_HEADER_BYTES: usize = 8192;

/// Base64-encoded length of the 16-byte client nonce.
const KEY_LEN: usize = 24;

/// Compute `Sec-WebSocket-Accept` for a client key.
pub fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(sha.finalize())
}

/// Read request header lines up to the blank line and return the
/// `Sec-WebSocket-Key` value.
///
/// Fails if the stream ends first, the headers exceed [`MAX_HEADER_BYTES`],
/// or the key is missing or shorter than a base64 16-byte nonce.
pub async fn read_upgrade_key<R>(reader: &mut R) -> GateResult<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut key: Option<String> = None;
    let mut consumed = 0usize;
    let mut line = String::new();

    loop {
        let remaining = MAX_HEADER_BYTES.saturating_sub(consumed);
        if remaining == 0 {
            return Err(GateError::Handshake("request headers too large".into()));
        }

        line.clear();
        let n = (&mut *reader)
            .take(remaining as u64)
            .read_line(&mut line)
            .await
            .map_err(|e| GateError::Handshake(format!("reading request: {e}")))?;
        if n == 0 {
            return Err(GateError::Handshake(
                "connection closed before end of headers".into(),
            ));
        }
        consumed += n;

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }

        if let Some((name, value)) = trimmed.split_once(':') {
            if name.trim().eq_ignore_ascii_case("sec-websocket-key") {
                key = Some(value.trim().to_string());
            }
        }
    }

    match key {
        Some(k) if k.len() >= KEY_LEN => Ok(k),
        Some(k) => Err(GateError::Handshake(format!(
            "Sec-WebSocket-Key too short: {} bytes",
            k.len()
        ))),
        None => Err(GateError::Handshake("missing Sec-WebSocket-Key".into())),
    }
}

/// The `101 Switching Protocols` response carrying the accept token.
pub fn upgrade_response(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\
         Upgrade: websocket\r\n\r\n"
    )
}
