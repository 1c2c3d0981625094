//! Binary front end.
//!
//! Wire format: `[1-byte check][1-byte length n][n bytes encrypted address]`,
//! after which the connection becomes a raw tunnel to the decrypted address.
//! Every rejection writes a four-digit [`RejectCode`] and closes.

use crate::server::{with_deadline, Gateway};
use crate::tunnel::{tunnel, write_reject};
use frontgate_core::{GateError, GateResult, RejectCode, RESERVED_SENTINEL};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

/// A parse failure and the code to send back for it.
#[derive(Debug)]
pub struct Rejection {
    pub code: RejectCode,
    pub error: GateError,
}

impl Rejection {
    fn new(code: RejectCode, error: GateError) -> Self {
        Self { code, error }
    }
}

/// Read the address frame, leaving `reader` positioned on the first tunneled byte.
pub async fn read_address<R>(reader: &mut R, deadline: Duration) -> Result<Vec<u8>, Rejection>
where
    R: AsyncBufRead + Unpin,
{
    let first = with_deadline(deadline, reader.read_u8())
        .await
        .map_err(|e| Rejection::new(RejectCode::FirstByte, e))?;

    if first == RESERVED_SENTINEL {
        return Err(Rejection::new(
            RejectCode::ReservedSentinel,
            GateError::Protocol(format!("reserved first byte 0x{first:02x}")),
        ));
    }

    let len = with_deadline(deadline, reader.read_u8())
        .await
        .map_err(|e| Rejection::new(RejectCode::Length, e))?;
    if len == 0 {
        return Err(Rejection::new(
            RejectCode::Length,
            GateError::Protocol("zero-length address".into()),
        ));
    }

    let mut payload = vec![0u8; len as usize];
    with_deadline(deadline, reader.read_exact(&mut payload))
        .await
        .map_err(|e| Rejection::new(RejectCode::ShortPayload, e))?;

    Ok(payload)
}

/// Serve one binary-protocol connection to completion.
pub async fn handle(stream: TcpStream, gateway: &Gateway) -> GateResult<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let token = match read_address(&mut reader, gateway.read_timeout).await {
        Ok(token) => token,
        Err(rejection) => {
            write_reject(&mut write_half, rejection.code).await;
            return Err(rejection.error);
        }
    };

    let addr = match gateway.resolver.resolve(&token) {
        Ok(addr) => addr,
        Err(e) => {
            debug!(fallback = e.fallback, "rejecting unresolvable address");
            write_reject(&mut write_half, RejectCode::DecryptFailed).await;
            return Err(e.source);
        }
    };
    debug!(addr = %addr, "binary front end resolved backend");

    tunnel(&addr, reader, write_half, &gateway.tunnel).await?;
    Ok(())
}
