//! WebSocket front end.
//!
//! Performs the opening handshake, reads the first message as the encrypted
//! backend address, then tunnels. After that point bytes are piped raw in
//! both directions: the upgrade only carries the address, and any further
//! framing is between the client and the backend.

use crate::server::{with_deadline, Gateway};
use crate::tunnel::tunnel;
use frontgate_core::{accept_key, read_message, read_upgrade_key, upgrade_response, GateResult};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

/// Serve one WebSocket connection to completion.
///
/// Handshake failures close the connection before any `101` is sent; later
/// failures (bad first message, unresolvable address) close the upgraded
/// connection without a reply. Dial failures write the dial code raw, the
/// same as on the binary front end.
pub async fn handle(stream: TcpStream, gateway: &Gateway) -> GateResult<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let key = with_deadline(gateway.read_timeout, read_upgrade_key(&mut reader)).await?;
    write_half
        .write_all(upgrade_response(&accept_key(&key)).as_bytes())
        .await?;
    debug!("websocket upgraded");

    let token = with_deadline(
        gateway.read_timeout,
        read_message(&mut reader, gateway.max_message_size),
    )
    .await?;

    let addr = gateway.resolver.resolve(&token).map_err(|e| e.source)?;
    debug!(addr = %addr, "websocket front end resolved backend");

    tunnel(&addr, reader, write_half, &gateway.tunnel).await?;
    Ok(())
}
