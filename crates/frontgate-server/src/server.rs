//! Connection dispatcher: owns both listening sockets and runs one supervised
//! task per accepted connection.
//!
//! The [`Gateway`] holds everything a connection task needs (resolver,
//! tunnel settings, deadlines) and is shared by `Arc`; there is no other
//! shared state between sessions.

use crate::config::ServerConfig;
use crate::resolver::AddressResolver;
use crate::tunnel::TunnelSettings;
use crate::{binary, websocket};
use frontgate_core::{AddressCache, AddressCipher, GateError, GateResult};
use futures_util::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Shortest and longest pause after a failed `accept`.
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Per-process state shared with every connection task.
#[derive(Debug)]
pub struct Gateway {
    pub resolver: AddressResolver,
    pub tunnel: TunnelSettings,
    /// Hard deadline for each read during front-end parsing.
    pub read_timeout: Duration,
    /// Cap on the WebSocket address message.
    pub max_message_size: u64,
}

impl Gateway {
    pub fn from_config(config: &ServerConfig) -> GateResult<Self> {
        let cipher = AddressCipher::new(config.cipher_mode, &config.secret)?;
        let cache = AddressCache::new(config.cache_max_entries);
        Ok(Self {
            resolver: AddressResolver::new(cipher, cache),
            tunnel: TunnelSettings {
                dial_timeout: config.dial_timeout,
                idle_timeout: config.idle_timeout,
                buffer_size: config.buffer_size,
            },
            read_timeout: config.read_timeout,
            max_message_size: config.max_message_size,
        })
    }
}

/// Run `fut` under a hard deadline; expiry becomes [`GateError::Timeout`].
pub(crate) async fn with_deadline<F, T, E>(deadline: Duration, fut: F) -> GateResult<T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<GateError>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(GateError::Timeout),
    }
}

/// Which front-end protocol a listener speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontEnd {
    Binary,
    WebSocket,
}

impl fmt::Display for FrontEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrontEnd::Binary => f.write_str("binary"),
            FrontEnd::WebSocket => f.write_str("websocket"),
        }
    }
}

/// The gateway server instance.
pub struct GatewayServer {
    gateway: Arc<Gateway>,
    binary: TcpListener,
    websocket: TcpListener,
}

impl GatewayServer {
    /// Build the shared state and bind both listeners.
    pub async fn bind(config: &ServerConfig) -> GateResult<Self> {
        let gateway = Arc::new(Gateway::from_config(config)?);
        let binary = bind_listener(&config.bind, config.port).await?;
        let websocket = bind_listener(&config.bind, config.websocket_port).await?;
        Ok(Self {
            gateway,
            binary,
            websocket,
        })
    }

    /// Bound addresses of the binary and WebSocket listeners.
    pub fn local_addrs(&self) -> GateResult<(SocketAddr, SocketAddr)> {
        Ok((self.binary.local_addr()?, self.websocket.local_addr()?))
    }

    pub fn gateway(&self) -> Arc<Gateway> {
        self.gateway.clone()
    }

    /// Accept on both listeners until the task is dropped.
    pub async fn run(self) -> GateResult<()> {
        let (binary_addr, ws_addr) = self.local_addrs()?;
        info!(binary = %binary_addr, websocket = %ws_addr, "frontgate ready");

        tokio::join!(
            accept_loop(
                self.binary,
                FrontEnd::Binary,
                self.gateway.clone(),
                |stream, gateway| async move { binary::handle(stream, &gateway).await },
            ),
            accept_loop(
                self.websocket,
                FrontEnd::WebSocket,
                self.gateway,
                |stream, gateway| async move { websocket::handle(stream, &gateway).await },
            ),
        );
        Ok(())
    }
}

async fn bind_listener(host: &str, port: u16) -> GateResult<TcpListener> {
    let addr = format!("{host}:{port}");
    TcpListener::bind(&addr).await.map_err(|e| {
        error!(addr = %addr, error = %e, "listen failed");
        GateError::Io(e)
    })
}

/// Accept connections forever, handing each one to `handler` in its own
/// supervised task.
async fn accept_loop<H, F>(
    listener: TcpListener,
    front_end: FrontEnd,
    gateway: Arc<Gateway>,
    handler: H,
) where
    H: Fn(TcpStream, Arc<Gateway>) -> F,
    F: Future<Output = GateResult<()>> + Send + 'static,
{
    let mut backoff = Duration::ZERO;

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                backoff = Duration::ZERO;
                stream.set_nodelay(true).ok();
                let connection = handler(stream, gateway.clone());
                tokio::spawn(serve_connection(connection, peer, front_end));
            }
            Err(e) => {
                backoff = if backoff.is_zero() {
                    ACCEPT_BACKOFF_MIN
                } else {
                    (backoff * 2).min(ACCEPT_BACKOFF_MAX)
                };
                warn!(front_end = %front_end, error = %e, delay_ms = backoff.as_millis() as u64, "accept failed");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// How a connection task ended.
#[derive(Debug)]
enum Outcome {
    Done,
    PeerClosed,
    Failed(GateError),
    Panicked(String),
}

/// Drive `connection` to completion, turning errors and panics into an
/// [`Outcome`]. Nothing escapes this boundary.
async fn supervise<F>(connection: F) -> Outcome
where
    F: Future<Output = GateResult<()>>,
{
    match AssertUnwindSafe(connection).catch_unwind().await {
        Ok(Ok(())) => Outcome::Done,
        Ok(Err(GateError::PeerClosed)) => Outcome::PeerClosed,
        Ok(Err(e)) => Outcome::Failed(e),
        Err(panic) => Outcome::Panicked(panic_message(panic.as_ref())),
    }
}

async fn serve_connection<F>(connection: F, peer: SocketAddr, front_end: FrontEnd)
where
    F: Future<Output = GateResult<()>>,
{
    let ip = peer.ip();
    info!(peer = %ip, front_end = %front_end, "client connected");

    match supervise(connection).await {
        Outcome::Done => {}
        Outcome::PeerClosed => {
            debug!(peer = %ip, front_end = %front_end, "peer closed before tunnel");
        }
        Outcome::Failed(e) => {
            warn!(peer = %ip, front_end = %front_end, error = %e, "connection error");
        }
        Outcome::Panicked(message) => {
            error!(peer = %ip, front_end = %front_end, panic = %message, "connection task panicked");
        }
    }

    info!(peer = %ip, front_end = %front_end, "client closed");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
