//! Backend dialing and the bidirectional byte pipe.
//!
//! Once a front end has resolved the backend address, [`tunnel`] dials it and
//! runs two copy tasks, client→backend and backend→client. Each task reads
//! with a rolling idle deadline; hitting the deadline only restarts the wait.
//! A task ends on EOF, on any I/O error, or when its source conduit has been
//! closed by the other task. On the way out (unwinding included) it shuts
//! down its destination and marks that conduit closed, which in turn ends
//! the other direction.

use frontgate_core::{GateError, GateResult, RejectCode};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Pause between dial attempts after a transient local error.
const DIAL_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Tunnel timing and buffer knobs.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// Total budget for connecting to the backend, retries included.
    pub dial_timeout: Duration,
    /// Rolling per-read deadline while piping. Expiry is not an error.
    pub idle_timeout: Duration,
    /// Copy buffer size per direction.
    pub buffer_size: usize,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            buffer_size: 8192,
        }
    }
}

/// Bytes copied in each direction over the life of a tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Upstream,
    Downstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upstream => f.write_str("client->backend"),
            Direction::Downstream => f.write_str("backend->client"),
        }
    }
}

/// Connect to `addr` within `timeout`.
///
/// `AddrInUse` / `AddrNotAvailable` (local port exhaustion) are retried once
/// per second while budget remains; any other failure is returned at once.
pub async fn dial_backend(addr: &str, timeout: Duration) -> GateResult<TcpStream> {
    let stream = dial_with(addr, timeout, || TcpStream::connect(addr)).await?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// The retry loop behind [`dial_backend`], with the connect step supplied
/// by the caller.
async fn dial_with<C, F, T>(addr: &str, timeout: Duration, mut connect: C) -> GateResult<T>
where
    C: FnMut() -> F,
    F: Future<Output = std::io::Result<T>>,
{
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(GateError::DialTimeout {
                addr: addr.to_string(),
            });
        }

        match tokio::time::timeout(remaining, connect()).await {
            Ok(Ok(conn)) => return Ok(conn),
            Ok(Err(e)) if is_transient(&e) => {
                if deadline.saturating_duration_since(Instant::now()) <= DIAL_RETRY_INTERVAL {
                    return Err(GateError::Dial {
                        addr: addr.to_string(),
                        source: e,
                    });
                }
                debug!(addr, error = %e, "transient dial error, retrying");
                tokio::time::sleep(DIAL_RETRY_INTERVAL).await;
            }
            Ok(Err(e)) => {
                return Err(GateError::Dial {
                    addr: addr.to_string(),
                    source: e,
                })
            }
            Err(_) => {
                return Err(GateError::DialTimeout {
                    addr: addr.to_string(),
                })
            }
        }
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::AddrInUse | std::io::ErrorKind::AddrNotAvailable
    )
}

/// Write a rejection token and close the writer. Failures are only logged:
/// the connection is being dropped either way.
pub async fn write_reject<W>(writer: &mut W, code: RejectCode)
where
    W: AsyncWrite + Unpin,
{
    if let Err(e) = writer.write_all(code.token()).await {
        debug!(code = %code, error = %e, "could not write rejection");
        return;
    }
    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
}

/// Dial `addr` and pipe bytes between it and the client until either side
/// closes.
///
/// `client_reader` must be positioned right after the front-end message so
/// that nothing the client already sent is lost. On dial failure the
/// matching rejection code is written to the client and the error returned.
pub async fn tunnel<R, W>(
    addr: &str,
    client_reader: R,
    mut client_writer: W,
    settings: &TunnelSettings,
) -> GateResult<TunnelStats>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let backend = match dial_backend(addr, settings.dial_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            if let Some(code) = e.reject_code() {
                write_reject(&mut client_writer, code).await;
            }
            return Err(e);
        }
    };
    info!(addr, "tunnel established");

    let (backend_reader, backend_writer) = backend.into_split();
    let client_closed = CancellationToken::new();
    let backend_closed = CancellationToken::new();

    let upstream = tokio::spawn(pipe(
        Direction::Upstream,
        client_reader,
        client_closed.clone(),
        backend_writer,
        backend_closed.clone(),
        settings.idle_timeout,
        settings.buffer_size,
    ));
    let downstream = tokio::spawn(pipe(
        Direction::Downstream,
        backend_reader,
        backend_closed,
        client_writer,
        client_closed,
        settings.idle_timeout,
        settings.buffer_size,
    ));

    let (up, down) = tokio::join!(upstream, downstream);
    let stats = TunnelStats {
        client_to_backend: pipe_result(Direction::Upstream, up),
        backend_to_client: pipe_result(Direction::Downstream, down),
    };

    info!(
        addr,
        sent = stats.client_to_backend,
        received = stats.backend_to_client,
        "tunnel closed"
    );
    Ok(stats)
}

fn pipe_result(direction: Direction, result: Result<u64, JoinError>) -> u64 {
    match result {
        Ok(n) => n,
        Err(e) if e.is_panic() => {
            error!(direction = %direction, "pipe task panicked");
            0
        }
        Err(e) => {
            warn!(direction = %direction, error = %e, "pipe task aborted");
            0
        }
    }
}

/// Copy `src` into `dst` until EOF, an I/O error, or `src_closed` fires.
/// Returns the number of bytes copied.
async fn pipe<R, W>(
    direction: Direction,
    mut src: R,
    src_closed: CancellationToken,
    mut dst: W,
    dst_closed: CancellationToken,
    idle_timeout: Duration,
    buffer_size: usize,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // Fires on every exit path, unwinding included.
    let _close_dst = dst_closed.drop_guard();

    let mut buf = vec![0u8; buffer_size];
    let mut copied = 0u64;

    loop {
        let read = tokio::select! {
            _ = src_closed.cancelled() => {
                debug!(direction = %direction, "source closed by the other direction");
                break;
            }
            r = tokio::time::timeout(idle_timeout, src.read(&mut buf)) => r,
        };

        match read {
            Err(_) => {
                trace!(direction = %direction, "idle deadline passed, still waiting");
                continue;
            }
            Ok(Ok(0)) => {
                debug!(direction = %direction, "source reached EOF");
                break;
            }
            Ok(Ok(n)) => {
                if let Err(e) = dst.write_all(&buf[..n]).await {
                    debug!(direction = %direction, error = %e, "write failed");
                    break;
                }
                copied += n as u64;
            }
            Ok(Err(e)) => {
                debug!(direction = %direction, error = %e, "read failed");
                break;
            }
        }
    }

    let _ = dst.shutdown().await;
    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    /// Loopback echo server; returns its address.
    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.into_split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    /// A port with nothing listening on it.
    async fn closed_port() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    fn quick_settings() -> TunnelSettings {
        TunnelSettings {
            dial_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_millis(50),
            buffer_size: 1024,
        }
    }

    #[tokio::test]
    async fn pipes_both_directions() {
        let addr = echo_server().await;
        let (mut client, gateway_side) = duplex(64 * 1024);
        let (r, w) = tokio::io::split(gateway_side);

        let settings = quick_settings();
        let task = tokio::spawn(async move { tunnel(&addr, r, w, &settings).await });

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
        client.write_all(&payload).await.unwrap();
        let mut echoed = vec![0u8; payload.len()];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload);

        drop(client);
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.client_to_backend, 5000);
        assert_eq!(stats.backend_to_client, 5000);
    }

    #[tokio::test]
    async fn idle_deadline_does_not_tear_down() {
        let addr = echo_server().await;
        let (mut client, gateway_side) = duplex(1024);
        let (r, w) = tokio::io::split(gateway_side);

        let settings = quick_settings();
        let task = tokio::spawn(async move { tunnel(&addr, r, w, &settings).await });

        client.write_all(b"first").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();

        // Several idle deadlines pass with no traffic in either direction.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!task.is_finished());

        client.write_all(b"again").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"again");

        drop(client);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn backend_close_tears_down_client_side() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"bye").await.unwrap();
            // Dropping closes the backend connection.
        });

        let (mut client, gateway_side) = duplex(1024);
        let (r, w) = tokio::io::split(gateway_side);
        let settings = quick_settings();
        let task = tokio::spawn(async move { tunnel(&addr, r, w, &settings).await });

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");

        // The client never closed, yet the tunnel still finishes.
        let stats = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("tunnel should end after backend close")
            .unwrap()
            .unwrap();
        assert_eq!(stats.backend_to_client, 3);
    }

    #[tokio::test]
    async fn refused_dial_writes_4102() {
        let addr = closed_port().await;
        let (mut client, gateway_side) = duplex(1024);
        let (r, w) = tokio::io::split(gateway_side);

        let err = tunnel(&addr, r, w, &quick_settings()).await.unwrap_err();
        assert!(matches!(err, GateError::Dial { .. }));

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"4102");
    }

    #[tokio::test]
    async fn exhausted_budget_writes_4101() {
        let addr = echo_server().await;
        let (mut client, gateway_side) = duplex(1024);
        let (r, w) = tokio::io::split(gateway_side);
        let settings = TunnelSettings {
            dial_timeout: Duration::ZERO,
            ..quick_settings()
        };

        let err = tunnel(&addr, r, w, &settings).await.unwrap_err();
        assert!(matches!(err, GateError::DialTimeout { .. }));

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"4101");
    }

    #[tokio::test]
    async fn dial_backend_connects() {
        let addr = echo_server().await;
        let stream = dial_backend(&addr, Duration::from_secs(1)).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap().to_string(), addr);
    }

    /// Client reader whose first poll panics.
    struct PanickingReader;

    impl AsyncRead for PanickingReader {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            panic!("client reader failed");
        }
    }

    #[tokio::test]
    async fn panicking_pipe_tears_down_other_direction() {
        // Backend never writes; it only reports when its read side ends.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (eof_tx, eof_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut sink = Vec::new();
            let _ = stream.read_to_end(&mut sink).await;
            let _ = eof_tx.send(sink.len());
        });

        let (mut client, gateway_side) = duplex(1024);
        let (_unused_reader, w) = tokio::io::split(gateway_side);
        let settings = quick_settings();
        let task =
            tokio::spawn(async move { tunnel(&addr, PanickingReader, w, &settings).await });

        let stats = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("tunnel should end after a pipe panic")
            .unwrap()
            .unwrap();
        assert_eq!(stats, TunnelStats::default());

        // Both conduits were closed: the backend saw EOF, the client sees EOF.
        let backend_received = tokio::time::timeout(Duration::from_secs(3), eof_rx)
            .await
            .expect("backend should see EOF")
            .unwrap();
        assert_eq!(backend_received, 0);
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn transient_dial_errors_retry_until_budget() {
        let mut attempts = 0u32;
        let started = Instant::now();
        let err = dial_with("10.0.0.1:80", Duration::from_millis(2500), || {
            attempts += 1;
            std::future::ready(Err::<(), _>(std::io::Error::from(
                std::io::ErrorKind::AddrNotAvailable,
            )))
        })
        .await
        .unwrap_err();

        // Attempts at 0 s, 1 s and 2 s; the last leaves less than a retry interval.
        assert_eq!(attempts, 3);
        assert!(started.elapsed() < Duration::from_millis(2500));
        match err {
            GateError::Dial { source, .. } => {
                assert_eq!(source.kind(), std::io::ErrorKind::AddrNotAvailable)
            }
            other => panic!("expected Dial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transient_dial_error_then_success() {
        let mut attempts = 0u32;
        let conn = dial_with("10.0.0.1:80", Duration::from_secs(3), || {
            attempts += 1;
            let result = if attempts == 1 {
                Err(std::io::Error::from(std::io::ErrorKind::AddrInUse))
            } else {
                Ok(attempts)
            };
            std::future::ready(result)
        })
        .await
        .unwrap();
        assert_eq!(conn, 2);
    }

    #[tokio::test]
    async fn refused_dial_is_not_retried() {
        let mut attempts = 0u32;
        let err = dial_with("10.0.0.1:80", Duration::from_secs(3), || {
            attempts += 1;
            std::future::ready(Err::<(), _>(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused,
            )))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, GateError::Dial { .. }));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn transient_kinds() {
        use std::io::{Error, ErrorKind};
        assert!(is_transient(&Error::from(ErrorKind::AddrNotAvailable)));
        assert!(is_transient(&Error::from(ErrorKind::AddrInUse)));
        assert!(!is_transient(&Error::from(ErrorKind::ConnectionRefused)));
    }
}
