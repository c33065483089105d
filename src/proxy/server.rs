//! SOCKS5 server
//!
//! Accept loop and per-connection state machine: negotiate, read one CONNECT
//! request, bind an upstream endpoint through the retry driver, reply, then
//! relay until both directions close.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout_at;
use tracing::{debug, info, warn};

use crate::error::{Result, RevolveError};
use crate::models::{ProxyEndpoint, ServerStats};
use crate::proxy::rotation::Rotator;
use crate::proxy::socks;
use crate::proxy::transport::{ProxyDialer, UpstreamConn};
use crate::proxy::tunnel::{self, BufferPool};

/// Deadline covering greeting and request parsing together
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How a worker binds an endpoint to a client request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryMode {
    /// Try a bounded number of endpoints, then give up
    #[default]
    Bounded,
    /// Keep retrying until a dial succeeds or every endpoint is dead
    Persistent,
}

/// Rotating SOCKS5 server
#[derive(Clone)]
pub struct Server {
    rotator: Arc<Rotator>,
    dialer: Arc<dyn ProxyDialer>,
    stats: Arc<ServerStats>,
    buffers: Arc<BufferPool>,
    retry_mode: RetryMode,
    retry_delay: Duration,
}

impl Server {
    pub fn new(
        rotator: Arc<Rotator>,
        dialer: Arc<dyn ProxyDialer>,
        retry_mode: RetryMode,
        retry_delay: Duration,
    ) -> Self {
        Self {
            rotator,
            dialer,
            stats: Arc::new(ServerStats::new()),
            buffers: BufferPool::new(),
            retry_mode,
            retry_delay,
        }
    }

    /// Read-only handle to the request counters
    pub fn stats(&self) -> Arc<ServerStats> {
        self.stats.clone()
    }

    /// Bind the frontend listener
    pub fn bind(addr: &str) -> Result<TcpListener> {
        let addr: SocketAddr = addr.parse().map_err(|_| {
            RevolveError::InvalidConfig(format!("invalid listen address: {}", addr))
        })?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        Ok(socket.listen(1024)?)
    }

    /// Accept connections until the shutdown signal flips
    ///
    /// Every accepted connection gets its own worker task; on shutdown the
    /// listener closes first and all in-flight workers are awaited.
    pub async fn run(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut workers = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let server = self.clone();
                            let shutdown = shutdown.clone();
                            workers.spawn(async move {
                                server.handle_connection(stream, peer, shutdown).await;
                            });
                        }
                        // A failed accept must not kill the server.
                        Err(e) => debug!("Accept error: {}", e),
                    }
                }
                Some(_) = workers.join_next(), if !workers.is_empty() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        drop(listener);
        if !workers.is_empty() {
            info!("Waiting for {} in-flight connections", workers.len());
        }
        while workers.join_next().await.is_some() {}

        Ok(())
    }

    async fn handle_connection(
        self,
        mut stream: TcpStream,
        peer: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let _ = stream.set_nodelay(true);
        let _guard = ConnGuard::new(&self.stats);

        let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;

        match timeout_at(deadline, socks::negotiate(&mut stream)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(%peer, "SOCKS5 negotiation failed: {}", e);
                return;
            }
            Err(_) => {
                debug!(%peer, "Client handshake timed out");
                return;
            }
        }

        let target = match timeout_at(deadline, socks::read_request(&mut stream)).await {
            Ok(Ok(target)) => target,
            Ok(Err(e)) => {
                debug!(%peer, "Bad CONNECT request: {}", e);
                let _ = socks::write_reply(&mut stream, e.reply_code(), None).await;
                return;
            }
            Err(_) => {
                debug!(%peer, "Client handshake timed out");
                return;
            }
        };

        self.stats.record_request();
        let target = target.to_string();

        match self.connect_upstream(&mut shutdown, &target).await {
            Ok((upstream, endpoint, latency)) => {
                self.stats.record_success();
                endpoint.record_request(latency);
                debug!(
                    "Tunnel to {} established through {} in {:?}",
                    target, endpoint, latency
                );

                if socks::write_reply(&mut stream, socks::REPLY_SUCCESS, upstream.local_addr)
                    .await
                    .is_err()
                {
                    return;
                }
                tunnel::copy_bidirectional(stream, upstream.stream, &self.buffers).await;
            }
            Err(e) => {
                self.stats.record_failure();
                warn!("Upstream connect for {} failed: {}", target, e);
                let _ = socks::write_reply(&mut stream, e.reply_code(), None).await;
            }
        }
    }

    /// Retry driver: bind an endpoint to this request
    ///
    /// Failed dials mark the endpoint dead and move on; only the final
    /// failure of the whole request is recorded against an endpoint. The
    /// returned latency spans the entire driver, retries included.
    async fn connect_upstream(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        target: &str,
    ) -> Result<(UpstreamConn, Arc<ProxyEndpoint>, Duration)> {
        let start = Instant::now();
        let mut last_error: Option<RevolveError> = None;
        let mut last_endpoint: Option<Arc<ProxyEndpoint>> = None;

        let error = match self.retry_mode {
            RetryMode::Bounded => {
                let budget = self.rotator.count().clamp(3, 10);
                // A sticky rotator can hand back the same endpoint on every
                // call, so raw fetches carry their own cap; counting only
                // dial attempts would let the duplicate-skip branch spin
                // forever.
                let max_fetches = budget + self.rotator.count();
                let mut tried = HashSet::new();
                let mut attempts = 0;
                let mut fetches = 0;

                loop {
                    if attempts >= budget || fetches >= max_fetches {
                        break last_error.take().unwrap_or(RevolveError::NoProxiesAvailable);
                    }
                    fetches += 1;
                    let endpoint = match self.rotator.next() {
                        Ok(endpoint) => endpoint,
                        Err(e) => break last_error.take().unwrap_or(e),
                    };
                    if !tried.insert(endpoint.fingerprint()) {
                        if tried.len() >= self.rotator.count() {
                            break last_error.take().unwrap_or(RevolveError::AllProxiesDead);
                        }
                        continue;
                    }
                    attempts += 1;

                    debug!("Dialing {} through {} (attempt {})", target, endpoint, attempts);
                    match self.dialer.dial(&endpoint, target).await {
                        Ok(conn) => return Ok((conn, endpoint, start.elapsed())),
                        Err(e) => {
                            warn!("Dial through {} failed: {}", endpoint, e);
                            self.rotator.mark_dead(&endpoint);
                            last_error = Some(e);
                            last_endpoint = Some(endpoint);
                        }
                    }
                }
            }
            RetryMode::Persistent => loop {
                if *shutdown.borrow() {
                    break RevolveError::Cancelled;
                }
                let endpoint = match self.rotator.next() {
                    Ok(endpoint) => endpoint,
                    Err(e) => break last_error.take().unwrap_or(e),
                };

                debug!("Dialing {} through {}", target, endpoint);
                match self.dialer.dial(&endpoint, target).await {
                    Ok(conn) => return Ok((conn, endpoint, start.elapsed())),
                    Err(e) => {
                        warn!("Dial through {} failed: {}", endpoint, e);
                        self.rotator.mark_dead(&endpoint);
                        last_error = Some(e);
                        last_endpoint = Some(endpoint);

                        tokio::select! {
                            _ = tokio::time::sleep(self.retry_delay) => {}
                            changed = shutdown.changed() => {
                                if changed.is_err() {
                                    break RevolveError::Cancelled;
                                }
                            }
                        }
                    }
                }
            },
        };

        if let Some(endpoint) = last_endpoint {
            endpoint.record_failure();
        }
        Err(error)
    }
}

/// Active-connection counter tied to worker scope
struct ConnGuard {
    stats: Arc<ServerStats>,
}

impl ConnGuard {
    fn new(stats: &Arc<ServerStats>) -> Self {
        stats.conn_opened();
        Self {
            stats: stats.clone(),
        }
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.stats.conn_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::rotation::{RequestsPerProxy, RotationStrategy};
    use crate::proxy::transport::Dialer;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::task::JoinHandle;

    fn new_rotator(skip_dead: bool, urls: &[String]) -> Arc<Rotator> {
        let rotator = Arc::new(Rotator::new(
            RotationStrategy::Sequential,
            skip_dead,
            RequestsPerProxy::Count(1),
        ));
        rotator.load_from_strings(urls);
        rotator
    }

    fn start_server(
        rotator: Arc<Rotator>,
        retry_mode: RetryMode,
    ) -> (
        SocketAddr,
        Arc<ServerStats>,
        watch::Sender<bool>,
        JoinHandle<Result<()>>,
    ) {
        let dialer = Arc::new(Dialer::new(false, Duration::from_secs(2)));
        let server = Server::new(rotator, dialer, retry_mode, Duration::from_millis(20));
        let stats = server.stats();

        let listener = Server::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move { server.run(listener, shutdown_rx).await });

        (addr, stats, shutdown_tx, task)
    }

    async fn socks5_handshake(client: &mut TcpStream, host: &str, port: u16) -> [u8; 2] {
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
        request.extend_from_slice(host.as_bytes());
        request.extend_from_slice(&port.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut head = [0u8; 4];
        client.read_exact(&mut head).await.unwrap();
        let remaining = match head[3] {
            0x01 => 6,
            0x04 => 18,
            other => panic!("unexpected ATYP in reply: {}", other),
        };
        let mut rest = vec![0u8; remaining];
        client.read_exact(&mut rest).await.unwrap();

        [head[0], head[1]]
    }

    fn spawn_mock_socks5_upstream(listener: TcpListener) -> JoinHandle<(String, Vec<u8>)> {
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();

            let mut greeting = [0u8; 3];
            conn.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            conn.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 5];
            conn.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..4], &[0x05, 0x01, 0x00, 0x03]);
            let mut rest = vec![0u8; head[4] as usize + 2];
            conn.read_exact(&mut rest).await.unwrap();
            let domain = String::from_utf8(rest[..rest.len() - 2].to_vec()).unwrap();

            conn.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();

            let mut payload = [0u8; 5];
            conn.read_exact(&mut payload).await.unwrap();
            conn.write_all(b"world").await.unwrap();

            (domain, payload.to_vec())
        })
    }

    async fn read_http_head(conn: &mut TcpStream) -> Vec<u8> {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            conn.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        head
    }

    /// A reserved port with nothing listening behind it.
    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn test_round_trip_through_mock_socks5_upstream() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let mock = spawn_mock_socks5_upstream(upstream);

        let rotator = new_rotator(false, &[format!("socks5://{}", upstream_addr)]);
        let (addr, stats, shutdown_tx, task) = start_server(rotator, RetryMode::Bounded);

        let mut client = TcpStream::connect(addr).await.unwrap();
        let reply = socks5_handshake(&mut client, "example.com", 443).await;
        assert_eq!(reply, [0x05, 0x00]);

        client.write_all(b"hello").await.unwrap();
        let mut echo = [0u8; 5];
        client.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"world");

        let (domain, payload) = mock.await.unwrap();
        assert_eq!(domain, "example.com");
        assert_eq!(payload, b"hello");

        let snap = stats.snapshot();
        assert_eq!(snap.total_requests, 1);
        assert_eq!(snap.success_requests, 1);
        assert_eq!(snap.failed_requests, 0);

        drop(client);
        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_http_connect_failure_rotates() {
        let bad = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bad_addr = bad.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = bad.accept().await.unwrap();
            read_http_head(&mut conn).await;
            conn.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await.unwrap();
        });

        let good = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let good_addr = good.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = good.accept().await.unwrap();
            read_http_head(&mut conn).await;
            conn.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            let mut payload = [0u8; 4];
            conn.read_exact(&mut payload).await.unwrap();
            conn.write_all(&payload).await.unwrap();
        });

        let rotator = new_rotator(
            false,
            &[format!("http://{}", bad_addr), format!("http://{}", good_addr)],
        );
        let (addr, stats, shutdown_tx, task) = start_server(rotator.clone(), RetryMode::Bounded);

        let mut client = TcpStream::connect(addr).await.unwrap();
        let reply = socks5_handshake(&mut client, "target.example", 80).await;
        assert_eq!(reply, [0x05, 0x00]);

        client.write_all(b"ping").await.unwrap();
        let mut echo = [0u8; 4];
        client.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"ping");

        let endpoints = rotator.endpoints();
        assert!(!endpoints[0].is_alive());
        assert!(endpoints[1].is_alive());
        // The failed attempt counts against the endpoint, not the request.
        assert_eq!(endpoints[0].stats().failures, 0);

        let snap = stats.snapshot();
        assert_eq!(snap.total_requests, 1);
        assert_eq!(snap.success_requests, 1);
        assert_eq!(snap.failed_requests, 0);

        drop(client);
        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_all_dead_replies_host_unreachable() {
        let port = closed_port().await;
        let rotator = new_rotator(true, &[format!("http://127.0.0.1:{}", port)]);
        let (addr, stats, shutdown_tx, task) = start_server(rotator.clone(), RetryMode::Bounded);

        let mut client = TcpStream::connect(addr).await.unwrap();
        let reply = socks5_handshake(&mut client, "target.example", 80).await;
        assert_eq!(reply, [0x05, 0x04]);

        assert_eq!(rotator.alive_count(), 0);
        // The final failed attempt lands on the endpoint.
        assert_eq!(rotator.endpoints()[0].stats().failures, 1);

        let snap = stats.snapshot();
        assert_eq!(snap.total_requests, 1);
        assert_eq!(snap.failed_requests, 1);
        assert_eq!(snap.success_requests, 0);

        drop(client);
        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bounded_retry_terminates_with_sticky_auto() {
        let port_a = closed_port().await;
        let port_b = closed_port().await;

        // Auto stickiness with keep-dead pins next() to the same dead
        // endpoint on every call; the driver must still give up.
        let rotator = Arc::new(Rotator::new(
            RotationStrategy::Sequential,
            false,
            RequestsPerProxy::Auto,
        ));
        rotator.load_from_strings(&[
            format!("http://127.0.0.1:{}", port_a),
            format!("http://127.0.0.1:{}", port_b),
        ]);
        let (addr, stats, shutdown_tx, task) = start_server(rotator, RetryMode::Bounded);

        let mut client = TcpStream::connect(addr).await.unwrap();
        let reply = tokio::time::timeout(
            Duration::from_secs(5),
            socks5_handshake(&mut client, "target.example", 80),
        )
        .await
        .expect("retry driver did not terminate");
        assert_eq!(reply, [0x05, 0x04]);

        let snap = stats.snapshot();
        assert_eq!(snap.total_requests, 1);
        assert_eq!(snap.failed_requests, 1);

        drop(client);
        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_persistent_mode_cancelled_by_shutdown() {
        let port = closed_port().await;
        let rotator = new_rotator(false, &[format!("http://127.0.0.1:{}", port)]);
        let (addr, _stats, shutdown_tx, task) = start_server(rotator, RetryMode::Persistent);

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        let mut request = vec![0x05, 0x01, 0x00, 0x03, 14];
        request.extend_from_slice(b"target.example");
        request.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        // Let the retry loop spin a few times, then pull the plug.
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();

        let mut head = [0u8; 4];
        client.read_exact(&mut head).await.unwrap();
        assert_eq!(head[0], 0x05);
        assert_eq!(head[1], 0x01);

        drop(client);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejects_unsupported_command() {
        let rotator = new_rotator(false, &["http://127.0.0.1:1".to_string()]);
        let (addr, stats, shutdown_tx, task) = start_server(rotator, RetryMode::Bounded);

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        // BIND is not supported.
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();

        let mut head = [0u8; 4];
        client.read_exact(&mut head).await.unwrap();
        assert_eq!(head[1], 0x07);

        // The request never reached the dial phase.
        assert_eq!(stats.snapshot().total_requests, 0);

        drop(client);
        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_rejects_unsupported_address_type() {
        let rotator = new_rotator(false, &["http://127.0.0.1:1".to_string()]);
        let (addr, _stats, shutdown_tx, task) = start_server(rotator, RetryMode::Bounded);

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        client
            .write_all(&[0x05, 0x01, 0x00, 0x06, 0, 80])
            .await
            .unwrap();

        let mut head = [0u8; 4];
        client.read_exact(&mut head).await.unwrap();
        assert_eq!(head[1], 0x08);

        drop(client);
        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_active_conns_returns_to_zero() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let mock = spawn_mock_socks5_upstream(upstream);

        let rotator = new_rotator(false, &[format!("socks5://{}", upstream_addr)]);
        let (addr, stats, shutdown_tx, task) = start_server(rotator, RetryMode::Bounded);

        let mut client = TcpStream::connect(addr).await.unwrap();
        socks5_handshake(&mut client, "example.com", 443).await;
        assert_eq!(stats.snapshot().active_conns, 1);

        client.write_all(b"hello").await.unwrap();
        let mut echo = [0u8; 5];
        client.read_exact(&mut echo).await.unwrap();
        mock.await.unwrap();

        drop(client);
        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(stats.snapshot().active_conns, 0);
    }
}
