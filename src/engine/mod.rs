//! Base proxy engine: CONNECT tunneling and plain HTTP forwarding (C5)

pub mod connect;
pub mod events;

use crate::common::error::{Error, ErrorClass, Result};
use crate::common::net::{configure_tcp_stream, copy_bidirectional};
use crate::upstream::Upstream;
use connect::{ssl_connect_with_retry, ConnectParams};
use dashmap::DashMap;
use events::EventHooks;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Overridable top-of-handler auth check (§4.2): `Ok(())` admits the
/// request, `Err(e)` aborts it with `e.status()` (default 407) reported to
/// the client, letting an embedder signal anything from `401`/`403` to a
/// bespoke status instead of a bare reject/admit bool.
pub type AuthenticateHook = Arc<dyn Fn(&RequestHead) -> Result<()> + Send + Sync>;
pub type MatchRouteHook = Arc<dyn Fn(&str) -> Option<Upstream> + Send + Sync>;

/// Parsed request line and headers, handed to `authenticate` and
/// `match_route` before the engine decides whether this is a CONNECT
/// tunnel or a plain forward.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub struct EngineConfig {
    pub listen: SocketAddr,
    pub connect_timeout: Duration,
    pub connect_retry_attempts: usize,
    pub connect_retry_interval: Duration,
    pub default_upstream: Option<Upstream>,
}

struct TrackedConnection {
    #[allow(dead_code)]
    host: String,
    #[allow(dead_code)]
    opened_at: Instant,
}

/// Monotonic byte counters for the engine instance; reset only by process
/// restart (§3 `ProxyStats`).
#[derive(Default)]
pub struct ProxyStats {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl ProxyStats {
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    fn record(&self, read: u64, written: u64) {
        self.bytes_read.fetch_add(read, Ordering::Relaxed);
        self.bytes_written.fetch_add(written, Ordering::Relaxed);
    }
}

/// Accepts HTTP-proxy-style connections and dispatches them as CONNECT
/// tunnels or plain forwards, through whatever `match_route`/`authenticate`
/// hooks the embedding proxy variant installs. `RoutingProxy` overrides
/// `match_route`; `BumpProxy` wraps the CONNECT path with TLS
/// re-termination instead of a raw relay.
pub struct Engine {
    config: EngineConfig,
    running: AtomicBool,
    connections: DashMap<String, TrackedConnection>,
    client_tasks: DashMap<u64, tokio::task::JoinHandle<()>>,
    next_client_id: AtomicU64,
    bound_addr_tx: watch::Sender<Option<SocketAddr>>,
    bound_addr_rx: watch::Receiver<Option<SocketAddr>>,
    pub stats: ProxyStats,
    pub hooks: EventHooks,
    authenticate: Option<AuthenticateHook>,
    match_route: MatchRouteHook,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let default_upstream = config.default_upstream.clone();
        let (bound_addr_tx, bound_addr_rx) = watch::channel(None);
        Engine {
            config,
            running: AtomicBool::new(false),
            connections: DashMap::new(),
            client_tasks: DashMap::new(),
            next_client_id: AtomicU64::new(0),
            bound_addr_tx,
            bound_addr_rx,
            stats: ProxyStats::default(),
            hooks: EventHooks::default(),
            authenticate: None,
            match_route: Arc::new(move |_host| default_upstream.clone()),
        }
    }

    pub fn set_authenticate(&mut self, hook: AuthenticateHook) {
        self.authenticate = Some(hook);
    }

    pub fn set_match_route(&mut self, hook: MatchRouteHook) {
        self.match_route = hook;
    }

    pub fn match_route(&self, host: &str) -> Option<Upstream> {
        (self.match_route)(host)
    }

    /// Configured listen address, or the OS-assigned address once `start`
    /// has bound its listener (relevant when `listen` specifies port `0`).
    pub fn local_addr(&self) -> SocketAddr {
        self.bound_addr_rx.borrow().unwrap_or(self.config.listen)
    }

    /// Resolve once the listener has actually bound. Prefer this over
    /// `local_addr` in tests that bind an ephemeral port.
    pub async fn bound_addr(&self) -> SocketAddr {
        let mut rx = self.bound_addr_rx.clone();
        loop {
            if let Some(addr) = *rx.borrow() {
                return addr;
            }
            if rx.changed().await.is_err() {
                return self.config.listen;
            }
        }
    }

    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    pub async fn start(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "proxy engine listening");
        self.running.store(true, Ordering::SeqCst);
        let _ = self.bound_addr_tx.send(Some(addr));

        while self.running.load(Ordering::SeqCst) {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let engine = self.clone();
                    let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
                    let handle = tokio::spawn(async move {
                        engine.handle_connection(stream, peer_addr).await;
                        engine.client_tasks.remove(&client_id);
                    });
                    self.client_tasks.insert(client_id, handle);
                }
                Err(e) => {
                    if self.running.load(Ordering::SeqCst) {
                        error!(error = %e, "accept failed");
                    }
                }
            }
        }
        Ok(())
    }

    /// Stop accepting new connections; with `force`, also destroy every
    /// currently tracked inbound client socket, ending in-flight transfers
    /// with a reset instead of draining them.
    pub fn shutdown(&self, force: bool) {
        self.running.store(false, Ordering::SeqCst);
        if force {
            for entry in self.client_tasks.iter() {
                entry.value().abort();
            }
            self.client_tasks.clear();
        }
    }

    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream, peer_addr: SocketAddr) {
        configure_tcp_stream(&stream);
        if let Err(e) = self.process_connection(&mut stream, peer_addr).await {
            match e.class() {
                ErrorClass::Mute => {}
                ErrorClass::Warn => warn!(peer = %peer_addr, error = %e, "connection ended"),
                ErrorClass::Error => error!(peer = %peer_addr, error = %e, "connection failed"),
            }
            self.hooks.emit_error(&e);
        }
    }

    async fn process_connection(&self, stream: &mut TcpStream, peer_addr: SocketAddr) -> Result<()> {
        let (head, leftover) = read_request_head(stream).await?;

        if let Some(authenticate) = &self.authenticate {
            if let Err(e) = authenticate(&head) {
                let status = e.status();
                let headers: &[(&str, &str)] = if status == 407 {
                    &[("Proxy-Authenticate", "Basic realm=\"proxy\"")]
                } else {
                    &[]
                };
                write_response(stream, status, e.reason_phrase(), headers).await.ok();
                return Err(e);
            }
        }

        if head.method.eq_ignore_ascii_case("CONNECT") {
            self.handle_connect(stream, &head, &leftover, peer_addr).await
        } else {
            self.handle_http(stream, &head, &leftover, peer_addr).await
        }
    }

    async fn handle_connect(
        &self,
        stream: &mut TcpStream,
        head: &RequestHead,
        leftover: &[u8],
        peer_addr: SocketAddr,
    ) -> Result<()> {
        let target = head.target.clone();
        let upstream = self.match_route(&target);
        let generated_id = Uuid::new_v4().to_string();
        let partition_id = head.header("x-partition-id").map(|s| s.to_string());

        debug!(peer = %peer_addr, %target, connection_id = %generated_id, "CONNECT");

        let params = ConnectParams {
            connection_id: &generated_id,
            host: &target,
            default_port: 443,
            upstream: upstream.as_ref(),
            connect_timeout: self.config.connect_timeout,
            retry_attempts: self.config.connect_retry_attempts,
            retry_interval: self.config.connect_retry_interval,
            partition_id: partition_id.as_deref(),
        };

        let (mut remote, adopted_id) = match ssl_connect_with_retry(&params, &self.hooks).await {
            Ok(remote) => remote,
            Err(e) => {
                write_response(stream, e.status(), "Bad Gateway", &[]).await.ok();
                return Err(e);
            }
        };
        // Adopt the upstream's own id, if it echoed one, so a chain of
        // proxies shares a single opaque handle end to end.
        let connection_id = adopted_id.unwrap_or(generated_id);

        if !leftover.is_empty() {
            remote.write_all(leftover).await?;
        }

        self.connections.insert(
            connection_id.clone(),
            TrackedConnection {
                host: target.clone(),
                opened_at: Instant::now(),
            },
        );

        write_response(
            stream,
            200,
            "Connection Established",
            &[("X-Connection-Id", &connection_id)],
        )
        .await?;

        let result = copy_bidirectional(stream, &mut remote).await;
        self.connections.remove(&connection_id);

        match result {
            Ok((sent, received)) => {
                self.stats.record(received, sent);
                debug!(%connection_id, sent, received, "CONNECT tunnel closed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_http(
        &self,
        stream: &mut TcpStream,
        head: &RequestHead,
        leftover: &[u8],
        peer_addr: SocketAddr,
    ) -> Result<()> {
        let (host_port, path) = parse_absolute_uri(&head.target)?;
        let upstream = self.match_route(&host_port);

        debug!(peer = %peer_addr, method = %head.method, target = %head.target, "HTTP");

        let connection_id = Uuid::new_v4().to_string();
        let params = ConnectParams {
            connection_id: &connection_id,
            host: &host_port,
            default_port: 80,
            upstream: upstream.as_ref(),
            connect_timeout: self.config.connect_timeout,
            retry_attempts: self.config.connect_retry_attempts,
            retry_interval: self.config.connect_retry_interval,
            partition_id: None,
        };

        let (mut remote, _adopted_id) = match ssl_connect_with_retry(&params, &self.hooks).await {
            Ok(remote) => remote,
            Err(e) => {
                write_response(stream, e.status(), "Bad Gateway", &[]).await.ok();
                return Err(e);
            }
        };

        let mut request = format!("{} {} HTTP/1.1\r\n", head.method, path);
        request.push_str(&format!("Host: {}\r\n", host_port));
        if let Some(upstream) = &upstream {
            if let Some(auth) = upstream.auth_header() {
                request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
            }
        }
        for (name, value) in &head.headers {
            if !is_hop_by_hop_header(name) && !name.eq_ignore_ascii_case("host") {
                request.push_str(&format!("{}: {}\r\n", name, value));
            }
        }
        request.push_str("\r\n");

        remote.write_all(request.as_bytes()).await?;
        if !leftover.is_empty() {
            remote.write_all(leftover).await?;
        }

        let (sent, received) = copy_bidirectional(stream, &mut remote).await?;
        self.stats.record(received, sent);
        debug!(%connection_id, sent, received, "HTTP forward closed");
        Ok(())
    }
}

/// Read up to the end of the request headers, returning the parsed head
/// and any body bytes that arrived in the same read (so they aren't
/// dropped on the floor once the socket is handed to the relay).
async fn read_request_head(stream: &mut TcpStream) -> Result<(RequestHead, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut tmp = [0u8; 512];
    loop {
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return Err(Error::protocol("connection closed before request head"));
        }
        buf.extend_from_slice(&tmp[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > 16 * 1024 {
            return Err(Error::protocol("request head too large"));
        }
    }

    let mut raw_headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut raw_headers);
    let body_start = match req.parse(&buf) {
        Ok(httparse::Status::Complete(offset)) => offset,
        Ok(httparse::Status::Partial) => return Err(Error::protocol("incomplete HTTP request")),
        Err(e) => return Err(Error::protocol(format!("malformed HTTP request: {}", e))),
    };

    let method = req
        .method
        .ok_or_else(|| Error::protocol("missing method"))?
        .to_string();
    let target = req
        .path
        .ok_or_else(|| Error::protocol("missing request target"))?
        .to_string();
    let headers = req
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).to_string()))
        .collect();

    let leftover = buf[body_start..].to_vec();
    Ok((RequestHead { method, target, headers }, leftover))
}

async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    reason: &str,
    extra_headers: &[(&str, &str)],
) -> Result<()> {
    let mut resp = format!("HTTP/1.1 {} {}\r\n", status, reason);
    for (name, value) in extra_headers {
        resp.push_str(&format!("{}: {}\r\n", name, value));
    }
    if status != 200 {
        resp.push_str("Connection: close\r\n");
    }
    resp.push_str("\r\n");
    stream.write_all(resp.as_bytes()).await?;
    Ok(())
}

/// Split an absolute-form request target (`http://host[:port]/path`) into
/// `host:port` and `path`. HTTPS targets must arrive via CONNECT instead.
fn parse_absolute_uri(target: &str) -> Result<(String, String)> {
    let rest = target
        .strip_prefix("http://")
        .ok_or_else(|| Error::protocol("HTTPS requests must use CONNECT"))?;
    let (host_port, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    Ok((host_port.to_string(), path.to_string()))
}

fn is_hop_by_hop_header(header: &str) -> bool {
    matches!(
        header.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "proxy-connection"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_absolute_http_uri() {
        let (host_port, path) = parse_absolute_uri("http://example.com:8080/a/b").unwrap();
        assert_eq!(host_port, "example.com:8080");
        assert_eq!(path, "/a/b");
    }

    #[test]
    fn defaults_path_to_root() {
        let (host_port, path) = parse_absolute_uri("http://example.com").unwrap();
        assert_eq!(host_port, "example.com");
        assert_eq!(path, "/");
    }

    #[test]
    fn rejects_https_scheme() {
        assert!(parse_absolute_uri("https://example.com/").is_err());
    }

    #[test]
    fn recognizes_hop_by_hop_headers() {
        assert!(is_hop_by_hop_header("Connection"));
        assert!(is_hop_by_hop_header("Proxy-Connection"));
        assert!(!is_hop_by_hop_header("Content-Type"));
    }

    #[tokio::test]
    async fn reads_request_head_with_leftover_body() {
        use tokio::net::{TcpListener, TcpStream};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(b"POST http://example.com/x HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap();
        });

        let (mut server_stream, _) = listener.accept().await.unwrap();
        let (head, leftover) = read_request_head(&mut server_stream).await.unwrap();
        client.await.unwrap();

        assert_eq!(head.method, "POST");
        assert_eq!(head.target, "http://example.com/x");
        assert_eq!(leftover, b"hello");
    }

    #[tokio::test]
    async fn authenticate_hook_custom_status_reaches_client() {
        use tokio::net::{TcpListener, TcpStream};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut engine = Engine::new(EngineConfig {
            listen: addr,
            connect_timeout: Duration::from_secs(1),
            connect_retry_attempts: 0,
            connect_retry_interval: Duration::from_millis(10),
            default_upstream: None,
        });
        engine.set_authenticate(Arc::new(|_head| {
            Err(Error::auth_with_status("forbidden host", 403))
        }));

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
                .await
                .unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let (mut server_stream, peer_addr) = listener.accept().await.unwrap();
        let _ = engine.process_connection(&mut server_stream, peer_addr).await;
        drop(server_stream);
        let response = client.await.unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 403 Forbidden"), "{}", response);
    }
}
