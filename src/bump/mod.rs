//! SSL bump proxy: re-terminate the client's TLS on a freshly minted leaf,
//! re-originate a second TLS session to origin, and splice the two (C7).
//!
//! The source implementation loops decrypted bytes through its own HTTP
//! listener over loopback so the existing HTTP parser can be reused; that
//! loopback is a convenience, not a requirement, when the re-termination
//! already hands you a cleartext stream in-process. This engine instead
//! exposes a `handle_tls` hook directly over the two re-negotiated
//! streams, defaulting to a plain bidirectional splice.

use crate::certstore::CertStore;
use crate::common::error::{Error, ErrorClass, Result};
use crate::common::net::{configure_tcp_stream, copy_bidirectional, split_host_port, MaybeTlsStream};
use crate::engine::connect::{ssl_connect_with_retry, ConnectParams};
use crate::engine::events::EventHooks;
use crate::engine::{AuthenticateHook, MatchRouteHook, RequestHead};
use crate::upstream::Upstream;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, warn};
use uuid::Uuid;

pub type HandleTlsHook = Arc<
    dyn Fn(
            ServerTlsStream<TcpStream>,
            ClientTlsStream<MaybeTlsStream>,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>>
        + Send
        + Sync,
>;

/// Overridable source of trusted CA PEMs for `negotiate_tls_outward`
/// (§4.5 step 3, `ca = getCACertificates()`); defaults to just the
/// cert store's own signing CA, but an embedder can add extras (e.g. a
/// corporate root) for the outward hop to origin/upstream.
pub type GetCaCertificatesHook = Arc<dyn Fn() -> Vec<String> + Send + Sync>;

pub struct BumpProxyConfig {
    pub listen: SocketAddr,
    pub connect_timeout: Duration,
    pub connect_retry_attempts: usize,
    pub connect_retry_interval: Duration,
    pub default_upstream: Option<Upstream>,
    /// Read timeout for the outward TLS handshake to origin.
    pub remote_tls_handshake_timeout: Duration,
}

/// CONNECT-only engine that performs SSL bumping instead of relaying an
/// opaque tunnel.
pub struct BumpProxy {
    config: BumpProxyConfig,
    cert_store: Arc<CertStore>,
    hooks: EventHooks,
    authenticate: Option<AuthenticateHook>,
    match_route: MatchRouteHook,
    handle_tls: HandleTlsHook,
    get_ca_certificates: GetCaCertificatesHook,
    running: AtomicBool,
    client_tasks: DashMap<u64, tokio::task::JoinHandle<()>>,
    next_client_id: AtomicU64,
    bound_addr_tx: tokio::sync::watch::Sender<Option<SocketAddr>>,
    bound_addr_rx: tokio::sync::watch::Receiver<Option<SocketAddr>>,
}

impl BumpProxy {
    pub fn new(config: BumpProxyConfig, cert_store: Arc<CertStore>) -> Self {
        let default_upstream = config.default_upstream.clone();
        let (bound_addr_tx, bound_addr_rx) = tokio::sync::watch::channel(None);
        let default_ca_store = cert_store.clone();
        BumpProxy {
            config,
            cert_store,
            hooks: EventHooks::default(),
            authenticate: None,
            match_route: Arc::new(move |_host| default_upstream.clone()),
            handle_tls: Arc::new(|server, client| Box::pin(default_handle_tls(server, client))),
            get_ca_certificates: Arc::new(move || vec![default_ca_store.ca_cert_pem().to_string()]),
            running: AtomicBool::new(false),
            client_tasks: DashMap::new(),
            next_client_id: AtomicU64::new(0),
            bound_addr_tx,
            bound_addr_rx,
        }
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

    pub fn set_authenticate(&mut self, hook: AuthenticateHook) {
        self.authenticate = Some(hook);
    }

    pub fn set_match_route(&mut self, hook: MatchRouteHook) {
        self.match_route = hook;
    }

    /// Override what happens once both TLS legs are up; defaults to a
    /// plain splice.
    pub fn set_handle_tls(&mut self, hook: HandleTlsHook) {
        self.handle_tls = hook;
    }

    pub fn hooks(&mut self) -> &mut EventHooks {
        &mut self.hooks
    }

    /// Override the trusted CA PEMs for the outward TLS handshake; default
    /// is just the cert store's own signing CA (so chained bump proxies
    /// trust each other's leaves), on top of the platform's default roots
    /// which `build_client_tls_config` always seeds.
    pub fn set_get_ca_certificates(&mut self, hook: GetCaCertificatesHook) {
        self.get_ca_certificates = hook;
    }

    pub fn get_ca_certificates(&self) -> Vec<String> {
        (self.get_ca_certificates)()
    }

    pub async fn start(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen).await?;
        let addr = listener.local_addr()?;
        tracing::info!(%addr, "SSL bump proxy listening");
        self.running.store(true, Ordering::SeqCst);
        let _ = self.bound_addr_tx.send(Some(addr));

        while self.running.load(Ordering::SeqCst) {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let proxy = self.clone();
                    let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
                    let handle = tokio::spawn(async move {
                        proxy.handle_connection(stream, peer_addr).await;
                        proxy.client_tasks.remove(&client_id);
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

    /// Stop accepting new connections; with `force`, also abort every
    /// currently tracked bump session instead of letting it drain.
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
        if let Err(e) = self.process_connect(stream, peer_addr).await {
            match e.class() {
                ErrorClass::Mute => {}
                ErrorClass::Warn => warn!(peer = %peer_addr, error = %e, "bump connection ended"),
                ErrorClass::Error => error!(peer = %peer_addr, error = %e, "bump connection failed"),
            }
            self.hooks.emit_error(&e);
        }
    }

    async fn process_connect(&self, mut stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        let head = read_connect_request(&mut stream).await?;

        if head.method != "CONNECT" {
            write_plain_response(&mut stream, 400, "Bad Request", &[]).await.ok();
            return Err(Error::protocol("SSL bump proxy only accepts CONNECT"));
        }

        if let Some(authenticate) = &self.authenticate {
            if let Err(e) = authenticate(&head) {
                write_plain_response(&mut stream, e.status(), e.reason_phrase(), &[])
                    .await
                    .ok();
                return Err(e);
            }
        }

        let target = head.target.clone();
        let (hostname, _port) = split_host_port(&target, 443)?;
        let upstream = (self.match_route)(&target);
        let generated_id = Uuid::new_v4().to_string();
        let partition_id = head.header("x-partition-id").map(|s| s.to_string());

        debug!(peer = %peer_addr, %target, connection_id = %generated_id, "bump CONNECT");

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

        let (outbound, adopted_id) = match ssl_connect_with_retry(&params, &self.hooks).await {
            Ok(outbound) => outbound,
            Err(e) => {
                write_plain_response(&mut stream, e.status(), "Bad Gateway", &[]).await.ok();
                return Err(e);
            }
        };
        let connection_id = adopted_id.unwrap_or(generated_id);

        let remote_tls = match self.negotiate_tls_outward(outbound, &hostname).await {
            Ok(tls) => tls,
            Err(e) => {
                write_plain_response(&mut stream, 502, "Bad Gateway", &[]).await.ok();
                return Err(e);
            }
        };

        let server_config = match self.cert_store.server_config(&hostname) {
            Ok(cfg) => cfg,
            Err(e) => {
                write_plain_response(&mut stream, 502, "Bad Gateway", &[]).await.ok();
                return Err(e);
            }
        };

        write_plain_response(
            &mut stream,
            200,
            "Connection Established",
            &[("X-Connection-Id", connection_id.as_str())],
        )
        .await?;

        // The 200 OK above went out on the plain socket; the client's TLS
        // handshake lands on top of it, transparently, from here on.
        let acceptor = TlsAcceptor::from(server_config);
        let client_tls = acceptor
            .accept(stream)
            .await
            .map_err(|e| Error::tls(e.to_string()))?;

        (self.handle_tls)(client_tls, remote_tls).await
    }

    async fn negotiate_tls_outward(&self, outbound: MaybeTlsStream, hostname: &str) -> Result<ClientTlsStream<MaybeTlsStream>> {
        let config = build_client_tls_config(&self.get_ca_certificates())?;
        let connector = TlsConnector::from(config);
        let server_name = rustls_pki_types::ServerName::try_from(hostname.to_string())
            .map_err(|_| Error::tls(format!("invalid DNS name '{}'", hostname)))?;

        tokio::time::timeout(
            self.config.remote_tls_handshake_timeout,
            connector.connect(server_name, outbound),
        )
        .await
        .map_err(|_| Error::ConnectTimeout(self.config.remote_tls_handshake_timeout))?
        .map_err(|_| Error::RemoteNotAuthorized)
    }
}

async fn default_handle_tls(server: ServerTlsStream<TcpStream>, client: ClientTlsStream<MaybeTlsStream>) -> Result<()> {
    let mut server = server;
    let mut client = client;
    copy_bidirectional(&mut server, &mut client).await?;
    Ok(())
}

/// Root store seeded with platform defaults plus any extra trusted CA PEMs
/// (the store's own signing CA, for chained bump proxies).
fn build_client_tls_config(extra_ca_pems: &[String]) -> Result<Arc<rustls::ClientConfig>> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    for pem in extra_ca_pems {
        let mut reader = std::io::Cursor::new(pem.as_bytes());
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|e| Error::tls(e.to_string()))?;
            roots.add(cert).map_err(|e| Error::tls(e.to_string()))?;
        }
    }

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

async fn read_connect_request(stream: &mut TcpStream) -> Result<RequestHead> {
    let mut buf = Vec::with_capacity(512);
    let mut tmp = [0u8; 512];
    loop {
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return Err(Error::protocol("connection closed before CONNECT request"));
        }
        buf.extend_from_slice(&tmp[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > 16 * 1024 {
            return Err(Error::protocol("CONNECT request too large"));
        }
    }

    let mut raw_headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut raw_headers);
    match req.parse(&buf) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return Err(Error::protocol("malformed CONNECT request")),
    }

    let method = req.method.unwrap_or_default().to_string();
    let target = req.path.unwrap_or_default().to_string();
    let headers = req
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).to_string()))
        .collect();

    Ok(RequestHead { method, target, headers })
}

async fn write_plain_response(
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
