//! Network utilities

use crate::common::error::{Error, Result};
use socket2::SockRef;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{self, AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use super::buffer;

/// Either a plain TCP stream or one wrapped in client TLS, so the outbound
/// connect paths (direct, or via an upstream with `use_https`) can share a
/// single concrete type downstream of the dial.
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Client TLS config trusting only the platform's default roots, for
/// speaking TLS directly to an upstream proxy (`Upstream.use_https`) or
/// through a client agent's CONNECT tunnel. Distinct from the bump
/// subsystem's outward config, which additionally trusts the signing CA.
pub fn default_tls_client_config() -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

/// Apply the socket options this engine wants on every TCP stream it owns,
/// inbound or outbound: disable Nagle for latency, enable keepalive, and
/// (on Linux) allow the listening socket to share its port across workers.
#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let _ = sock.set_reuse_port(true);
}

/// Copy data between two streams bidirectionally, propagating backpressure
/// and half-closing each direction independently as it drains to EOF.
pub async fn copy_bidirectional<A, B>(a: &mut A, b: &mut B) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    buffer::greedy_copy_bidirectional(a, b).await
}

/// Split `host:port` (port defaults to `default_port` when absent), the
/// same parsing the CONNECT and HTTP-forwarding paths apply to target
/// authorities and upstream `host` descriptors.
pub fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16)> {
    // IPv6 literal form `[::1]:443` carries its own colons; only split on the
    // last one, after the closing bracket if present.
    let search_from = authority.rfind(']').map(|idx| idx + 1).unwrap_or(0);
    match authority[search_from..].rfind(':') {
        Some(rel_idx) => {
            let idx = search_from + rel_idx;
            let host = authority[..idx].to_string();
            let port_str = &authority[idx + 1..];
            let port: u16 = port_str
                .parse()
                .map_err(|_| Error::address(format!("Invalid port in '{}'", authority)))?;
            Ok((host, port))
        }
        None => Ok((authority.to_string(), default_port)),
    }
}
