//! HTTPS-over-proxy agent (C3): CONNECT handshake through the upstream,
//! then a client TLS session wrapped around the tunneled socket.

use super::http_agent::{read_response, HttpResponse};
use crate::common::error::{Error, Result};
use crate::common::net::{default_tls_client_config, split_host_port, MaybeTlsStream};
use crate::upstream::Upstream;
use rustls_pki_types::ServerName;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};

/// Speaks HTTPS through `upstream`'s CONNECT tunnel: after a `200` on the
/// plain tunnel, wraps the socket in client TLS with ALPN `http/1.1`.
pub struct HttpsProxyAgent {
    upstream: Upstream,
    tls_config: Arc<rustls::ClientConfig>,
}

impl HttpsProxyAgent {
    pub fn new(upstream: Upstream, tls_config: Arc<rustls::ClientConfig>) -> Self {
        HttpsProxyAgent { upstream, tls_config }
    }

    async fn connect_tunnel(&self, origin_host_port: &str) -> Result<TlsStream<MaybeTlsStream>> {
        let default_proxy_port = if self.upstream.use_https { 443 } else { 8080 };
        let (proxy_host, proxy_port) = split_host_port(&self.upstream.host, default_proxy_port)?;
        let tcp = TcpStream::connect((proxy_host.as_str(), proxy_port)).await?;

        let mut stream: MaybeTlsStream = if self.upstream.use_https {
            let connector = TlsConnector::from(default_tls_client_config());
            let server_name = ServerName::try_from(proxy_host.clone())
                .map_err(|_| Error::tls(format!("invalid upstream hostname '{}'", proxy_host)))?;
            let tls = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| Error::tls(e.to_string()))?;
            MaybeTlsStream::Tls(Box::new(tls))
        } else {
            MaybeTlsStream::Plain(tcp)
        };

        let mut request = format!(
            "CONNECT {origin_host_port} HTTP/1.1\r\nHost: {origin_host_port}\r\n"
        );
        if let Some(auth) = self.upstream.auth_header() {
            request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await?;

        let mut buf = Vec::with_capacity(256);
        let mut tmp = [0u8; 256];
        loop {
            let n = stream.read(&mut tmp).await?;
            if n == 0 {
                return Err(Error::connection("upstream closed during CONNECT"));
            }
            buf.extend_from_slice(&tmp[..n]);
            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
            if buf.len() > 8192 {
                return Err(Error::protocol("CONNECT response too large"));
            }
        }

        let head = String::from_utf8_lossy(&buf);
        let status: u16 = head
            .lines()
            .next()
            .unwrap_or("")
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(502);

        if status != 200 {
            return Err(Error::upstream_failed(self.upstream.host.clone(), status));
        }

        let (hostname, _) = split_host_port(origin_host_port, 443)?;
        let server_name = ServerName::try_from(hostname)
            .map_err(|_| Error::tls("invalid origin hostname"))?;

        let connector = TlsConnector::from(self.tls_config.clone());
        connector
            .connect(server_name, stream)
            .await
            .map_err(|e| Error::tls(e.to_string()))
    }

    pub async fn request(
        &self,
        method: &str,
        origin_host_port: &str,
        path: &str,
        extra_headers: &[(&str, &str)],
        body: &[u8],
    ) -> Result<HttpResponse> {
        let mut tls = self.connect_tunnel(origin_host_port).await?;

        let mut request = format!("{} {} HTTP/1.1\r\n", method, path);
        request.push_str(&format!("Host: {}\r\n", origin_host_port));
        request.push_str("Connection: close\r\n");
        for (name, value) in extra_headers {
            request.push_str(&format!("{}: {}\r\n", name, value));
        }
        if !body.is_empty() {
            request.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        request.push_str("\r\n");

        tls.write_all(request.as_bytes()).await?;
        if !body.is_empty() {
            tls.write_all(body).await?;
        }

        read_response(&mut tls).await
    }
}
