//! HTTP-over-proxy agent (C3): rewrites requests to absolute-form and
//! sends them straight to the upstream, no tunnel involved.

use crate::common::error::{Error, Result};
use crate::upstream::Upstream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Speaks plain HTTP to `upstream`, rewriting every request into
/// absolute-form (`METHOD http://host/path HTTP/1.1`) the way a forward
/// proxy expects. One request per connection; keep-alive is disabled.
pub struct HttpProxyAgent {
    upstream: Upstream,
}

impl HttpProxyAgent {
    pub fn new(upstream: Upstream) -> Self {
        HttpProxyAgent { upstream }
    }

    pub async fn request(
        &self,
        method: &str,
        origin_host_port: &str,
        path: &str,
        extra_headers: &[(&str, &str)],
        body: &[u8],
    ) -> Result<HttpResponse> {
        let (host, port) = crate::common::net::split_host_port(&self.upstream.host, 80)?;
        let mut stream = TcpStream::connect((host.as_str(), port)).await?;

        let absolute_uri = format!("http://{}{}", origin_host_port, path);
        let mut request = format!("{} {} HTTP/1.1\r\n", method, absolute_uri);
        request.push_str(&format!("Host: {}\r\n", origin_host_port));
        request.push_str("Connection: close\r\n");
        if let Some(auth) = self.upstream.auth_header() {
            request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
        }
        for (name, value) in extra_headers {
            request.push_str(&format!("{}: {}\r\n", name, value));
        }
        if !body.is_empty() {
            request.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        request.push_str("\r\n");

        stream.write_all(request.as_bytes()).await?;
        if !body.is_empty() {
            stream.write_all(body).await?;
        }

        read_response(&mut stream).await
    }
}

pub(crate) async fn read_response<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> Result<HttpResponse> {
    let mut buf = Vec::with_capacity(1024);
    let mut tmp = [0u8; 1024];
    let header_end = loop {
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            if buf.is_empty() {
                return Err(Error::connection("connection closed before response"));
            }
            break buf.len();
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(idx) = find_header_end(&buf) {
            break idx;
        }
        if buf.len() > 64 * 1024 {
            return Err(Error::protocol("response headers too large"));
        }
    };

    let mut raw_headers = [httparse::EMPTY_HEADER; 64];
    let mut resp = httparse::Response::new(&mut raw_headers);
    let body_start = match resp.parse(&buf[..header_end.min(buf.len())]) {
        Ok(httparse::Status::Complete(offset)) => offset,
        _ => return Err(Error::protocol("malformed HTTP response")),
    };

    let status = resp.code.unwrap_or(0);
    let headers: Vec<(String, String)> = resp
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).to_string()))
        .collect();

    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok());

    let mut body = buf[body_start..].to_vec();
    if let Some(expected) = content_length {
        while body.len() < expected {
            let n = stream.read(&mut tmp).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&tmp[..n]);
        }
        body.truncate(expected);
    } else {
        loop {
            let n = stream.read(&mut tmp).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&tmp[..n]);
        }
    }

    Ok(HttpResponse { status, headers, body })
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|idx| idx + 4)
}
