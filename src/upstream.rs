//! Upstream proxy descriptor and auth helpers (C1)

use base64::Engine;
use std::collections::HashMap;

/// An upstream proxy this engine may hop through on the way to origin.
///
/// Immutable value type: build one with [`Upstream::new`] and the builder
/// methods, then hand it to a route or a `defaultUpstream` config slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    /// `hostname:port` of the upstream proxy itself.
    pub host: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Whether to speak TLS to the upstream proxy. Defaults to `false`;
    /// chained SSL-bump peers negotiate TLS on the CONNECT tunnel itself,
    /// not on the hop to the upstream proxy.
    pub use_https: bool,
    /// Extra headers sent on every outbound CONNECT through this upstream
    /// (partitioning/affinity headers, for example).
    pub connect_headers: HashMap<String, String>,
}

impl Upstream {
    pub fn new(host: impl Into<String>) -> Self {
        Upstream {
            host: host.into(),
            username: None,
            password: None,
            use_https: false,
            connect_headers: HashMap::new(),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_https(mut self, use_https: bool) -> Self {
        self.use_https = use_https;
        self
    }

    pub fn with_connect_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.connect_headers.insert(name.into(), value.into());
        self
    }

    /// `Proxy-Authorization: Basic base64(user:pass)`, when credentials are set.
    pub fn auth_header(&self) -> Option<String> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => {
                let creds = format!("{}:{}", user, pass);
                let encoded = base64::engine::general_purpose::STANDARD.encode(creds);
                Some(format!("Basic {}", encoded))
            }
            _ => None,
        }
    }

    /// `http://` or `https://` URL pointing at this upstream, for client
    /// agents that want a single connect-to target.
    pub fn proxy_url(&self) -> String {
        let scheme = if self.use_https { "https" } else { "http" };
        format!("{}://{}", scheme, self.host)
    }
}
