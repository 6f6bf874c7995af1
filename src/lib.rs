//! Forward HTTP/HTTPS proxy framework: plain forwarding, CONNECT
//! tunneling, host-based routing to upstream proxies, and SSL bumping via
//! dynamically minted CA-signed leaf certificates.
//!
//! # Architecture
//!
//! ```text
//! +-------------+     +---------------+     +-------------+
//! |  upstream   |     |   route (C6)  |     | certstore   |
//! | (C1 descr.) |     | host -> proxy |     |   (C4 LRU)  |
//! +------+------+     +-------+-------+     +------+------+
//!        |                    |                    |
//!        +--------------------+--------------------+
//!                             |
//!                      +------v------+
//!                      | engine (C5) |  CONNECT + HTTP forward
//!                      +------+------+
//!                             |
//!               +-------------+-------------+
//!               |                           |
//!        +------v------+            +-------v-------+
//!        |  bump (C7)  |            |  client (C3)  |
//!        | TLS re-term |            | proxy agents  |
//!        +-------------+            +---------------+
//! ```

pub mod bump;
pub mod certstore;
pub mod client;
pub mod common;
pub mod config;
pub mod engine;
pub mod route;
pub mod upstream;

pub use common::error::{Error, ErrorClass, Result};
pub use config::FileConfig;
pub use upstream::Upstream;

use bump::{BumpProxy, BumpProxyConfig};
use certstore::{CertStore, CertStoreConfig};
use engine::{Engine, EngineConfig};
use parking_lot::RwLock;
use route::RoutingTable;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Owns the shared routing table, the plain engine, and (when configured)
/// the SSL-bump engine, wiring `match_route` for both from one table.
pub struct ProxyGateway {
    routes: Arc<RwLock<RoutingTable>>,
    engine: Arc<Engine>,
    bump: Option<Arc<BumpProxy>>,
    cert_store: Option<Arc<CertStore>>,
}

impl ProxyGateway {
    pub fn new(config: FileConfig) -> Result<Self> {
        let default_upstream: Option<Upstream> =
            config.default_upstream.clone().map(Upstream::from);

        let mut table = RoutingTable::new(default_upstream.clone());
        for route_cfg in &config.routes {
            let upstream = route_cfg.upstream.clone().map(Upstream::from);
            let route = route::Route::new(route_cfg.label.clone(), route_cfg.host_pattern.clone(), upstream)?;
            table.insert_route(route, None);
        }
        let routes = Arc::new(RwLock::new(table));

        let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
        let connect_retry_interval = Duration::from_millis(config.connect_retry_interval_ms);

        let mut engine = Engine::new(EngineConfig {
            listen: config.listen,
            connect_timeout,
            connect_retry_attempts: config.connect_retry_attempts,
            connect_retry_interval,
            default_upstream: default_upstream.clone(),
        });

        let routes_for_match = routes.clone();
        engine.set_match_route(Arc::new(move |host| routes_for_match.read().match_route(host)));

        if let Some(auth) = &config.auth {
            let auth = auth.clone();
            engine.set_authenticate(Arc::new(move |req| authenticate_basic(req, &auth)));
        }

        let mut cert_store = None;
        let mut bump = None;

        if let (Some(bump_listen), Some(cert_cfg)) = (config.bump_listen, &config.cert_store) {
            let ca_cert_pem = std::fs::read_to_string(&cert_cfg.ca_cert_path)?;
            let ca_key_pem = std::fs::read_to_string(&cert_cfg.ca_key_path)?;
            let leaf_key_pem = cert_cfg
                .leaf_key_path
                .as_ref()
                .map(std::fs::read_to_string)
                .transpose()?;

            let store = Arc::new(CertStore::new(CertStoreConfig {
                ca_cert_pem,
                ca_key_pem,
                leaf_key_pem,
                cert_ttl_days: cert_cfg.cert_ttl_days,
                cert_cache_max_entries: cert_cfg.cert_cache_max_entries,
            })?);

            let mut bump_proxy = BumpProxy::new(
                BumpProxyConfig {
                    listen: bump_listen,
                    connect_timeout,
                    connect_retry_attempts: config.connect_retry_attempts,
                    connect_retry_interval,
                    default_upstream,
                    remote_tls_handshake_timeout: Duration::from_secs(60),
                },
                store.clone(),
            );

            let routes_for_bump = routes.clone();
            bump_proxy.set_match_route(Arc::new(move |host| routes_for_bump.read().match_route(host)));

            if let Some(auth) = &config.auth {
                let auth = auth.clone();
                bump_proxy.set_authenticate(Arc::new(move |req| authenticate_basic(req, &auth)));
            }

            cert_store = Some(store);
            bump = Some(Arc::new(bump_proxy));
        }

        Ok(ProxyGateway {
            routes,
            engine: Arc::new(engine),
            bump,
            cert_store,
        })
    }

    pub fn routes(&self) -> Arc<RwLock<RoutingTable>> {
        self.routes.clone()
    }

    pub fn cert_store(&self) -> Option<Arc<CertStore>> {
        self.cert_store.clone()
    }

    /// Run the plain engine and (if configured) the bump engine to
    /// completion; returns when both listeners stop.
    pub async fn start(&self) -> Result<()> {
        info!("starting proxy gateway");
        match &self.bump {
            Some(bump) => {
                let engine = self.engine.clone();
                let bump = bump.clone();
                tokio::try_join!(
                    async move { engine.start().await },
                    async move { bump.start().await },
                )?;
            }
            None => self.engine.clone().start().await?,
        }
        Ok(())
    }

    /// Stop accepting new connections on both engines; with `force`, also
    /// tear down every in-flight connection instead of letting it drain.
    pub fn shutdown(&self, force: bool) {
        self.engine.shutdown(force);
        if let Some(bump) = &self.bump {
            bump.shutdown(force);
        }
    }
}

fn authenticate_basic(req: &engine::RequestHead, auth: &config::AuthConfig) -> Result<()> {
    use base64::Engine as _;
    use subtle::ConstantTimeEq;

    let reject = || Error::auth("missing or invalid proxy credentials");

    let header = req.header("proxy-authorization").ok_or_else(reject)?;
    let encoded = header.strip_prefix("Basic ").ok_or_else(reject)?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| reject())?;
    let creds = String::from_utf8(decoded).map_err(|_| reject())?;
    let (user, pass) = creds.split_once(':').ok_or_else(reject)?;

    let user_ok: bool = user.as_bytes().ct_eq(auth.username.as_bytes()).into();
    let pass_ok: bool = pass.as_bytes().ct_eq(auth.password.as_bytes()).into();
    if user_ok && pass_ok {
        Ok(())
    } else {
        Err(reject())
    }
}
