//! Certificate store: on-demand leaf minting with an LRU/TTL cache (C4)

mod issue;

pub use issue::CaMaterial;

use crate::common::error::{Error, Result};
use lru::LruCache;
use parking_lot::Mutex;
use rcgen::KeyPair;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Fired whenever a leaf certificate is minted, so callers can audit or
/// persist issued material.
pub type CertificateIssuedHook = Arc<dyn Fn(&str, &str) + Send + Sync>;

struct CachedCert {
    pem: String,
    minted_at: Instant,
}

pub struct CertStoreConfig {
    pub ca_cert_pem: String,
    pub ca_key_pem: String,
    /// Static leaf keypair PEM; a fresh 2048-bit RSA keypair is generated
    /// when absent.
    pub leaf_key_pem: Option<String>,
    pub cert_ttl_days: u32,
    pub cert_cache_max_entries: usize,
}

/// Mints and caches CA-signed leaf certificates for SSL bumping.
pub struct CertStore {
    ca: CaMaterial,
    leaf_key_pair: KeyPair,
    leaf_key_pem: String,
    ttl: Duration,
    max_age: Duration,
    cache: Mutex<LruCache<String, CachedCert>>,
    on_issued: Option<CertificateIssuedHook>,
}

impl CertStore {
    pub fn new(config: CertStoreConfig) -> Result<Self> {
        let ca = CaMaterial::parse(&config.ca_cert_pem, &config.ca_key_pem)?;

        let (leaf_key_pair, leaf_key_pem) = match config.leaf_key_pem {
            Some(pem) => {
                let kp = KeyPair::from_pem(&pem)
                    .map_err(|e| Error::certificate(format!("invalid leaf key: {}", e)))?;
                (kp, pem)
            }
            None => {
                // rcgen can sign with an RSA key but can't generate one; bring
                // our own via the `rsa` crate, as the source's fallback does.
                use rsa::pkcs8::EncodePrivateKey;
                let rsa_key = rsa::RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048)
                    .map_err(|e| Error::certificate(format!("RSA key generation failed: {}", e)))?;
                let pem = rsa_key
                    .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
                    .map_err(|e| Error::certificate(e.to_string()))?
                    .to_string();
                let kp = KeyPair::from_pem(&pem)
                    .map_err(|e| Error::certificate(format!("invalid generated leaf key: {}", e)))?;
                (kp, pem)
            }
        };

        let ttl = Duration::from_secs(config.cert_ttl_days as u64 * 24 * 3600);
        // One hour of safety margin under the certificate's stated validity.
        let max_age = ttl.saturating_sub(Duration::from_secs(3600));

        let capacity = NonZeroUsize::new(config.cert_cache_max_entries.max(1)).unwrap();

        Ok(CertStore {
            ca,
            leaf_key_pair,
            leaf_key_pem,
            ttl,
            max_age,
            cache: Mutex::new(LruCache::new(capacity)),
            on_issued: None,
        })
    }

    pub fn on_certificate_issued(&mut self, hook: CertificateIssuedHook) {
        self.on_issued = Some(hook);
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca.cert_pem
    }

    /// PEM of the keypair every minted leaf is signed with, so an embedder
    /// can reconstruct a matching `rustls::ServerConfig` outside the store
    /// (e.g. to serve a fixture origin under the same identity in tests).
    pub fn leaf_key_pem(&self) -> &str {
        &self.leaf_key_pem
    }

    /// Exact hostname, then parent domain (first label stripped), then a
    /// freshly minted certificate stored under the exact hostname.
    pub fn get_certificate(&self, hostname: &str) -> Result<String> {
        if let Some(pem) = self.lookup_fresh(hostname) {
            return Ok(pem);
        }
        if let Some(parent) = parent_domain(hostname) {
            if let Some(pem) = self.lookup_fresh(&parent) {
                return Ok(pem);
            }
        }
        self.mint_and_store(hostname)
    }

    fn lookup_fresh(&self, key: &str) -> Option<String> {
        let mut cache = self.cache.lock();
        let expired = cache
            .peek(key)
            .map(|entry| entry.minted_at.elapsed() > self.max_age)
            .unwrap_or(true);
        if expired {
            cache.pop(key);
            return None;
        }
        cache.get(key).map(|entry| entry.pem.clone())
    }

    fn mint_and_store(&self, hostname: &str) -> Result<String> {
        let pem = issue::mint_leaf_certificate(&self.ca, &self.leaf_key_pair, hostname, self.ttl)?;

        self.cache.lock().put(
            hostname.to_string(),
            CachedCert {
                pem: pem.clone(),
                minted_at: Instant::now(),
            },
        );

        debug!(hostname, "minted leaf certificate");
        if let Some(hook) = &self.on_issued {
            hook(hostname, &pem);
        }

        Ok(pem)
    }

    /// Build a server-side TLS config presenting `hostname`'s leaf cert
    /// (chained to the CA) with ALPN `http/1.1`, for wrapping an already
    /// accepted plaintext client socket.
    pub fn server_config(&self, hostname: &str) -> Result<Arc<rustls::ServerConfig>> {
        let leaf_pem = self.get_certificate(hostname)?;

        let leaf_der = parse_cert_pem(&leaf_pem)?;
        let ca_der = parse_cert_pem(&self.ca.cert_pem)?;
        let chain = vec![leaf_der, ca_der];

        let key_der = parse_key_pem(&self.leaf_key_pem)?;

        let mut server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key_der)
            .map_err(Error::from)?;
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Arc::new(server_config))
    }
}

fn parent_domain(hostname: &str) -> Option<String> {
    hostname.split_once('.').map(|(_, rest)| rest.to_string())
}

fn parse_cert_pem(pem: &str) -> Result<CertificateDer<'static>> {
    let mut reader = std::io::Cursor::new(pem.as_bytes());
    rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| Error::certificate("no certificate found in PEM"))?
        .map_err(|e| Error::certificate(e.to_string()))
}

fn parse_key_pem(pem: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = std::io::Cursor::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::certificate(e.to_string()))?
        .ok_or_else(|| Error::certificate("no private key found in PEM"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_ca_pems() -> (String, String) {
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Test Root CA");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&ca_key).unwrap();
        (cert.pem(), ca_key.serialize_pem())
    }

    fn test_store(max_entries: usize) -> CertStore {
        let (ca_cert_pem, ca_key_pem) = test_ca_pems();
        CertStore::new(CertStoreConfig {
            ca_cert_pem,
            ca_key_pem,
            leaf_key_pem: None,
            cert_ttl_days: 30,
            cert_cache_max_entries: max_entries,
        })
        .unwrap()
    }

    #[test]
    fn mints_and_caches_by_exact_hostname() {
        let store = test_store(8);
        let first = store.get_certificate("api.example.com").unwrap();
        let second = store.get_certificate("api.example.com").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn falls_back_to_parent_domain_before_minting() {
        let store = test_store(8);
        let parent = store.get_certificate("example.com").unwrap();
        let child = store.get_certificate("api.example.com").unwrap();
        assert_eq!(parent, child);
    }

    #[test]
    fn certificate_issued_hook_fires_on_mint() {
        let mut store = test_store(8);
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        store.on_certificate_issued(Arc::new(move |_host, _pem| {
            count2.fetch_add(1, Ordering::SeqCst);
        }));
        store.get_certificate("first.example.com").unwrap();
        store.get_certificate("first.example.com").unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lru_evicts_beyond_capacity() {
        let store = test_store(1);
        store.get_certificate("a.example.com").unwrap();
        store.get_certificate("b.example.com").unwrap();
        // "a" was evicted, so the lookup mints a fresh (different) cert.
        let a_again = store.get_certificate("a.example.com").unwrap();
        let b = store.cache.lock().peek("b.example.com").map(|e| e.pem.clone());
        assert_ne!(Some(a_again), b);
    }
}
