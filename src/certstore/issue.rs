//! Leaf certificate minting (C4, issuance half)

use crate::common::error::{Error, Result};
use rand::RngCore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, SerialNumber,
};
use std::time::{Duration, SystemTime};
use time::OffsetDateTime;

/// CA material parsed once at construction and reused for every leaf signed
/// afterwards. `issuer_cert` is rebuilt from the supplied PEM's DER via
/// `CertificateParams::from_ca_cert_der`, giving `signed_by` a `Certificate`
/// to issue against without re-minting the CA itself. The PEM actually
/// served to clients in the leaf's chain stays `cert_pem`, the literal bytes
/// the caller supplied, never this reconstruction.
pub struct CaMaterial {
    pub cert_pem: String,
    key_pair: KeyPair,
    issuer_cert: Certificate,
}

impl CaMaterial {
    pub fn parse(ca_cert_pem: &str, ca_key_pem: &str) -> Result<Self> {
        let key_pair = KeyPair::from_pem(ca_key_pem)
            .map_err(|e| Error::certificate(format!("invalid CA key: {}", e)))?;

        let mut reader = std::io::Cursor::new(ca_cert_pem.as_bytes());
        let ca_der = rustls_pemfile::certs(&mut reader)
            .next()
            .ok_or_else(|| Error::certificate("no certificate found in CA PEM"))?
            .map_err(|e| Error::certificate(e.to_string()))?;
        let ca_params = CertificateParams::from_ca_cert_der(&ca_der)
            .map_err(|e| Error::certificate(format!("invalid CA cert: {}", e)))?;
        let issuer_cert = ca_params
            .self_signed(&key_pair)
            .map_err(|e| Error::certificate(format!("invalid CA cert: {}", e)))?;

        Ok(CaMaterial {
            cert_pem: ca_cert_pem.to_string(),
            key_pair,
            issuer_cert,
        })
    }
}

/// Mint a leaf certificate for `hostname`, signed by `ca`, using
/// `leaf_key_pair` as the subject key. Returns the PEM-encoded certificate
/// (not including the private key).
///
/// Serial is `"01"` followed by a random 64-bit value so the DER encoding
/// never starts with a high bit that would otherwise require a leading zero
/// byte. Validity spans from 24h in the past (clock-skew tolerance) to
/// `ttl` in the future.
pub fn mint_leaf_certificate(
    ca: &CaMaterial,
    leaf_key_pair: &KeyPair,
    hostname: &str,
    ttl: Duration,
) -> Result<String> {
    let mut params = CertificateParams::new(vec![hostname.to_string(), format!("*.{}", hostname)])
        .map_err(|e| Error::certificate(format!("invalid SAN list for '{}': {}", hostname, e)))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    dn.push(DnType::OrganizationName, "UBIO");
    params.distinguished_name = dn;

    params.serial_number = Some(SerialNumber::from_slice(&random_serial()));

    let now = SystemTime::now();
    params.not_before = to_offset(now - Duration::from_secs(24 * 3600));
    params.not_after = to_offset(now + ttl);

    // Preserves the source framework's leaf-cert extension set verbatim,
    // including cA=true on the leaf itself.
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::ContentCommitment,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DataEncipherment,
    ];

    let cert = params
        .signed_by(leaf_key_pair, &ca.issuer_cert, &ca.key_pair)
        .map_err(|e| Error::certificate(format!("signing failed for '{}': {}", hostname, e)))?;

    Ok(cert.pem())
}

/// "01" prefix byte followed by a random 64-bit value, so the DER integer
/// never starts with a high bit that would otherwise demand a padding zero.
fn random_serial() -> [u8; 9] {
    let mut bytes = [0u8; 9];
    bytes[0] = 0x01;
    rand::thread_rng().fill_bytes(&mut bytes[1..]);
    bytes
}

fn to_offset(t: SystemTime) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(
        t.duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64,
    )
    .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}
