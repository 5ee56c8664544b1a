//! Self-signed certificate issuance for the persistent TLS channel (C1).
//! Generalizes `enclave/src/key_server.rs`'s EC-P256 `rcgen` identity-key
//! pattern to an RSA-2048 key with an IP SAN, as the guest pins these exact
//! bytes rather than verifying a CA chain.

use anyhow::{anyhow, Result};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use rsa::pkcs8::EncodePrivateKey;
use std::net::IpAddr;
use std::time::{Duration, SystemTime};

/// PEM-encoded certificate plus PKCS#8 private key, ready to hand to
/// `rustls::ServerConfig`.
pub struct SelfSignedCert {
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

impl SelfSignedCert {
    /// PKCS#8 DER bytes of the private key, ready for
    /// `rustls_pki_types::PrivateKeyDer`.
    pub fn key_pem_der(&self) -> Result<Vec<u8>> {
        Ok(self.key_der.clone())
    }
}

impl SelfSignedCert {
    /// Issues a fresh RSA-2048 cert valid 365 days, `CN = name`, with the
    /// given IP as its only `SubjectAlternativeName`. Serial is randomized
    /// by `rcgen` itself.
    pub fn generate(name: &str, ip: IpAddr) -> Result<Self> {
        let mut rng = rand::rngs::OsRng;
        let rsa_key = rsa::RsaPrivateKey::new(&mut rng, 2048)
            .map_err(|e| anyhow!("generating RSA key: {e}"))?;
        let pkcs8_der = rsa_key
            .to_pkcs8_der()
            .map_err(|e| anyhow!("encoding RSA key as PKCS8: {e}"))?;
        let key_pair =
            KeyPair::from_pkcs8_der_and_sign_algo(&pkcs8_der.into(), &rcgen::PKCS_RSA_SHA256)
                .map_err(|e| anyhow!("building rcgen key pair: {e}"))?;

        let mut params = CertificateParams::new(vec![])
            .map_err(|e| anyhow!("building certificate params: {e}"))?;
        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, name);
        params.distinguished_name = distinguished_name;
        params.subject_alt_names = vec![SanType::IpAddress(ip)];
        params.not_before = rcgen::date_time_ymd(2020, 1, 1);
        let not_after = SystemTime::now() + Duration::from_secs(365 * 24 * 3600);
        params.not_after = not_after.into();

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| anyhow!("self-signing certificate: {e}"))?;

        let cert_der = cert.der().to_vec();
        let key_der = key_pair.serialize_der();
        Ok(Self { cert_pem: cert.pem(), key_pem: key_pair.serialize_pem(), cert_der, key_der })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn generate_produces_valid_pem() {
        let cert = SelfSignedCert::generate("worker-1", IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)))
            .unwrap();
        assert!(cert.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(cert.key_pem.contains("PRIVATE KEY"));
    }
}
