//! Pinned-certificate TLS verification for the persistent channel back to
//! the host (§4.6, §9 "secret_key semantics"). The guest trusts exactly the
//! PEM bytes carried in the bootstrap `HandshakeReceptionMessage.secret_key`
//! as the sole anchor — not a CA chain, and not an opaque pre-shared string.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, Error as TlsError, SignatureScheme};

#[derive(Debug)]
pub struct PinnedCertVerifier {
    expected: CertificateDer<'static>,
}

impl PinnedCertVerifier {
    pub fn new(expected_cert_der: Vec<u8>) -> Self {
        Self { expected: CertificateDer::from(expected_cert_der) }
    }

    pub fn client_config(expected_cert_der: Vec<u8>) -> rustls::ClientConfig {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(Self::new(expected_cert_der)))
            .with_no_client_auth()
    }
}

/// Decodes the single certificate in a PEM block to DER bytes, for
/// comparison against the DER the TLS stack presents at handshake time. No
/// crate in the workspace already covers PEM parsing on its own, so this
/// strips the `BEGIN/END CERTIFICATE` delimiters and base64-decodes the
/// body directly with the `base64` crate already in the dependency graph.
pub fn der_from_pem(pem: &str) -> anyhow::Result<Vec<u8>> {
    use base64::Engine;
    let body: String = pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect::<Vec<_>>()
        .join("");
    base64::engine::general_purpose::STANDARD
        .decode(body)
        .map_err(|e| anyhow::anyhow!("decoding PEM certificate body: {e}"))
}

impl ServerCertVerifier for PinnedCertVerifier {
    /// Property 2 (cert pinning): the connection succeeds iff the presented
    /// leaf certificate is byte-identical to the pinned one. Any other
    /// cert, including a valid CA-signed one, is rejected.
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        if end_entity.as_ref() == self.expected.as_ref() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(TlsError::General("presented certificate does not match pinned bootstrap cert".into()))
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::UnixTime;

    fn fake_name<'a>() -> ServerName<'a> {
        ServerName::IpAddress(std::net::Ipv4Addr::new(127, 0, 0, 1).into())
    }

    #[test]
    fn matching_cert_bytes_verify() {
        let cert = b"fake-cert-bytes".to_vec();
        let verifier = PinnedCertVerifier::new(cert.clone());
        let presented = CertificateDer::from(cert);
        let result =
            verifier.verify_server_cert(&presented, &[], &fake_name(), &[], UnixTime::now());
        assert!(result.is_ok());
    }

    #[test]
    fn der_from_pem_strips_delimiters() {
        let pem = "-----BEGIN CERTIFICATE-----\nYWJj\n-----END CERTIFICATE-----\n";
        assert_eq!(der_from_pem(pem).unwrap(), b"abc".to_vec());
    }

    #[test]
    fn mismatched_cert_bytes_are_rejected() {
        let verifier = PinnedCertVerifier::new(b"expected".to_vec());
        let presented = CertificateDer::from(b"different".to_vec());
        let result =
            verifier.verify_server_cert(&presented, &[], &fake_name(), &[], UnixTime::now());
        assert!(result.is_err());
    }
}
