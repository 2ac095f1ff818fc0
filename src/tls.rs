//! TLS connector construction for the driver (`spec.md` §3 `TlsParams`).
//!
//! Grounded on `tokio-postgres-rustls`'s `MakeRustlsConnect`, the standard
//! bridge between `tokio_postgres`'s `tls::MakeTlsConnect` and a rustls
//! `ClientConfig`; root trust comes from `rustls-native-certs` rather than
//! a bundled cert store, the same choice the teacher's other TLS-speaking
//! crates make for picking up the host's trust roots.

use std::sync::Arc;

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_postgres_rustls::MakeRustlsConnect;

use crate::{config::TlsParams, error::Error};

/// Accepts any server certificate unverified. Wired in only when
/// `TlsParams::insecure_skip_verify` is set — a deliberate escape hatch
/// for local/self-signed environments, never the default.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// Builds the `MakeTlsConnect` implementation the driver connects through,
/// honoring `params.insecure_skip_verify`. Called only when `params.enabled`
/// — callers use `tokio_postgres::NoTls` directly otherwise, since `NoTls`
/// and `MakeRustlsConnect` are different concrete types.
pub fn build_rustls_connect(params: &TlsParams) -> Result<MakeRustlsConnect, Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|err| Error::driver("tls_config", anyhow::anyhow!(err)))?;

    let config = if params.insecure_skip_verify {
        builder.dangerous().with_custom_certificate_verifier(Arc::new(NoVerifier)).with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        let loaded = rustls_native_certs::load_native_certs();
        for cert in loaded.certs {
            let _ = roots.add(cert);
        }
        if !loaded.errors.is_empty() {
            tracing::warn!(errors = ?loaded.errors, "some native root certificates failed to load");
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    Ok(MakeRustlsConnect::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_connector_with_system_roots() {
        let params = TlsParams {
            enabled: true,
            insecure_skip_verify: false,
        };
        assert!(build_rustls_connect(&params).is_ok());
    }

    #[test]
    fn builds_a_connector_that_skips_verification() {
        let params = TlsParams {
            enabled: true,
            insecure_skip_verify: true,
        };
        assert!(build_rustls_connect(&params).is_ok());
    }
}
