//! Client TLS over an already established stream

use std::{sync::Arc, time::Duration};

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{CryptoProvider, WebPkiSupportedAlgorithms},
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::connect::ConnectError;

/// Config used when the caller supplies none.
///
/// With `insecure_skip_verify` the server certificate is accepted unchecked,
/// otherwise it is verified against the webpki root set.
pub fn default_client_config(insecure_skip_verify: bool) -> Result<Arc<ClientConfig>, ConnectError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let config = if insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify::new(&provider)))
            .with_no_client_auth()
    } else {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(Arc::new(config))
}

/// Performs a client handshake over `stream` with SNI set to `server_name`
pub async fn handshake<S>(
    config: Arc<ClientConfig>,
    stream: S,
    server_name: &str,
    timeout: Option<Duration>,
) -> Result<TlsStream<S>, ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let bare = server_name.trim_start_matches('[').trim_end_matches(']');
    let name = ServerName::try_from(bare.to_owned())
        .map_err(|_| ConnectError::InvalidServerName(server_name.to_owned()))?;

    let connect = TlsConnector::from(config).connect(name, stream);
    let stream = match timeout.filter(|t| !t.is_zero()) {
        Some(timeout) => tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| ConnectError::Timeout("TLS handshake"))??,
        None => connect.await?,
    };
    Ok(stream)
}

/// Accepts any server certificate; signatures are still checked
#[derive(Debug)]
pub struct NoVerify {
    algorithms: WebPkiSupportedAlgorithms,
}

impl NoVerify {
    pub fn new(provider: &CryptoProvider) -> Self {
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_both_configs() {
        default_client_config(true).unwrap();
        default_client_config(false).unwrap();
    }

    #[tokio::test]
    async fn rejects_bad_server_name() {
        let (client, _server) = tokio::io::duplex(64);
        let config = default_client_config(true).unwrap();
        let err = handshake(config, client, "bad name!", None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConnectError::InvalidServerName(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_times_out_on_silent_peer() {
        let (client, _server) = tokio::io::duplex(4096);
        let config = default_client_config(true).unwrap();
        let err = handshake(config, client, "example.com", Some(Duration::from_secs(5)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConnectError::Timeout(_)));
    }
}
