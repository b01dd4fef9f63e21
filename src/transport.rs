//! Raw byte-stream connections to the store.
//!
//! [`TransportFactory`] resolves everything that is shared between workers
//! (target address, TLS client configuration, server name) once, before any
//! worker is spawned. Each worker then calls [`TransportFactory::connect`] to
//! get its own [`Transport`].
//!
//! # Trust-all TLS
//!
//! Secure mode accepts any certificate chain for any host name. It exists so
//! encrypted listeners can be exercised in test environments that have no
//! trusted chain. It is diagnostic only and must not be used to talk to a
//! store whose identity matters.

use crate::error::{Error, Result};
use core::pin::Pin;
use core::task::{Context, Poll};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::io;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Installs `ring` as the process-wide rustls provider.
///
/// The store client builds its own rustls configuration and needs a default
/// provider to exist. Calling this more than once is harmless.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

#[derive(Clone)]
struct Secure {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

/// Builds plain or trust-all TLS connections to one `host:port`.
#[derive(Clone)]
pub struct TransportFactory {
    host: String,
    port: u16,
    secure: Option<Secure>,
}

impl TransportFactory {
    /// Resolves the shared transport configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Setup`] when secure mode is requested and either the
    /// TLS context cannot be built or `host` is not a valid server name.
    pub fn new(host: &str, port: u16, secure: bool) -> Result<Self> {
        let secure = if secure {
            let server_name = ServerName::try_from(host.to_owned())
                .map_err(|e| Error::setup(format!("invalid TLS server name {host:?}: {e}")))?;
            Some(Secure {
                connector: TlsConnector::from(insecure_client_config()?),
                server_name,
            })
        } else {
            None
        };

        Ok(Self {
            host: host.to_owned(),
            port,
            secure,
        })
    }

    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub const fn is_secure(&self) -> bool {
        self.secure.is_some()
    }

    /// Opens a new connection, completing the TLS handshake in secure mode.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] on DNS, connect or handshake failure.
    pub async fn connect(&self) -> Result<Transport> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| Error::connection(self.target(), e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::connection(self.target(), e))?;

        match &self.secure {
            None => Ok(Transport::Plain(stream)),
            Some(secure) => {
                let tls = secure
                    .connector
                    .connect(secure.server_name.clone(), stream)
                    .await
                    .map_err(|e| Error::connection(self.target(), format!("TLS handshake: {e}")))?;
                Ok(Transport::Tls(Box::new(tls)))
            }
        }
    }
}

/// One worker's connection. Dropping it closes the socket.
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

fn insecure_client_config() -> Result<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::setup(format!("TLS context: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(TrustAll { provider }))
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Accepts every server certificate. Handshake signatures are still checked
/// so the session itself is well-formed.
#[derive(Debug)]
struct TrustAll {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for TrustAll {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> core::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> core::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> core::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn plain_connect_and_write() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let factory = TransportFactory::new("127.0.0.1", port, false).unwrap();
        assert!(!factory.is_secure());
        let mut transport = factory.connect().await.unwrap();
        transport.write_all(b"ping").await.unwrap();
        transport.shutdown().await.unwrap();
        drop(transport);

        assert_eq!(server.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn refused_connection_is_a_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let factory = TransportFactory::new("127.0.0.1", port, false).unwrap();
        let err = factory.connect().await.err().unwrap();
        assert_eq!(err.kind(), "connection");
    }

    #[test]
    fn secure_factory_builds_for_names_and_addresses() {
        assert!(TransportFactory::new("localhost", 6379, true)
            .unwrap()
            .is_secure());
        assert!(TransportFactory::new("127.0.0.1", 6379, true)
            .unwrap()
            .is_secure());
    }

    #[test]
    fn bad_server_name_fails_setup() {
        let err = TransportFactory::new("not a host name", 6379, true)
            .err()
            .unwrap();
        assert_eq!(err.kind(), "setup");
        // Plain mode never needs a server name.
        assert!(TransportFactory::new("not a host name", 6379, false).is_ok());
    }

    #[tokio::test]
    async fn handshake_failure_is_a_connection_error() {
        // A plain TCP peer that hangs up instead of speaking TLS.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let factory = TransportFactory::new("127.0.0.1", port, true).unwrap();
        let err = factory.connect().await.err().unwrap();
        assert_eq!(err.kind(), "connection");
    }
}
