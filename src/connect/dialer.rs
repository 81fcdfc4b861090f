/// Network dial and TLS handshake primitives
///
/// The connector consumes dialing through the [`Dialer`] trait so the
/// transport (and the TLS implementation behind it) stays a pluggable
/// boundary. [`TokioDialer`] is the production implementation: plain
/// TCP via tokio, TLS via rustls restricted to exactly the protocol
/// versions the backend's policy offers.
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::core::policy::TlsPolicy;
use crate::core::Origin;
use crate::error::ConnectError;

/// Byte stream to an origin, plain or TLS
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> TransportStream for T {}

/// An established origin connection, tagged with the negotiated TLS
/// protocol when the origin leg is secure
pub struct Connection {
    pub origin: Origin,
    negotiated_protocol: Option<String>,
    stream: Box<dyn TransportStream>,
}

impl Connection {
    pub fn new(
        origin: Origin,
        stream: Box<dyn TransportStream>,
        negotiated_protocol: Option<String>,
    ) -> Self {
        Self {
            origin,
            negotiated_protocol,
            stream,
        }
    }

    pub fn is_tls(&self) -> bool {
        self.negotiated_protocol.is_some()
    }

    pub fn negotiated_protocol(&self) -> Option<&str> {
        self.negotiated_protocol.as_deref()
    }

    pub fn stream_mut(&mut self) -> &mut dyn TransportStream {
        &mut *self.stream
    }

    pub fn into_stream(self) -> Box<dyn TransportStream> {
        self.stream
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("origin", &self.origin.id)
            .field("negotiated_protocol", &self.negotiated_protocol)
            .finish_non_exhaustive()
    }
}

/// Dial primitive consumed by the origin connector.
///
/// A dial either yields a usable connection within `connect_timeout`
/// or a typed error; on timeout or cancellation the partially
/// established stream is dropped, releasing its resources.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        origin: &Origin,
        tls: Option<&TlsPolicy>,
        connect_timeout: Duration,
    ) -> Result<Connection, ConnectError>;
}

/// Production dialer: tokio TCP + rustls.
///
/// Protocol versions the rustls provider cannot offer are dropped from
/// the policy's list; if none remain the dial fails with a negotiation
/// error, the same way an origin-side refusal would.
pub struct TokioDialer;

#[async_trait]
impl Dialer for TokioDialer {
    async fn dial(
        &self,
        origin: &Origin,
        tls: Option<&TlsPolicy>,
        connect_timeout: Duration,
    ) -> Result<Connection, ConnectError> {
        let tcp = match timeout(
            connect_timeout,
            TcpStream::connect((origin.host.as_str(), origin.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ConnectError::network(&origin.id, e)),
            Err(_) => return Err(ConnectError::timeout(&origin.id, connect_timeout)),
        };
        // Reduce latency on small request/response exchanges
        let _ = tcp.set_nodelay(true);

        let Some(policy) = tls else {
            debug!("plain connection established to origin {}", origin.id);
            return Ok(Connection::new(origin.clone(), Box::new(tcp), None));
        };

        let config = client_config(&origin.id, policy)?;
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(origin.host.clone()).map_err(|_| {
            ConnectError::network(
                &origin.id,
                io::Error::new(io::ErrorKind::InvalidInput, "invalid server name"),
            )
        })?;

        let stream = match timeout(connect_timeout, connector.connect(server_name, tcp)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("TLS handshake with origin {} failed: {}", origin.id, e);
                return Err(ConnectError::tls_negotiation(
                    &origin.id,
                    policy.protocols.clone(),
                ));
            }
            Err(_) => return Err(ConnectError::timeout(&origin.id, connect_timeout)),
        };

        let negotiated = stream
            .get_ref()
            .1
            .protocol_version()
            .map(protocol_name)
            .unwrap_or_else(|| "unknown".to_string());
        debug!(
            "TLS connection established to origin {} ({})",
            origin.id, negotiated
        );
        Ok(Connection::new(
            origin.clone(),
            Box::new(stream),
            Some(negotiated),
        ))
    }
}

/// Map a policy's protocol-version strings onto the versions the
/// provider can actually offer
fn supported_versions(protocols: &[String]) -> Vec<&'static rustls::SupportedProtocolVersion> {
    protocols
        .iter()
        .filter_map(|name| match name.as_str() {
            "TLSv1.2" => Some(&rustls::version::TLS12),
            "TLSv1.3" => Some(&rustls::version::TLS13),
            _ => None,
        })
        .collect()
}

fn protocol_name(version: rustls::ProtocolVersion) -> String {
    match version {
        rustls::ProtocolVersion::TLSv1_2 => "TLSv1.2".to_string(),
        rustls::ProtocolVersion::TLSv1_3 => "TLSv1.3".to_string(),
        other => format!("{:?}", other),
    }
}

fn client_config(origin_id: &str, policy: &TlsPolicy) -> Result<ClientConfig, ConnectError> {
    let versions = supported_versions(&policy.protocols);
    if versions.is_empty() {
        return Err(ConnectError::tls_negotiation(
            origin_id,
            policy.protocols.clone(),
        ));
    }

    let mut provider = rustls::crypto::ring::default_provider();
    if let Some(names) = &policy.ciphers {
        provider
            .cipher_suites
            .retain(|suite| names.iter().any(|name| format!("{:?}", suite.suite()) == *name));
        if provider.cipher_suites.is_empty() {
            return Err(ConnectError::tls_negotiation(
                origin_id,
                policy.protocols.clone(),
            ));
        }
    }
    let provider = Arc::new(provider);

    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&versions)
        .map_err(|_| ConnectError::tls_negotiation(origin_id, policy.protocols.clone()))?;

    let config = if policy.authenticate {
        let roots = load_trust_roots(origin_id, policy)?;
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
            .with_no_client_auth()
    };
    Ok(config)
}

fn load_trust_roots(origin_id: &str, policy: &TlsPolicy) -> Result<RootCertStore, ConnectError> {
    let path = policy.trusted_certs_path.as_ref().ok_or_else(|| {
        ConnectError::network(
            origin_id,
            io::Error::new(io::ErrorKind::InvalidInput, "missing trusted_certs_path"),
        )
    })?;
    let pem = std::fs::read(path).map_err(|e| ConnectError::network(origin_id, e))?;

    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
        let cert = cert.map_err(|e| ConnectError::network(origin_id, e))?;
        roots.add(cert).map_err(|e| {
            ConnectError::network(origin_id, io::Error::new(io::ErrorKind::InvalidData, e))
        })?;
    }
    Ok(roots)
}

/// Certificate verifier for `authenticate = false` backends: accepts
/// any origin certificate while still enforcing protocol negotiation
#[derive(Debug)]
struct NoVerification(Arc<rustls::crypto::CryptoProvider>);

impl ServerCertVerifier for NoVerification {
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
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
