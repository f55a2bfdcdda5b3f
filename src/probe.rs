//! TLS capability probing: connect, handshake with ALPN, read the leaf certificate.
use log::debug;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{self, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, ClientConfig, DigitallySignedStruct, ProtocolVersion, SignatureScheme};
use tokio_rustls::TlsConnector;
use x509_parser::parse_x509_certificate;

use crate::geo::GeoLookup;
use crate::targets::resolve;
use crate::types::{ProbeResult, Target, TargetKind};

/// ALPN protocols offered, most preferred first.
pub const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// Anything that can turn a target into a probe result.
///
/// Implementations must not fail loudly: an unreachable or uninteresting
/// target is simply `None`.
pub trait Prober: Send + Sync + 'static {
    fn probe(&self, target: Target) -> impl Future<Output = Option<ProbeResult>> + Send;
}

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("malformed certificate: {0}")]
    Malformed(String),
    #[error("certificate has an empty subject")]
    EmptySubject,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("could not resolve {0}")]
    Resolve(String),
    #[error("connect to {0} failed: {1}")]
    Connect(SocketAddr, #[source] io::Error),
    #[error("connect to {0} timed out")]
    ConnectTimeout(SocketAddr),
    #[error("{0} is not a usable server name")]
    ServerName(String),
    #[error("TLS handshake with {0} failed: {1}")]
    Handshake(SocketAddr, #[source] io::Error),
    #[error("TLS handshake with {0} timed out")]
    HandshakeTimeout(SocketAddr),
    #[error("{0} presented no certificate")]
    NoCertificate(SocketAddr),
    #[error("certificate from {0}: {1}")]
    Certificate(SocketAddr, #[source] CertificateError),
}

/// The two certificate fields a probe reports.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CertificateFields {
    /// Subject common name, empty when absent.
    pub domain: String,
    /// Issuer organization values joined with `" | "`, empty when absent.
    pub issuer: String,
}

pub fn certificate_fields(der: &[u8]) -> Result<CertificateFields, CertificateError> {
    let (_, cert) =
        parse_x509_certificate(der).map_err(|e| CertificateError::Malformed(e.to_string()))?;
    if cert.subject().iter().next().is_none() {
        return Err(CertificateError::EmptySubject);
    }
    let domain = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();
    let issuer = cert
        .issuer()
        .iter_organization()
        .filter_map(|o| o.as_str().ok())
        .collect::<Vec<_>>()
        .join(" | ");
    Ok(CertificateFields { domain, issuer })
}

pub fn protocol_name(version: ProtocolVersion) -> String {
    match version {
        ProtocolVersion::TLSv1_3 => "TLSv1.3".to_string(),
        ProtocolVersion::TLSv1_2 => "TLSv1.2".to_string(),
        ProtocolVersion::TLSv1_1 => "TLSv1.1".to_string(),
        ProtocolVersion::TLSv1_0 => "TLSv1.0".to_string(),
        other => format!("{other:?}"),
    }
}

/// Accepts whatever certificate the peer presents; handshake signatures are still checked.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Client config offering TLS 1.2 and 1.3, ALPN `h2` then `http/1.1`, no trust checks.
pub fn tls_connector() -> Result<TlsConnector, rustls::Error> {
    let provider = Arc::new(crypto::ring::default_provider());
    let mut config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
        .with_no_client_auth();
    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Probes targets over real TCP + TLS.
#[derive(Clone)]
pub struct TlsProber {
    port: u16,
    timeout: Duration,
    enable_ipv6: bool,
    connector: TlsConnector,
    geo: Arc<dyn GeoLookup>,
}

impl TlsProber {
    pub fn new(port: u16, timeout: Duration, geo: Arc<dyn GeoLookup>) -> Result<Self, rustls::Error> {
        Ok(Self {
            port,
            timeout,
            enable_ipv6: false,
            connector: tls_connector()?,
            geo,
        })
    }

    pub fn with_ipv6(mut self, enable: bool) -> Self {
        self.enable_ipv6 = enable;
        self
    }

    /// Run one probe and report why it failed.
    ///
    /// The TCP stream and TLS session are owned locals, so they are closed on
    /// every return path, including timeouts (the dropped future owns the socket).
    pub async fn try_probe(&self, target: &Target) -> Result<ProbeResult, ProbeError> {
        let ip = match target.address {
            Some(ip) => ip,
            None => resolve(&target.origin, self.enable_ipv6)
                .await
                .ok_or_else(|| ProbeError::Resolve(target.origin.clone()))?,
        };
        let addr = SocketAddr::new(ip, self.port);

        let tcp = match time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ProbeError::Connect(addr, e)),
            Err(_) => return Err(ProbeError::ConnectTimeout(addr)),
        };

        let server_name = match target.kind {
            TargetKind::Domain => ServerName::try_from(target.origin.clone())
                .map_err(|_| ProbeError::ServerName(target.origin.clone()))?,
            TargetKind::Ip | TargetKind::CidrMember => ServerName::from(ip),
        };

        let tls = match time::timeout(self.timeout, self.connector.connect(server_name, tcp)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ProbeError::Handshake(addr, e)),
            Err(_) => return Err(ProbeError::HandshakeTimeout(addr)),
        };

        let (_, session) = tls.get_ref();
        let protocol = session
            .protocol_version()
            .map(protocol_name)
            .unwrap_or_default();
        let alpn = session
            .alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .unwrap_or_default();
        let leaf = session
            .peer_certificates()
            .and_then(|chain| chain.first())
            .ok_or(ProbeError::NoCertificate(addr))?;
        let fields =
            certificate_fields(leaf.as_ref()).map_err(|e| ProbeError::Certificate(addr, e))?;

        Ok(ProbeResult::new(
            ip.to_string(),
            target.origin.clone(),
            fields.domain,
            fields.issuer,
            self.geo.country_code(ip),
            protocol,
            alpn,
        ))
    }
}

impl Prober for TlsProber {
    async fn probe(&self, target: Target) -> Option<ProbeResult> {
        match self.try_probe(&target).await {
            Ok(result) => {
                debug!(
                    "{} ({}): {} alpn={:?} cn={:?} feasible={}",
                    result.address,
                    result.origin,
                    result.negotiated_protocol,
                    result.negotiated_alpn,
                    result.certificate_domain,
                    result.feasible
                );
                Some(result)
            }
            Err(e) => {
                debug!("{}: {e}", target.origin);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::NoGeo;

    const CERT: &[u8] = include_bytes!("../tests/fixtures/cert.der");
    const BARE_CERT: &[u8] = include_bytes!("../tests/fixtures/bare-cert.der");

    #[test]
    fn reads_common_name_and_joins_issuer_orgs() {
        let fields = certificate_fields(CERT).unwrap();
        assert_eq!(fields.domain, "edge.example.test");
        assert_eq!(fields.issuer, "Scan Test Org | Edge Unit");
    }

    #[test]
    fn missing_fields_are_empty() {
        assert_eq!(certificate_fields(BARE_CERT).unwrap(), CertificateFields::default());
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            certificate_fields(b"definitely not DER"),
            Err(CertificateError::Malformed(_))
        ));
    }

    #[test]
    fn protocol_names_match_feasibility_strings() {
        assert_eq!(protocol_name(ProtocolVersion::TLSv1_3), "TLSv1.3");
        assert_eq!(protocol_name(ProtocolVersion::TLSv1_2), "TLSv1.2");
    }

    #[tokio::test]
    async fn closed_port_is_no_result() {
        // Bind then drop to get a port that refuses connections.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let prober = TlsProber::new(port, Duration::from_secs(2), Arc::new(NoGeo)).unwrap();
        let target = Target::ip("127.0.0.1".parse().unwrap());
        assert!(matches!(
            prober.try_probe(&target).await,
            Err(ProbeError::Connect(..))
        ));
        assert!(prober.probe(target).await.is_none());
    }

    #[tokio::test]
    async fn unresolvable_domain_is_no_result() {
        let prober = TlsProber::new(443, Duration::from_secs(2), Arc::new(NoGeo)).unwrap();
        let target = Target::domain("no-such-host.invalid");
        assert!(matches!(
            prober.try_probe(&target).await,
            Err(ProbeError::Resolve(_))
        ));
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            // Accept and hold the socket without ever answering the ClientHello.
            let (sock, _) = listener.accept().await.unwrap();
            time::sleep(Duration::from_secs(5)).await;
            drop(sock);
        });

        let prober = TlsProber::new(port, Duration::from_millis(300), Arc::new(NoGeo)).unwrap();
        let target = Target::ip("127.0.0.1".parse().unwrap());
        assert!(matches!(
            prober.try_probe(&target).await,
            Err(ProbeError::HandshakeTimeout(_))
        ));
        server.abort();
    }
}
