use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::{self, ServerConfig, SupportedProtocolVersion};
use tokio_rustls::TlsAcceptor;

use tls_h2_scan_rs::geo::{GeoDatabase, NoGeo};
use tls_h2_scan_rs::output::ResultSink;
use tls_h2_scan_rs::probe::{Prober, TlsProber};
use tls_h2_scan_rs::scanner::{run_scan, ScanOptions, ScanSession};
use tls_h2_scan_rs::targets::{CidrExpansion, TargetSource};
use tls_h2_scan_rs::types::Target;

const CERT: &[u8] = include_bytes!("fixtures/cert.der");
const KEY: &[u8] = include_bytes!("fixtures/key.der");

/// Local TLS server; reports the SNI each client sent.
async fn tls_server(
    versions: &[&'static SupportedProtocolVersion],
    alpn: &[&[u8]],
) -> (u16, mpsc::UnboundedReceiver<Option<String>>) {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(versions)
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(
            vec![CertificateDer::from(CERT.to_vec())],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(KEY.to_vec())),
        )
        .unwrap();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Ok(mut tls) = acceptor.accept(tcp).await {
                    let sni = tls.get_ref().1.server_name().map(str::to_string);
                    let _ = tx.send(sni);
                    // Hold the session until the client hangs up.
                    let mut buf = [0u8; 64];
                    let _ = tls.read(&mut buf).await;
                }
            });
        }
    });
    (port, rx)
}

fn localhost() -> Target {
    Target::ip("127.0.0.1".parse().unwrap())
}

#[tokio::test]
async fn tls13_h2_server_is_feasible() {
    let (port, mut sni) = tls_server(&[&rustls::version::TLS13], &[b"h2", b"http/1.1"]).await;
    let geo = GeoDatabase::parse_str("127.0.0.0,127.255.255.255,zz").unwrap();
    let prober = TlsProber::new(port, Duration::from_secs(5), Arc::new(geo)).unwrap();

    let result = prober.try_probe(&localhost()).await.unwrap();

    assert_eq!(result.address, "127.0.0.1");
    assert_eq!(result.origin, "127.0.0.1");
    assert_eq!(result.negotiated_protocol, "TLSv1.3");
    assert_eq!(result.negotiated_alpn, "h2");
    assert_eq!(result.certificate_domain, "edge.example.test");
    assert_eq!(result.certificate_issuer, "Scan Test Org | Edge Unit");
    assert_eq!(result.country_code, "ZZ");
    assert!(result.feasible);
    // IP targets send no SNI.
    assert_eq!(sni.recv().await, Some(None));
}

#[tokio::test]
async fn domain_targets_send_sni() {
    let (port, mut sni) = tls_server(&[&rustls::version::TLS13], &[b"h2"]).await;
    let prober = TlsProber::new(port, Duration::from_secs(5), Arc::new(NoGeo)).unwrap();
    let target = Target::resolved_domain("edge.example.test", "127.0.0.1".parse().unwrap());

    let result = prober.probe(target).await.unwrap();

    assert_eq!(result.origin, "edge.example.test");
    assert_eq!(result.country_code, "N/A");
    assert!(result.feasible);
    assert_eq!(sni.recv().await, Some(Some("edge.example.test".to_string())));
}

#[tokio::test]
async fn tls12_server_is_reported_but_not_feasible() {
    let (port, _sni) = tls_server(&[&rustls::version::TLS12], &[b"h2"]).await;
    let prober = TlsProber::new(port, Duration::from_secs(5), Arc::new(NoGeo)).unwrap();

    let result = prober.probe(localhost()).await.unwrap();

    assert_eq!(result.negotiated_protocol, "TLSv1.2");
    assert_eq!(result.negotiated_alpn, "h2");
    assert!(!result.feasible);
}

#[tokio::test]
async fn http1_only_server_is_not_feasible() {
    let (port, _sni) = tls_server(&[&rustls::version::TLS13], &[b"http/1.1"]).await;
    let prober = TlsProber::new(port, Duration::from_secs(5), Arc::new(NoGeo)).unwrap();

    let result = prober.probe(localhost()).await.unwrap();

    assert_eq!(result.negotiated_protocol, "TLSv1.3");
    assert_eq!(result.negotiated_alpn, "http/1.1");
    assert!(!result.feasible);
}

#[tokio::test]
async fn server_without_alpn_reports_empty_alpn() {
    let (port, _sni) = tls_server(&[&rustls::version::TLS13], &[]).await;
    let prober = TlsProber::new(port, Duration::from_secs(5), Arc::new(NoGeo)).unwrap();

    let result = prober.probe(localhost()).await.unwrap();

    assert_eq!(result.negotiated_alpn, "");
    assert!(!result.feasible);
}

#[tokio::test]
async fn scan_writes_feasible_rows_to_the_sink() {
    let (port, _sni) = tls_server(&[&rustls::version::TLS13], &[b"h2"]).await;
    let prober = Arc::new(TlsProber::new(port, Duration::from_secs(5), Arc::new(NoGeo)).unwrap());
    // Only .1 has a listener; the rest of the /30 is refused.
    let source = TargetSource::Cidr(CidrExpansion::parse("127.0.0.0/30").unwrap());
    let sink = Arc::new(ResultSink::new(Vec::new()).await.unwrap());
    let session = Arc::new(ScanSession::new());
    let opts = ScanOptions {
        workers: 2,
        pause: Duration::ZERO,
        poll_interval: Duration::from_millis(10),
        shutdown_grace: Duration::from_secs(5),
    };

    let summary = run_scan(source, prober, sink.clone(), session, &opts).await;

    assert!(summary.completed);
    assert_eq!(summary.scanned, 4);
    assert_eq!(summary.feasible, 1);
    let sink = Arc::try_unwrap(sink).unwrap_or_else(|_| panic!("sink still shared"));
    let text = String::from_utf8(sink.into_inner()).unwrap();
    assert!(text.contains("127.0.0.1,127.0.0.0/30,edge.example.test,\"Scan Test Org | Edge Unit\",N/A"));
    assert_eq!(text.lines().count(), 2);
}
