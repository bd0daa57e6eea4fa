//! Shared fixtures for the tunnel integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use relaygate_tunnel::tls::{client_config, server_config_with_client_auth};
use relaygate_tunnel::{
    ConnectionRequest, ConsumerSessionRequest, Gateway, GatewayConfig, HttpRequestBuffer,
    MemoryRelay, ProviderIdentity, ProviderSessionRequest, RelayClient, RelayEndpoint, TlsContext,
    TlsIdentity,
};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;

pub const PROVIDER_GATEWAY_KEY: &str = "cHJvdmlkZXItZ2F0ZXdheS1rZXk=";
pub const CONSUMER_GATEWAY_KEY: &str = "Y29uc3VtZXItZ2F0ZXdheS1rZXk=";

/// Test CA and one certificate used by every party
pub struct Pki {
    ca_pem: String,
    cert_pem: String,
    key_pem: String,
}

impl Pki {
    pub fn generate() -> Self {
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "relaygate test ca");
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca_key = KeyPair::generate().unwrap();
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let mut params =
            CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
                .unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, "relaygate test gateway");
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &ca, &ca_key).unwrap();

        Self {
            ca_pem: ca.pem(),
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        }
    }

    pub fn identity(&self) -> TlsIdentity {
        TlsIdentity::from_pem(
            self.cert_pem.as_bytes(),
            self.key_pem.as_bytes(),
            self.ca_pem.as_bytes(),
        )
        .unwrap()
    }

    pub fn tls_context(&self) -> TlsContext {
        TlsContext::new(&self.identity()).unwrap()
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(Arc::new(
            server_config_with_client_auth(&self.identity()).unwrap(),
        ))
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(Arc::new(client_config(&self.identity()).unwrap()))
    }

    /// Trusts the CA but presents no client certificate
    pub fn anonymous_connector(&self) -> TlsConnector {
        let mut roots = RootCertStore::empty();
        for cert in self.identity().trust_roots {
            roots.add(cert).unwrap();
        }
        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }
}

/// How the test provider answers
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Write back every byte read
    Echo,
    /// Answer each complete request with `200 OK` and this body
    Http(&'static str),
    /// Answer one request like `Http`, then close the connection
    HttpOnce(&'static str),
}

/// TLS server standing in for a provider
pub struct TestProvider {
    pub port: u16,
    connections: Arc<AtomicUsize>,
    open: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl TestProvider {
    pub async fn start(pki: &Pki, behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let acceptor = pki.acceptor();
        let connections = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let counter = Arc::clone(&connections);
        let live = Arc::clone(&open);
        let stop = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { continue };
                        counter.fetch_add(1, Ordering::SeqCst);
                        live.fetch_add(1, Ordering::SeqCst);
                        let acceptor = acceptor.clone();
                        let stop = stop.clone();
                        let live = Arc::clone(&live);
                        tokio::spawn(async move {
                            tokio::select! {
                                () = stop.cancelled() => {}
                                () = serve(acceptor, stream, behavior) => {}
                            }
                            live.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                }
            }
        });

        Self {
            port,
            connections,
            open,
            shutdown,
        }
    }

    /// Number of TCP connections accepted so far
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Number of connections not yet closed by either end
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for TestProvider {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve(acceptor: TlsAcceptor, stream: TcpStream, behavior: Behavior) {
    let Ok(mut tls) = acceptor.accept(stream).await else {
        return;
    };
    let mut buf = vec![0u8; 4096];
    let mut requests = HttpRequestBuffer::new();

    loop {
        let n = match tls.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        match behavior {
            Behavior::Echo => {
                if tls.write_all(&buf[..n]).await.is_err() {
                    return;
                }
            }
            Behavior::Http(body) => {
                requests.push(&buf[..n]);
                while requests.next_request().is_some() {
                    let response = http_response(body);
                    if tls.write_all(response.as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
            Behavior::HttpOnce(body) => {
                requests.push(&buf[..n]);
                if requests.next_request().is_some() {
                    let response = http_response(body);
                    if tls.write_all(response.as_bytes()).await.is_ok() {
                        let _ = tls.shutdown().await;
                    }
                    return;
                }
            }
        }
        if tls.flush().await.is_err() {
            return;
        }
    }
}

pub fn http_response(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
}

/// Start of `count` consecutive ports free on the loopback interface
pub fn free_port_range(count: u16) -> u16 {
    let mut start = 20_000u16;
    while start < 60_000 {
        let held: Vec<_> = (start..start + count)
            .map_while(|port| std::net::TcpListener::bind(("127.0.0.1", port)).ok())
            .collect();
        if held.len() == usize::from(count) {
            return start;
        }
        start += count.max(1) + 7;
    }
    panic!("no free port range");
}

pub fn gateway_config(first_port: u16, count: u16) -> GatewayConfig {
    GatewayConfig {
        bind_address: "127.0.0.1".to_string(),
        port_range: (first_port, first_port + count - 1),
        socket_read_timeout: Duration::from_secs(5),
        provider_connect_timeout: Duration::from_secs(5),
        ..GatewayConfig::default()
    }
}

pub fn endpoint() -> RelayEndpoint {
    RelayEndpoint::new("relay.local", 61616, false)
}

/// A consumer gateway and a provider gateway meeting on one in-memory relay
pub struct GatewayPair {
    pub relay: Arc<MemoryRelay>,
    pub consumer: Gateway,
    pub provider: Gateway,
}

impl GatewayPair {
    pub fn new(pki: &Pki, consumer_config: GatewayConfig, provider_config: GatewayConfig) -> Self {
        let relay = Arc::new(MemoryRelay::new());
        let consumer = Gateway::new(
            consumer_config,
            Arc::clone(&relay) as Arc<dyn RelayClient>,
            pki.tls_context(),
        )
        .unwrap();
        let provider = Gateway::new(
            provider_config,
            Arc::clone(&relay) as Arc<dyn RelayClient>,
            pki.tls_context(),
        )
        .unwrap();
        Self {
            relay,
            consumer,
            provider,
        }
    }

    /// Open both sides of `queue_id`; returns the consumer port
    pub async fn open_session(&self, queue_id: &str, provider_port: u16) -> u16 {
        self.provider
            .connect_provider(ProviderSessionRequest {
                queue_id: queue_id.to_string(),
                relay: endpoint(),
                connection: ConnectionRequest {
                    provider: ProviderIdentity {
                        system_name: "temperature-provider".to_string(),
                        address: "127.0.0.1".to_string(),
                        port: provider_port,
                        authentication_info: "cHJvdmlkZXIta2V5".to_string(),
                    },
                    service_definition: "temperature".to_string(),
                    consumer_gateway_public_key: CONSUMER_GATEWAY_KEY.to_string(),
                },
            })
            .await
            .unwrap();

        self.consumer
            .connect_consumer(ConsumerSessionRequest {
                queue_id: queue_id.to_string(),
                relay: endpoint(),
                peer_public_key: PROVIDER_GATEWAY_KEY.to_string(),
                consumer_name: "thermostat".to_string(),
                service_definition: "temperature".to_string(),
            })
            .await
            .unwrap()
    }

    pub async fn shutdown(&self) {
        self.consumer.shutdown().await;
        self.provider.shutdown().await;
    }
}

/// Connect to a consumer-side listener as the consumer
pub async fn connect_consumer(pki: &Pki, port: u16) -> TlsStream<TcpStream> {
    let tcp = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    pki.connector()
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap()
}

/// Read exactly `len` bytes or fail after a few seconds
pub async fn read_exactly(stream: &mut TlsStream<TcpStream>, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("response in time")
        .expect("response bytes");
    buf
}

/// Poll `condition` until it holds or a few seconds pass
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    condition()
}
