//! Fixtures shared by unit tests

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use rcgen::{CertificateParams, KeyPair};

use crate::config::GatewayConfig;
use crate::consumer::ConsumerSessionParams;
use crate::registry::SessionRegistry;
use crate::relay::{MemoryRelay, RelayClient};
use crate::session::{ConnectionRequest, PeerPublicKey, ProviderIdentity, SessionContext};
use crate::tls::{TlsContext, TlsIdentity};

/// Self-signed identity trusting only itself
pub(crate) fn tls_context() -> TlsContext {
    let key = KeyPair::generate().unwrap();
    let cert = CertificateParams::new(vec!["localhost".to_string()])
        .unwrap()
        .self_signed(&key)
        .unwrap();
    let identity = TlsIdentity::from_pem(
        cert.pem().as_bytes(),
        key.serialize_pem().as_bytes(),
        cert.pem().as_bytes(),
    )
    .unwrap();
    TlsContext::new(&identity).unwrap()
}

/// Loopback binding and short timeouts
pub(crate) fn fast_config() -> GatewayConfig {
    GatewayConfig {
        bind_address: "127.0.0.1".to_string(),
        socket_read_timeout: Duration::from_secs(2),
        provider_connect_timeout: Duration::from_secs(2),
        ..GatewayConfig::default()
    }
}

pub(crate) async fn session_context(
    relay: &Arc<MemoryRelay>,
    ports: RangeInclusive<u16>,
) -> SessionContext {
    let connection = relay
        .create_connection("relay.local", 61616, false)
        .await
        .unwrap();
    SessionContext {
        relay: Arc::clone(relay) as Arc<dyn RelayClient>,
        connection,
        registry: Arc::new(SessionRegistry::new(ports)),
        tls: tls_context(),
        config: Arc::new(fast_config()),
    }
}

/// A port nothing listens on
pub(crate) fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub(crate) fn consumer_params(queue_id: &str) -> ConsumerSessionParams {
    ConsumerSessionParams {
        queue_id: queue_id.to_string(),
        peer_key: PeerPublicKey::parse("cHJvdmlkZXIta2V5").unwrap(),
        consumer_name: "thermostat".to_string(),
        service_definition: "temperature".to_string(),
    }
}

pub(crate) fn connection_request(port: u16) -> ConnectionRequest {
    ConnectionRequest {
        provider: ProviderIdentity {
            system_name: "temperature-provider".to_string(),
            address: "127.0.0.1".to_string(),
            port,
            authentication_info: "cHJvdmlkZXIta2V5".to_string(),
        },
        service_definition: "temperature".to_string(),
        consumer_gateway_public_key: "Y29uc3VtZXIta2V5".to_string(),
    }
}
