//! `relaygate` Tunnel - TLS tunnels brokered through a message relay
//!
//! Lets two endpoints that cannot reach each other exchange a raw byte stream,
//! typically HTTPS, through a relay broker both can reach:
//!
//! - **Consumer side** - a local TLS server accepting exactly one consumer
//!   connection per session
//! - **Provider side** - a TLS client connecting to the provider, rotating its
//!   socket after a configured number of HTTP requests
//! - **Sweeper** - reclaims sessions that went idle
//!
//! # Architecture
//!
//! ```text
//!  consumer                 consumer gateway          relay          provider gateway            provider
//! +--------+   TLS    +---------------------+   REQ-<id>   +---------------------+   TLS    +--------+
//! |        | -------> | ConsumerSideWorker  | -----------> | ProviderSideHandler | -------> |        |
//! |        | <------- |                     | <----------- |  ProviderSideWorker | <------- |        |
//! +--------+          +---------------------+   RESP-<id>  +---------------------+          +--------+
//! ```
//!
//! Each relay message carries one chunk of the stream, at most `max_chunk_size`
//! bytes. Chunk boundaries carry no meaning. Close and switch signals travel on a
//! separate control channel per direction.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use relaygate_tunnel::{
//!     ConsumerSessionRequest, Gateway, GatewayConfig, MemoryRelay, RelayEndpoint, TlsContext,
//!     TlsIdentity,
//! };
//!
//! # async fn run() -> relaygate_tunnel::Result<()> {
//! let identity = TlsIdentity::from_files("gateway.pem", "gateway.key", "ca.pem")?;
//! let gateway = Gateway::new(
//!     GatewayConfig::default(),
//!     Arc::new(MemoryRelay::new()),
//!     TlsContext::new(&identity)?,
//! )?;
//! gateway.start_sweeper()?;
//!
//! let port = gateway
//!     .connect_consumer(ConsumerSessionRequest {
//!         queue_id: "6f1c2f0e".to_string(),
//!         relay: RelayEndpoint::new("relay.example.com", 61617, true),
//!         peer_public_key: "cHJvdmlkZXIta2V5".to_string(),
//!         consumer_name: "thermostat".to_string(),
//!         service_definition: "temperature".to_string(),
//!     })
//!     .await?;
//! println!("consumer may connect to port {port}");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod consumer;
pub mod error;
pub mod gateway;
pub mod http;
pub mod provider;
pub mod registry;
pub mod relay;
pub mod session;
pub mod sweeper;
pub mod tls;

#[cfg(test)]
mod test_support;

// Re-export main types at crate root
pub use config::GatewayConfig;
pub use consumer::{ConsumerSessionParams, ConsumerSideWorker};
pub use error::{Result, TunnelError};
pub use gateway::{ConsumerSessionRequest, Gateway, ProviderSessionRequest, RelayEndpoint};
pub use http::{
    looks_like_chunked_http_request, looks_like_http_request_start, Answer, HttpRequestBuffer,
};
pub use provider::{HandlerState, ProviderLink, ProviderSideHandler, ProviderSideWorker};
pub use registry::{PortLease, PortPool, SessionRegistry};
pub use relay::{
    ControlKind, MemoryRelay, RelayClient, RelayConnection, RelayMessage, RelayMessageListener,
    SessionChannels, Side, CONTROL_SUFFIX,
};
pub use session::{
    ActiveSession, CloseReason, ConnectionRequest, PeerPublicKey, ProviderIdentity,
    SessionContext,
};
pub use sweeper::{ConnectionSweeper, SweepReport, SweeperConfig};
pub use tls::{TlsContext, TlsIdentity};
