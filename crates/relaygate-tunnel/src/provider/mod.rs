//! Provider side of a tunnel session
//!
//! A [`ProviderSideHandler`] is the relay listener of the session; it owns up to two
//! [`ProviderSideWorker`]s, the current outbound socket and the one it replaced.

mod handler;
mod worker;

pub use handler::{HandlerState, ProviderSideHandler};
pub use worker::{ProviderLink, ProviderSideWorker};
