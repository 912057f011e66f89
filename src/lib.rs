//! Zentinel Gateway
//!
//! Authenticating HTTP gateway: every request passes an ordered chain of
//! access-control validators (Basic, JWT, SAML2 ACS) before it is forwarded
//! to the backend, and every response leaves with the configured header
//! policy applied.

pub mod access_control;
pub mod config;
pub mod errors;
pub mod handler;
pub mod saml;
pub mod server;
pub mod writer;

pub use config::GatewayConfig;
pub use server::Gateway;
