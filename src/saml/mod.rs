//! SAML2 Web-SSO support.
//!
//! The gateway acts as an Assertion Consumer Service only: it consumes the
//! responses an IdP posts back, it never issues AuthnRequests.

pub mod acs;
pub mod assertion;
pub mod config;
pub mod document;
pub mod metadata;
pub mod verify;

pub use acs::{Saml2Acs, SamlError};
pub use assertion::{AssertionInfo, WarningInfo};
pub use config::{Saml2Config, ServiceProviderConfig};
pub use metadata::TrustedMetadata;
pub use verify::{CertificatePinning, SignatureVerifier};
