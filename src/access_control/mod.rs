//! Access control: validators, claims and the ordered validator chain.

pub mod basic;
pub mod chain;
pub mod jwt;

pub use basic::{BasicAuth, BasicAuthConfig};
pub use chain::{Rejection, ValidatorChain};
pub use jwt::{JwtConfig, JwtValidator};

use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;

/// A request with its body fully buffered, as seen by validators.
pub type GatewayRequest = http::Request<Bytes>;

/// Identity record produced by a successful validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Claims {
    pub sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    pub attributes: BTreeMap<String, ClaimValue>,
}

impl Claims {
    pub fn new(sub: impl Into<String>) -> Self {
        Self {
            sub: sub.into(),
            exp: None,
            attributes: BTreeMap::new(),
        }
    }
}

/// A claim attribute is either a single string or an ordered list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ClaimValue {
    Single(String),
    Multiple(Vec<String>),
}

impl ClaimValue {
    /// Header-friendly rendering; lists are comma-joined.
    pub fn to_header_value(&self) -> String {
        match self {
            ClaimValue::Single(s) => s.clone(),
            ClaimValue::Multiple(v) => v.join(","),
        }
    }
}

/// Claims of every validator that produced some, in chain order.
///
/// Inserted into the request extensions once the chain passed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizedClaims(Vec<(String, Claims)>);

impl AuthorizedClaims {
    pub fn insert(&mut self, label: impl Into<String>, claims: Claims) {
        self.0.push((label.into(), claims));
    }

    pub fn get(&self, label: &str) -> Option<&Claims> {
        self.0.iter().find(|(l, _)| l == label).map(|(_, c)| c)
    }

    /// The first validator's claims; these identify the user downstream.
    pub fn primary(&self) -> Option<(&str, &Claims)> {
        self.0.first().map(|(l, c)| (l.as_str(), c))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Claims)> {
        self.0.iter().map(|(l, c)| (l.as_str(), c))
    }
}

/// Why a validator rejected a request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessControlError {
    #[error("{label}: not configured: {reason}")]
    NotConfigured { label: String, reason: String },

    #[error("{label}: credentials required")]
    CredentialsRequired {
        label: String,
        /// Value for a `WWW-Authenticate` header, if the scheme has one.
        challenge: Option<String>,
    },

    #[error("{label}: {reason}")]
    Invalid { label: String, reason: String },
}

impl AccessControlError {
    pub fn label(&self) -> &str {
        match self {
            AccessControlError::NotConfigured { label, .. }
            | AccessControlError::CredentialsRequired { label, .. }
            | AccessControlError::Invalid { label, .. } => label,
        }
    }

    pub(crate) fn invalid(label: &str, reason: impl Into<String>) -> Self {
        AccessControlError::Invalid {
            label: label.to_string(),
            reason: reason.into(),
        }
    }
}

/// A request gate.
///
/// Implementations are built once at startup and shared read-only between
/// requests.
pub trait Validator: Send + Sync {
    /// Configured name of this validator, used in logs and claim maps.
    fn label(&self) -> &str;

    /// Check the request. `Ok(None)` passes without producing claims.
    fn validate(&self, req: &GatewayRequest) -> Result<Option<Claims>, AccessControlError>;
}

/// First value of a header, case-insensitive.
pub(crate) fn header_str<'a>(req: &'a GatewayRequest, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}
