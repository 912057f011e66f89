//! Ordered validator chain.

use std::sync::Arc;
use tracing::debug;

use super::{AccessControlError, AuthorizedClaims, GatewayRequest, Validator};
use crate::errors::ErrorKind;

/// Result of a failed chain traversal.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub kind: ErrorKind,
    /// Label of the validator that failed.
    pub label: String,
    /// `WWW-Authenticate` value supplied by a credential validator.
    pub challenge: Option<String>,
    /// Underlying cause, for logging only.
    pub cause: AccessControlError,
}

impl From<AccessControlError> for Rejection {
    fn from(cause: AccessControlError) -> Self {
        let (kind, challenge) = match &cause {
            AccessControlError::NotConfigured { .. } => (ErrorKind::ConfigurationError, None),
            AccessControlError::CredentialsRequired { challenge, .. } => {
                (ErrorKind::AuthorizationRequired, challenge.clone())
            }
            AccessControlError::Invalid { .. } => (ErrorKind::AuthorizationFailed, None),
        };

        Self {
            kind,
            label: cause.label().to_string(),
            challenge,
            cause,
        }
    }
}

/// Validators applied in configured order; the first failure wins.
#[derive(Clone, Default)]
pub struct ValidatorChain {
    validators: Vec<Arc<dyn Validator>>,
}

impl ValidatorChain {
    pub fn new(validators: Vec<Arc<dyn Validator>>) -> Self {
        Self { validators }
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Labels of the validators in order.
    pub fn labels(&self) -> Vec<&str> {
        self.validators.iter().map(|v| v.label()).collect()
    }

    /// Run every validator in order.
    ///
    /// Stops at the first failure; validators after it are not invoked.
    /// Errors are never aggregated.
    pub fn validate(&self, req: &GatewayRequest) -> Result<AuthorizedClaims, Rejection> {
        let mut authorized = AuthorizedClaims::default();

        for validator in &self.validators {
            match validator.validate(req) {
                Ok(Some(claims)) => {
                    debug!(validator = %validator.label(), sub = %claims.sub, "Validator passed");
                    authorized.insert(validator.label(), claims);
                }
                Ok(None) => {
                    debug!(validator = %validator.label(), "Validator passed without claims");
                }
                Err(e) => return Err(Rejection::from(e)),
            }
        }

        Ok(authorized)
    }
}

impl std::fmt::Debug for ValidatorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatorChain")
            .field("validators", &self.labels())
            .finish()
    }
}
