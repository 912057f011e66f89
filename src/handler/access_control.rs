//! Access control in front of a protected handler.

use async_trait::async_trait;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{Handler, RequestId};
use crate::access_control::{GatewayRequest, ValidatorChain};
use crate::errors::{ErrorTemplate, GatewayError};

/// Runs the validator chain and either renders the classified error or calls
/// the protected handler with the claims in the request extensions.
pub struct AccessControl {
    chain: ValidatorChain,
    errors: Arc<ErrorTemplate>,
    protected: Arc<dyn Handler>,
}

impl AccessControl {
    pub fn new(protected: Arc<dyn Handler>, errors: Arc<ErrorTemplate>, chain: ValidatorChain) -> Self {
        Self {
            chain,
            errors,
            protected,
        }
    }
}

#[async_trait]
impl Handler for AccessControl {
    async fn serve(
        &self,
        mut req: GatewayRequest,
        rw: &mut (dyn Write + Send),
    ) -> Result<(), GatewayError> {
        match self.chain.validate(&req) {
            Ok(claims) => {
                debug!(
                    request_id = %RequestId::of(&req),
                    validators = claims.len(),
                    "Access granted"
                );
                req.extensions_mut().insert(claims);
                self.protected.serve(req, rw).await
            }
            Err(rejection) => {
                let request_id = RequestId::of(&req);
                warn!(
                    request_id = %request_id,
                    validator = %rejection.label,
                    kind = %rejection.kind,
                    error = %rejection.cause,
                    "access control error"
                );
                self.errors.render(
                    rejection.kind,
                    request_id,
                    rejection.challenge.as_deref(),
                    rw,
                )?;
                Ok(())
            }
        }
    }

    fn name(&self) -> Option<&str> {
        Some(self.protected.name().unwrap_or("AccessControl"))
    }
}
