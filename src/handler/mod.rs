//! Request handlers.

pub mod access_control;
pub mod proxy;

pub use access_control::AccessControl;
pub use proxy::{BackendDispatcher, Proxy, ReqwestDispatcher};

use async_trait::async_trait;
use std::io::Write;

use crate::access_control::GatewayRequest;
use crate::errors::GatewayError;

/// Request id assigned by the server, stored in the request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn of(req: &GatewayRequest) -> &str {
        req.extensions()
            .get::<RequestId>()
            .map(|id| id.0.as_str())
            .unwrap_or("-")
    }
}

/// Serves a request by writing a complete HTTP/1.1 response to `rw`.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn serve(
        &self,
        req: GatewayRequest,
        rw: &mut (dyn Write + Send),
    ) -> Result<(), GatewayError>;

    /// Name used in the access log.
    fn name(&self) -> Option<&str> {
        None
    }
}
