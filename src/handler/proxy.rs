//! Backend proxy handler.

use async_trait::async_trait;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST, UPGRADE};
use http::uri::{Authority, Scheme, Uri};
use http::StatusCode;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{Handler, RequestId};
use crate::access_control::{AuthorizedClaims, GatewayRequest};
use crate::config::BackendConfig;
use crate::errors::GatewayError;

const REQUEST_ID_HEADER: &str = "x-request-id";
const CLAIM_HEADER_PREFIX: &str = "x-auth-claim-";

/// Sends a request to the backend and writes the raw response to `rw`.
#[async_trait]
pub trait BackendDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        req: GatewayRequest,
        rw: &mut (dyn Write + Send),
    ) -> Result<(), GatewayError>;
}

/// Removes hop-by-hop headers, including the ones named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all("connection")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|s| HeaderName::from_bytes(s.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }

    for name in [
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "trailers",
        "transfer-encoding",
        "upgrade",
    ] {
        headers.remove(name);
    }
}

/// Protocol requested through `Connection: upgrade` plus `Upgrade`.
pub fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    if wants_upgrade {
        headers.get(UPGRADE).cloned()
    } else {
        None
    }
}

fn response_head(status: StatusCode, headers: &HeaderMap) -> Vec<u8> {
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
    .into_bytes();
    for (name, value) in headers.iter() {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

/// Copy bytes both ways between the upgraded client and backend connections.
async fn tunnel(client: OnUpgrade, mut backend: reqwest::Upgraded, request_id: String) {
    let client = match client.await {
        Ok(client) => client,
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "Client connection upgrade failed");
            return;
        }
    };

    let mut client = TokioIo::new(client);
    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
        Ok((to_backend, to_client)) => debug!(
            request_id = %request_id,
            to_backend,
            to_client,
            "Upgraded connection closed"
        ),
        Err(e) => debug!(request_id = %request_id, error = %e, "Upgraded connection failed"),
    }
}

/// Backend dispatch over `reqwest`.
pub struct ReqwestDispatcher {
    client: reqwest::Client,
    scheme: Scheme,
    authority: Authority,
    host: HeaderValue,
    request_headers: Vec<(HeaderName, HeaderValue)>,
    user_id_header: HeaderName,
    auth_method_header: HeaderName,
    timeout: Duration,
}

impl ReqwestDispatcher {
    pub fn from_config(config: &BackendConfig) -> anyhow::Result<Self> {
        let origin: Uri = config
            .origin
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid backend origin {:?}: {}", config.origin, e))?;
        let scheme = origin
            .scheme()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Backend origin has no scheme: {}", config.origin))?;
        let authority = origin
            .authority()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Backend origin has no host: {}", config.origin))?;

        let host = config
            .host
            .clone()
            .unwrap_or_else(|| authority.to_string());
        let host = HeaderValue::from_str(&host)
            .map_err(|_| anyhow::anyhow!("Invalid backend host: {:?}", host))?;

        let mut request_headers = Vec::new();
        for (name, value) in &config.request_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| anyhow::anyhow!("Invalid backend request header name: {:?}", name))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| anyhow::anyhow!("Invalid value for backend request header {}", name))?;
            request_headers.push((name, value));
        }

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            scheme,
            authority,
            host,
            request_headers,
            user_id_header: HeaderName::from_bytes(config.user_id_header.as_bytes())?,
            auth_method_header: HeaderName::from_bytes(config.auth_method_header.as_bytes())?,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    /// Rewrite the request for the backend.
    pub fn director(&self, req: &mut GatewayRequest) -> Result<(), GatewayError> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        let uri = Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| GatewayError::Backend(format!("invalid backend URI: {}", e)))?;
        *req.uri_mut() = uri;

        let request_id = RequestId::of(req).to_string();
        let claims = req.extensions().get::<AuthorizedClaims>().cloned();
        let headers = req.headers_mut();

        let upgrade = upgrade_protocol(headers);
        strip_hop_by_hop(headers);
        if let Some(protocol) = upgrade {
            headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
            headers.insert(UPGRADE, protocol);
        }
        headers.remove(&self.user_id_header);
        headers.remove(&self.auth_method_header);
        let spoofed: Vec<HeaderName> = headers
            .keys()
            .filter(|name| name.as_str().starts_with(CLAIM_HEADER_PREFIX))
            .cloned()
            .collect();
        for name in spoofed {
            headers.remove(name);
        }

        headers.insert(HOST, self.host.clone());
        for (name, value) in &self.request_headers {
            headers.insert(name.clone(), value.clone());
        }
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(REQUEST_ID_HEADER, value);
        }

        if let Some((label, claims)) = claims.as_ref().and_then(|c| c.primary()) {
            if let Ok(value) = HeaderValue::from_str(&claims.sub) {
                headers.insert(self.user_id_header.clone(), value);
            }
            if let Ok(value) = HeaderValue::from_str(label) {
                headers.insert(self.auth_method_header.clone(), value);
            }
            for (name, value) in &claims.attributes {
                let header = format!("{}{}", CLAIM_HEADER_PREFIX, name.to_ascii_lowercase());
                match (
                    HeaderName::from_bytes(header.as_bytes()),
                    HeaderValue::from_str(&value.to_header_value()),
                ) {
                    (Ok(n), Ok(v)) => {
                        headers.insert(n, v);
                    }
                    _ => debug!(claim = %name, "Claim not representable as header, skipped"),
                }
            }
        }

        debug!(
            request_id = %request_id,
            uri = %req.uri(),
            custom_headers = self.request_headers.len(),
            "Request directed to backend"
        );
        Ok(())
    }
}

#[async_trait]
impl BackendDispatcher for ReqwestDispatcher {
    async fn dispatch(
        &self,
        mut req: GatewayRequest,
        rw: &mut (dyn Write + Send),
    ) -> Result<(), GatewayError> {
        let client_upgrade = upgrade_protocol(req.headers()).map(|_| hyper::upgrade::on(&mut req));
        let request_id = RequestId::of(&req).to_string();
        self.director(&mut req)?;

        let (parts, body) = req.into_parts();
        let url = parts.uri.to_string();
        let mut response = self
            .client
            .request(parts.method, url)
            .headers(parts.headers)
            .body(body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::BackendTimeout
                } else {
                    GatewayError::Backend(e.to_string())
                }
            })?;

        let status = response.status();
        let mut headers = response.headers().clone();
        strip_hop_by_hop(&mut headers);

        if status == StatusCode::SWITCHING_PROTOCOLS {
            let client = client_upgrade.ok_or_else(|| {
                GatewayError::Backend("backend switched protocols without an upgrade request".into())
            })?;
            let protocol = response
                .headers()
                .get(UPGRADE)
                .cloned()
                .ok_or_else(|| GatewayError::Backend("101 response without Upgrade header".into()))?;
            let backend = response
                .upgrade()
                .await
                .map_err(|e| GatewayError::Backend(e.to_string()))?;

            headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
            headers.insert(UPGRADE, protocol);
            rw.write_all(&response_head(status, &headers))?;
            rw.flush()?;

            debug!(request_id = %request_id, "Backend switched protocols, tunneling");
            tokio::spawn(tunnel(client, backend, request_id));
            return Ok(());
        }

        rw.write_all(&response_head(status, &headers))?;

        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => rw.write_all(&chunk)?,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Backend response body failed");
                    return Err(GatewayError::Backend(e.to_string()));
                }
            }
        }
        rw.flush()?;
        Ok(())
    }
}

/// Forwards requests to the backend.
pub struct Proxy {
    dispatcher: Arc<dyn BackendDispatcher>,
}

impl Proxy {
    pub fn new(dispatcher: Arc<dyn BackendDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl Handler for Proxy {
    async fn serve(
        &self,
        req: GatewayRequest,
        rw: &mut (dyn Write + Send),
    ) -> Result<(), GatewayError> {
        self.dispatcher.dispatch(req, rw).await
    }

    fn name(&self) -> Option<&str> {
        Some("Proxy")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_control::{ClaimValue, Claims};
    use bytes::Bytes;
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn config(origin: &str) -> BackendConfig {
        BackendConfig {
            origin: origin.to_string(),
            host: None,
            request_headers: HashMap::from([("X-Gateway".to_string(), "zentinel".to_string())]),
            timeout_secs: 5,
            user_id_header: "X-User-Id".to_string(),
            auth_method_header: "X-Auth-Method".to_string(),
        }
    }

    fn claims() -> AuthorizedClaims {
        let mut claims = Claims::new("alice");
        claims.attributes.insert(
            "memberOf".to_string(),
            ClaimValue::Multiple(vec!["g1".into(), "g2".into()]),
        );
        let mut authorized = AuthorizedClaims::default();
        authorized.insert("sso", claims);
        authorized
    }

    fn request() -> GatewayRequest {
        let mut req = http::Request::builder()
            .method("GET")
            .uri("/api/items?page=2")
            .header("Host", "gw.example.com")
            .header("Connection", "keep-alive, X-Hop")
            .header("X-Hop", "1")
            .header("X-User-Id", "mallory")
            .header("X-Auth-Claim-Role", "admin")
            .header("Accept", "application/json")
            .body(Bytes::new())
            .unwrap();
        req.extensions_mut().insert(RequestId("req-9".into()));
        req.extensions_mut().insert(claims());
        req
    }

    #[test]
    fn test_director() {
        let dispatcher = ReqwestDispatcher::from_config(&config("http://127.0.0.1:9000")).unwrap();
        let mut req = request();
        dispatcher.director(&mut req).unwrap();

        assert_eq!(req.uri().to_string(), "http://127.0.0.1:9000/api/items?page=2");

        let headers = req.headers();
        assert_eq!(headers["host"], "127.0.0.1:9000");
        assert_eq!(headers["x-gateway"], "zentinel");
        assert_eq!(headers["x-request-id"], "req-9");
        assert_eq!(headers["x-user-id"], "alice");
        assert_eq!(headers["x-auth-method"], "sso");
        assert_eq!(headers["x-auth-claim-memberof"], "g1,g2");
        assert_eq!(headers["accept"], "application/json");
        assert!(!headers.contains_key("connection"));
        assert!(!headers.contains_key("x-hop"));
        assert!(!headers.contains_key("x-auth-claim-role"));
    }

    #[test]
    fn test_director_without_claims() {
        let mut cfg = config("https://backend.internal");
        cfg.host = Some("api.example.com".to_string());
        let dispatcher = ReqwestDispatcher::from_config(&cfg).unwrap();

        let mut req = http::Request::builder()
            .uri("/")
            .header("X-User-Id", "mallory")
            .body(Bytes::new())
            .unwrap();
        dispatcher.director(&mut req).unwrap();

        assert_eq!(req.uri().to_string(), "https://backend.internal/");
        assert_eq!(req.headers()["host"], "api.example.com");
        assert!(!req.headers().contains_key("x-user-id"));
    }

    #[test]
    fn test_director_keeps_upgrade() {
        let dispatcher = ReqwestDispatcher::from_config(&config("http://127.0.0.1:9000")).unwrap();
        let mut req = http::Request::builder()
            .uri("/ws")
            .header("Connection", "keep-alive, Upgrade, X-Hop")
            .header("Upgrade", "websocket")
            .header("X-Hop", "1")
            .body(Bytes::new())
            .unwrap();
        dispatcher.director(&mut req).unwrap();

        assert_eq!(req.headers()["connection"], "upgrade");
        assert_eq!(req.headers()["upgrade"], "websocket");
        assert!(!req.headers().contains_key("x-hop"));
    }

    #[test]
    fn test_upgrade_protocol() {
        let mut headers = HeaderMap::new();
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        assert_eq!(upgrade_protocol(&headers), None);

        headers.insert("connection", HeaderValue::from_static("keep-alive, Upgrade"));
        assert_eq!(upgrade_protocol(&headers), Some(HeaderValue::from_static("websocket")));

        headers.remove("upgrade");
        assert_eq!(upgrade_protocol(&headers), None);
    }

    #[test]
    fn test_invalid_origin() {
        assert!(ReqwestDispatcher::from_config(&config("not a url")).is_err());
        assert!(ReqwestDispatcher::from_config(&config("/relative")).is_err());
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("close, x-private"));
        headers.insert("x-private", HeaderValue::from_static("1"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));

        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("content-type"));
    }

    #[tokio::test]
    async fn test_dispatch_writes_raw_response() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let backend = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            while !received.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Backend: yes\r\nConnection: close\r\n\r\nhello")
                .await
                .unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&received).to_lowercase()
        });

        let dispatcher = ReqwestDispatcher::from_config(&config(&format!("http://{}", addr))).unwrap();
        let proxy = Proxy::new(Arc::new(dispatcher));

        let mut out = Vec::new();
        proxy.serve(request(), &mut out).await.unwrap();

        let received = backend.await.unwrap();
        assert!(received.starts_with("get /api/items?page=2 http/1.1\r\n"));
        assert!(received.contains("x-user-id: alice\r\n"));
        assert!(!received.contains("mallory"));

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("x-backend: yes\r\n"));
        assert!(!text.contains("connection:"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn test_unrequested_switch_is_backend_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 101 Switching Protocols\r\nConnection: upgrade\r\nUpgrade: x\r\n\r\n")
                .await;
        });

        let dispatcher = ReqwestDispatcher::from_config(&config(&format!("http://{}", addr))).unwrap();
        let mut out = Vec::new();
        let err = dispatcher.dispatch(request(), &mut out).await.unwrap_err();
        assert!(matches!(err, GatewayError::Backend(_)));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_backend() {
        // Bind and drop to get a port nobody listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let dispatcher =
            ReqwestDispatcher::from_config(&config(&format!("http://127.0.0.1:{}", port))).unwrap();

        let mut out = Vec::new();
        let err = dispatcher.dispatch(request(), &mut out).await.unwrap_err();
        assert!(matches!(err, GatewayError::Backend(_)));
        assert!(out.is_empty());
    }
}
