//! HTTP server: routing, request ids, body limits, deadlines and the access
//! log.

use anyhow::{Context, Result};
use bytes::Bytes;
use http::header::HeaderValue;
use http::{Request, Response};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::access_control::{GatewayRequest, ValidatorChain};
use crate::config::GatewayConfig;
use crate::errors::{ErrorKind, ErrorTemplate};
use crate::handler::{AccessControl, Handler, Proxy, RequestId, ReqwestDispatcher};
use crate::writer::{BufferedResponse, EvalContext, HeaderPolicy, ResponseInterceptor};

const REQUEST_ID_HEADER: &str = "x-request-id";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

type Interceptor = ResponseInterceptor<BufferedResponse>;

/// Path prefix routing. The longest matching prefix wins.
#[derive(Default)]
pub struct Router {
    routes: Vec<(String, Arc<dyn Handler>)>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, prefix: impl Into<String>, handler: Arc<dyn Handler>) {
        self.routes.push((prefix.into(), handler));
        self.routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    }

    pub fn lookup(&self, path: &str) -> Option<&Arc<dyn Handler>> {
        self.routes
            .iter()
            .find(|(prefix, _)| prefix_matches(prefix, path))
            .map(|(_, handler)| handler)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }
}

/// `/api` matches `/api` and `/api/x` but not `/apix`.
fn prefix_matches(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || prefix.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}

/// The gateway: shared, read-only request processing state.
pub struct Gateway {
    router: Router,
    policy: Arc<HeaderPolicy>,
    errors: Arc<ErrorTemplate>,
    max_body_bytes: usize,
    request_timeout: Duration,
}

impl Gateway {
    pub fn new(
        router: Router,
        policy: HeaderPolicy,
        errors: ErrorTemplate,
        max_body_bytes: usize,
        request_timeout: Duration,
    ) -> Self {
        Self {
            router,
            policy: Arc::new(policy),
            errors: Arc::new(errors),
            max_body_bytes,
            request_timeout,
        }
    }

    /// Wire validators, the backend proxy and the routes from config.
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let errors = Arc::new(config.error_template()?);
        let validators = config.build_validators()?;

        let dispatcher = ReqwestDispatcher::from_config(&config.backend)
            .context("Failed to configure backend")?;
        let proxy: Arc<dyn Handler> = Arc::new(Proxy::new(Arc::new(dispatcher)));

        let mut router = Router::new();
        for endpoint in &config.endpoints {
            let chain: Vec<_> = endpoint
                .access_control
                .iter()
                .filter_map(|name| validators.get(name).cloned())
                .collect();

            let handler: Arc<dyn Handler> = if chain.is_empty() {
                Arc::clone(&proxy)
            } else {
                Arc::new(AccessControl::new(
                    Arc::clone(&proxy),
                    Arc::clone(&errors),
                    ValidatorChain::new(chain),
                ))
            };

            info!(
                path = %endpoint.path,
                access_control = ?endpoint.access_control,
                "Endpoint configured"
            );
            router.add(endpoint.path.clone(), handler);
        }

        Ok(Self {
            router,
            policy: Arc::new(config.header_policy()),
            errors,
            max_body_bytes: config.max_body_bytes,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    /// Serve one request.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let request_id = uuid::Uuid::new_v4().to_string();
        let ctx = EvalContext::from_request(&req, &request_id);
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let mut rw = self.interceptor(&ctx);
        let mut handler_name = "-";

        let (parts, body) = req.into_parts();
        match Limited::new(body, self.max_body_bytes).collect().await {
            Ok(collected) => {
                let mut req = Request::from_parts(parts, collected.to_bytes());
                req.extensions_mut().insert(RequestId(request_id.clone()));

                match self.router.lookup(&path) {
                    Some(handler) => {
                        handler_name = handler.name().unwrap_or("-");
                        rw = self.serve(handler.as_ref(), req, rw, &ctx).await;
                    }
                    None => self.render(ErrorKind::RouteNotFound, &request_id, &mut rw),
                }
            }
            Err(e) => {
                let kind = if e.downcast_ref::<LengthLimitError>().is_some() {
                    ErrorKind::RequestTooLarge
                } else {
                    ErrorKind::Server
                };
                warn!(request_id = %request_id, error = %e, "Failed to read request body");
                self.render(kind, &request_id, &mut rw);
            }
        }

        let body_bytes = rw.body_bytes();
        let mut response = rw.finish().into_response();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }

        info!(
            request_id = %request_id,
            method = %method,
            path = %path,
            handler = handler_name,
            status = response.status().as_u16(),
            body_bytes,
            "Request served"
        );
        response
    }

    async fn serve(
        &self,
        handler: &dyn Handler,
        req: GatewayRequest,
        mut rw: Interceptor,
        ctx: &EvalContext,
    ) -> Interceptor {
        let request_id = RequestId::of(&req).to_string();
        let kind = match tokio::time::timeout(self.request_timeout, handler.serve(req, &mut rw)).await
        {
            Ok(Ok(())) => return rw,
            Ok(Err(e)) => {
                warn!(request_id = %request_id, error = %e, "Handler failed");
                e.kind()
            }
            Err(_) => {
                warn!(
                    request_id = %request_id,
                    timeout_secs = self.request_timeout.as_secs_f64(),
                    "Request deadline exceeded"
                );
                ErrorKind::BackendTimeout
            }
        };

        if rw.is_committed() {
            return rw;
        }

        // Discard whatever partial head the handler left behind.
        let mut rw = self.interceptor(ctx);
        self.render(kind, &request_id, &mut rw);
        rw
    }

    fn interceptor(&self, ctx: &EvalContext) -> Interceptor {
        ResponseInterceptor::new(BufferedResponse::new(), Arc::clone(&self.policy))
            .with_eval_context(ctx.clone())
    }

    fn render(&self, kind: ErrorKind, request_id: &str, rw: &mut Interceptor) {
        if let Err(e) = self.errors.render(kind, request_id, None, rw) {
            warn!(request_id = %request_id, error = %e, "Failed to render error page");
        }
    }

    /// Accept connections until `shutdown` resolves, then drain.
    pub async fn run<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        info!(
            address = %listener.local_addr().context("Listener has no local address")?,
            routes = self.router.len(),
            "Gateway listening"
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    let gateway = Arc::clone(&self);
                    let mut stop_rx = stop_rx.clone();
                    connections.spawn(async move {
                        let service = service_fn(move |req| {
                            let gateway = Arc::clone(&gateway);
                            async move { Ok::<_, Infallible>(gateway.handle(req).await) }
                        });
                        let conn = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .with_upgrades();
                        tokio::pin!(conn);

                        let result = tokio::select! {
                            result = conn.as_mut() => result,
                            _ = stop_rx.changed() => {
                                conn.as_mut().graceful_shutdown();
                                conn.await
                            }
                        };
                        if let Err(e) = result {
                            debug!(peer = %peer, error = %e, "Connection closed with error");
                        }
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = &mut shutdown => break,
            }
        }

        drop(listener);
        let _ = stop_tx.send(true);
        info!(connections = connections.len(), "Shutting down, draining connections");

        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                connections = connections.len(),
                "Drain timeout reached, closing remaining connections"
            );
            connections.abort_all();
        }

        info!("Gateway stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_control::chain::tests::StubValidator;
    use crate::access_control::AccessControlError;
    use crate::errors::{GatewayError, ERROR_HEADER};
    use crate::writer::{HeaderOp, SecureCookies};
    use crate::config::BackendConfig;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::io::Write;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

    /// Writes a fixed raw response, optionally after a delay or followed by
    /// an error.
    struct Fixed {
        response: &'static [u8],
        delay: Option<Duration>,
        then_fail: bool,
    }

    impl Fixed {
        fn ok(response: &'static [u8]) -> Arc<dyn Handler> {
            Arc::new(Self {
                response,
                delay: None,
                then_fail: false,
            })
        }
    }

    #[async_trait]
    impl Handler for Fixed {
        async fn serve(
            &self,
            req: GatewayRequest,
            rw: &mut (dyn Write + Send),
        ) -> Result<(), GatewayError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            rw.write_all(self.response)?;
            if !req.body().is_empty() {
                rw.write_all(req.body())?;
            }
            if self.then_fail {
                return Err(GatewayError::Backend("connection reset".into()));
            }
            Ok(())
        }

        fn name(&self) -> Option<&str> {
            Some("Fixed")
        }
    }

    fn gateway(router: Router) -> Gateway {
        let policy = HeaderPolicy::new(
            SecureCookies::Keep,
            vec![HeaderOp::Set {
                name: "X-Trace".into(),
                value: "${request.id}".into(),
            }],
        );
        Gateway::new(
            router,
            policy,
            ErrorTemplate::default(),
            16,
            Duration::from_millis(200),
        )
    }

    fn get(path: &str) -> Request<Full<Bytes>> {
        Request::builder().uri(path).body(Full::new(Bytes::new())).unwrap()
    }

    async fn body_of(response: Response<Full<Bytes>>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[test]
    fn test_router_longest_prefix() {
        let mut router = Router::new();
        router.add("/", Fixed::ok(b"HTTP/1.1 200 OK\r\n\r\nroot"));
        router.add("/api", Fixed::ok(b"HTTP/1.1 200 OK\r\n\r\napi"));
        router.add("/api/admin/", Fixed::ok(b"HTTP/1.1 200 OK\r\n\r\nadmin"));

        assert!(router.lookup("/api/items").is_some());
        assert!(prefix_matches("/api", "/api"));
        assert!(prefix_matches("/api", "/api/items"));
        assert!(!prefix_matches("/api", "/apix"));
        assert!(prefix_matches("/", "/anything"));
        assert!(prefix_matches("/api/admin/", "/api/admin/users"));

        let empty = Router::new();
        assert!(empty.lookup("/").is_none());
    }

    #[tokio::test]
    async fn test_handle_success() {
        let mut router = Router::new();
        router.add(
            "/",
            Fixed::ok(b"HTTP/1.1 201 Created\r\nContent-Type: text/plain\r\n\r\nhi"),
        );
        let gw = gateway(router);

        let response = gw.handle(get("/x")).await;
        assert_eq!(response.status(), 201);
        assert_eq!(response.headers()["server"], "zentinel");
        assert_eq!(response.headers()["content-type"], "text/plain");

        let request_id = response.headers()["x-request-id"].to_str().unwrap().to_string();
        assert_eq!(request_id.len(), 36);
        assert_eq!(response.headers()["x-trace"], request_id.as_str());
        assert_eq!(body_of(response).await, "hi");
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let mut router = Router::new();
        router.add("/api", Fixed::ok(b"HTTP/1.1 200 OK\r\n\r\n"));
        let gw = gateway(router);

        let response = gw.handle(get("/other")).await;
        assert_eq!(response.status(), 404);
        assert_eq!(response.headers()[ERROR_HEADER], "route_not_found");
        assert_eq!(response.headers()["server"], "zentinel");
    }

    #[tokio::test]
    async fn test_body_limit() {
        let mut router = Router::new();
        router.add("/", Fixed::ok(b"HTTP/1.1 200 OK\r\n\r\n"));
        let gw = gateway(router);

        let small = Request::post("/").body(Full::new(Bytes::from("0123456789"))).unwrap();
        let response = gw.handle(small).await;
        assert_eq!(response.status(), 200);
        assert_eq!(body_of(response).await, "0123456789");

        let large = Request::post("/")
            .body(Full::new(Bytes::from(vec![b'x'; 17])))
            .unwrap();
        let response = gw.handle(large).await;
        assert_eq!(response.status(), 413);
        assert_eq!(response.headers()[ERROR_HEADER], "request_too_large");
    }

    #[tokio::test]
    async fn test_deadline_before_commit() {
        let mut router = Router::new();
        router.add(
            "/",
            Arc::new(Fixed {
                response: b"HTTP/1.1 200 OK\r\n\r\n",
                delay: Some(Duration::from_secs(5)),
                then_fail: false,
            }),
        );
        let gw = gateway(router);

        let response = gw.handle(get("/")).await;
        assert_eq!(response.status(), 504);
        assert_eq!(response.headers()[ERROR_HEADER], "backend_timeout");
    }

    #[tokio::test]
    async fn test_handler_error_before_commit() {
        let mut router = Router::new();
        router.add(
            "/",
            Arc::new(Fixed {
                response: b"HTTP/1.1 200 OK\r\nX-Partial: 1\r\n",
                delay: None,
                then_fail: true,
            }),
        );
        let gw = gateway(router);

        let response = gw.handle(get("/")).await;
        assert_eq!(response.status(), 502);
        assert_eq!(response.headers()[ERROR_HEADER], "backend_unavailable");
        assert!(!response.headers().contains_key("x-partial"));
    }

    #[tokio::test]
    async fn test_handler_error_after_commit() {
        let mut router = Router::new();
        router.add(
            "/",
            Arc::new(Fixed {
                response: b"HTTP/1.1 200 OK\r\n\r\npartial",
                delay: None,
                then_fail: true,
            }),
        );
        let gw = gateway(router);

        let response = gw.handle(get("/")).await;
        assert_eq!(response.status(), 200);
        assert_eq!(body_of(response).await, "partial");
    }

    #[tokio::test]
    async fn test_access_control_route() {
        let protected = Fixed::ok(b"HTTP/1.1 200 OK\r\n\r\nsecret");
        let denied = AccessControl::new(
            protected,
            Arc::new(ErrorTemplate::default()),
            ValidatorChain::new(vec![StubValidator::failing(
                "ba",
                AccessControlError::CredentialsRequired {
                    label: "ba".into(),
                    challenge: Some("Basic realm=\"protected\"".into()),
                },
            )]),
        );
        let mut router = Router::new();
        router.add("/", Arc::new(denied));
        let gw = gateway(router);

        let response = gw.handle(get("/")).await;
        assert_eq!(response.status(), 401);
        assert_eq!(response.headers()["www-authenticate"], "Basic realm=\"protected\"");
        assert_eq!(response.headers()[ERROR_HEADER], "authorization_required");
    }

    #[tokio::test]
    async fn test_run_and_shutdown() {
        let mut router = Router::new();
        router.add(
            "/",
            Fixed::ok(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\npong"),
        );
        let gw = Arc::new(gateway(router));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(gw.run(listener, async move {
            let _ = stopped.await;
        }));

        let response = reqwest::get(format!("http://{}/ping", addr)).await.unwrap();
        assert_eq!(response.status(), 200);
        assert!(response.headers().contains_key("x-request-id"));
        assert_eq!(response.text().await.unwrap(), "pong");

        stop.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    async fn read_head<R: AsyncRead + Unpin>(stream: &mut R) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if stream.read(&mut byte).await.unwrap() == 0 {
                break;
            }
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    #[tokio::test]
    async fn test_upgrade_is_tunneled_to_backend() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        let echo = tokio::spawn(async move {
            let (mut socket, _) = backend.accept().await.unwrap();
            let head = read_head(&mut socket).await;
            socket
                .write_all(b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n")
                .await
                .unwrap();
            let mut buf = [0u8; 64];
            loop {
                let n = socket.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                socket.write_all(&buf[..n]).await.unwrap();
            }
            head.to_lowercase()
        });

        let dispatcher = ReqwestDispatcher::from_config(&BackendConfig {
            origin: format!("http://{}", backend_addr),
            host: None,
            request_headers: HashMap::new(),
            timeout_secs: 5,
            user_id_header: "X-User-Id".into(),
            auth_method_header: "X-Auth-Method".into(),
        })
        .unwrap();
        let mut router = Router::new();
        router.add("/", Arc::new(Proxy::new(Arc::new(dispatcher))));
        let gw = Arc::new(gateway(router));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(gw.run(listener, async move {
            let _ = stopped.await;
        }));

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /ws HTTP/1.1\r\nHost: gw.example.com\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n")
            .await
            .unwrap();

        let head = read_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{}", head);
        let lower = head.to_lowercase();
        assert!(lower.contains("upgrade: echo\r\n"));
        assert!(lower.contains("server: zentinel\r\n"));
        assert!(lower.contains("x-request-id: "));

        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");
        drop(client);

        let backend_head = echo.await.unwrap();
        assert!(backend_head.starts_with("get /ws http/1.1\r\n"));
        assert!(backend_head.contains("connection: upgrade\r\n"));
        assert!(backend_head.contains("upgrade: echo\r\n"));

        stop.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
