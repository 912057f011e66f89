//! Response header policy: server identity, secure cookie handling and
//! configured header modifiers.

use http::header::{HeaderMap, HeaderName, HeaderValue, SERVER, SET_COOKIE};
use serde::Deserialize;
use tracing::warn;

/// Value of the `Server` response header.
pub const SERVER_NAME: &str = "zentinel";

/// What to do with the `Secure` attribute of backend cookies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecureCookies {
    #[default]
    Keep,
    Strip,
}

/// One response header operation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase", deny_unknown_fields)]
pub enum HeaderOp {
    Add { name: String, value: String },
    Remove { name: String },
    Set { name: String, value: String },
}

impl HeaderOp {
    pub fn name(&self) -> &str {
        match self {
            HeaderOp::Add { name, .. } | HeaderOp::Remove { name } | HeaderOp::Set { name, .. } => {
                name
            }
        }
    }
}

/// Request attributes available to `${...}` expressions in header values.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub host: Option<String>,
    pub headers: HeaderMap,
}

impl EvalContext {
    pub fn from_request<B>(req: &http::Request<B>, request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            method: req.method().to_string(),
            path: req.uri().path().to_string(),
            query: req.uri().query().map(str::to_string),
            host: req
                .headers()
                .get(http::header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .or_else(|| req.uri().host().map(str::to_string)),
            headers: req.headers().clone(),
        }
    }

    fn lookup(&self, expr: &str) -> Option<String> {
        match expr {
            "request.id" => Some(self.request_id.clone()),
            "request.method" => Some(self.method.clone()),
            "request.path" => Some(self.path.clone()),
            "request.query" => self.query.clone(),
            "request.host" => self.host.clone(),
            _ => {
                let name = expr.strip_prefix("request.headers.")?;
                self.headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            }
        }
    }

    /// Replace every `${expr}` in `template`. Unknown or missing values
    /// expand to an empty string; an unterminated `${` is kept literally.
    pub fn expand(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) => {
                    if let Some(value) = self.lookup(after[..end].trim()) {
                        out.push_str(&value);
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// Header rules applied once, when a response head is committed.
#[derive(Debug, Clone)]
pub struct HeaderPolicy {
    pub server: String,
    pub secure_cookies: SecureCookies,
    pub modifiers: Vec<HeaderOp>,
}

impl Default for HeaderPolicy {
    fn default() -> Self {
        Self {
            server: SERVER_NAME.to_string(),
            secure_cookies: SecureCookies::Keep,
            modifiers: Vec::new(),
        }
    }
}

impl HeaderPolicy {
    pub fn new(secure_cookies: SecureCookies, modifiers: Vec<HeaderOp>) -> Self {
        Self {
            secure_cookies,
            modifiers,
            ..Default::default()
        }
    }

    /// Server identity and cookie handling.
    pub fn configure(&self, headers: &mut HeaderMap) {
        if let Ok(value) = HeaderValue::from_str(&self.server) {
            headers.insert(SERVER, value);
        }
        if self.secure_cookies == SecureCookies::Strip {
            strip_secure_cookies(headers);
        }
    }

    /// Apply the modifiers in declared order.
    pub fn apply_modifiers(&self, headers: &mut HeaderMap, ctx: Option<&EvalContext>) {
        for op in &self.modifiers {
            let Ok(name) = HeaderName::from_bytes(op.name().as_bytes()) else {
                warn!(header = %op.name(), "Skipping modifier with invalid header name");
                continue;
            };

            let value = match op {
                HeaderOp::Add { value, .. } | HeaderOp::Set { value, .. } => {
                    let expanded = match ctx {
                        Some(ctx) => ctx.expand(value),
                        None => EvalContext::default().expand(value),
                    };
                    match HeaderValue::from_str(&expanded) {
                        Ok(v) => Some(v),
                        Err(_) => {
                            warn!(header = %name, "Skipping modifier with invalid header value");
                            continue;
                        }
                    }
                }
                HeaderOp::Remove { .. } => None,
            };

            match (op, value) {
                (HeaderOp::Add { .. }, Some(v)) => {
                    headers.append(name, v);
                }
                (HeaderOp::Set { .. }, Some(v)) => {
                    headers.insert(name, v);
                }
                _ => {
                    headers.remove(name);
                }
            }
        }
    }

    /// Validate modifier header names.
    pub fn validate(&self) -> Result<(), String> {
        for op in &self.modifiers {
            HeaderName::from_bytes(op.name().as_bytes())
                .map_err(|_| format!("invalid response header name: {:?}", op.name()))?;
        }
        Ok(())
    }
}

/// Remove the `Secure` attribute from every `Set-Cookie` header.
pub fn strip_secure_cookies(headers: &mut HeaderMap) {
    let cookies: Vec<HeaderValue> = headers.get_all(SET_COOKIE).iter().cloned().collect();
    if cookies.is_empty() {
        return;
    }

    headers.remove(SET_COOKIE);
    for cookie in cookies {
        let stripped = match cookie.to_str() {
            Ok(s) => {
                let parts: Vec<&str> = s
                    .split(';')
                    .filter(|part| !part.trim().eq_ignore_ascii_case("secure"))
                    .collect();
                HeaderValue::from_str(&parts.join(";")).unwrap_or(cookie)
            }
            Err(_) => cookie,
        };
        headers.append(SET_COOKIE, stripped);
    }
}
