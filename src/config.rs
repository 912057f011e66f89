//! Gateway configuration file.

use anyhow::{anyhow, Context, Result};
use http::header::HeaderName;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::access_control::{BasicAuth, BasicAuthConfig, JwtConfig, JwtValidator, Validator};
use crate::errors::ErrorTemplate;
use crate::saml::{Saml2Acs, Saml2Config};
use crate::writer::{HeaderOp, HeaderPolicy, SecureCookies};

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_max_body_bytes() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_backend_timeout() -> u64 {
    30
}

fn default_user_id_header() -> String {
    "X-User-Id".to_string()
}

fn default_auth_method_header() -> String {
    "X-Auth-Method".to_string()
}

/// Top level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Deadline for the protected handler, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    #[serde(default)]
    pub secure_cookies: SecureCookies,

    /// Custom error page.
    #[serde(default)]
    pub error_file: Option<PathBuf>,

    /// Header modifiers applied to every response.
    #[serde(default)]
    pub response_headers: Vec<HeaderOp>,

    pub backend: BackendConfig,

    #[serde(default)]
    pub access_control: Vec<AccessControlConfig>,

    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,

    /// Directory relative paths resolve against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// Where and how requests are forwarded.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BackendConfig {
    /// Backend base URL, e.g. `http://127.0.0.1:9000`.
    pub origin: String,

    /// Host header sent to the backend. Defaults to the origin authority.
    #[serde(default)]
    pub host: Option<String>,

    /// Extra headers set on every backend request.
    #[serde(default)]
    pub request_headers: HashMap<String, String>,

    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_user_id_header")]
    pub user_id_header: String,

    #[serde(default = "default_auth_method_header")]
    pub auth_method_header: String,
}

impl BackendConfig {
    pub fn validate(&self) -> Result<(), String> {
        let uri: http::Uri = self
            .origin
            .parse()
            .map_err(|e| format!("backend origin {:?}: {}", self.origin, e))?;
        match uri.scheme_str() {
            Some("http") | Some("https") => {}
            _ => return Err(format!("backend origin must be an http(s) URL: {}", self.origin)),
        }
        if uri.host().is_none() {
            return Err(format!("backend origin has no host: {}", self.origin));
        }

        for name in self
            .request_headers
            .keys()
            .chain([&self.user_id_header, &self.auth_method_header])
        {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| format!("invalid backend header name: {:?}", name))?;
        }

        if self.timeout_secs == 0 {
            return Err("backend timeout-secs must be positive".to_string());
        }
        Ok(())
    }
}

/// One entry of the `access-control` list.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AccessControlConfig {
    BasicAuth(BasicAuthConfig),
    Jwt(JwtConfig),
    Saml2(Saml2Config),
}

impl AccessControlConfig {
    pub fn name(&self) -> &str {
        match self {
            AccessControlConfig::BasicAuth(c) => &c.name,
            AccessControlConfig::Jwt(c) => &c.name,
            AccessControlConfig::Saml2(c) => &c.name,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            AccessControlConfig::BasicAuth(c) => c.validate(),
            AccessControlConfig::Jwt(c) => c.validate(),
            AccessControlConfig::Saml2(c) => c.validate(),
        }
    }

    /// Build the validator. Files are read relative to `base_dir`.
    pub fn build(&self, base_dir: &Path) -> Result<Arc<dyn Validator>> {
        Ok(match self {
            AccessControlConfig::BasicAuth(c) => Arc::new(BasicAuth::from_config(c)),
            AccessControlConfig::Jwt(c) => Arc::new(JwtValidator::from_config(c, base_dir)?),
            AccessControlConfig::Saml2(c) => Arc::new(Saml2Acs::from_config(c, base_dir)?),
        })
    }
}

/// A path prefix and the validators guarding it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct EndpointConfig {
    pub path: String,

    #[serde(default)]
    pub access_control: Vec<String>,
}

impl GatewayConfig {
    /// Read and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self::from_json(&data, base_dir).with_context(|| format!("Invalid config file: {:?}", path))
    }

    pub fn from_json(data: &str, base_dir: PathBuf) -> Result<Self> {
        let mut config: GatewayConfig =
            serde_json::from_str(data).context("Failed to parse config JSON")?;
        config.base_dir = base_dir;
        config.validate().map_err(|e| anyhow!(e))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.request_timeout_secs == 0 {
            return Err("request-timeout-secs must be positive".to_string());
        }

        self.backend.validate()?;
        self.header_policy().validate()?;

        let mut names = HashSet::new();
        for entry in &self.access_control {
            entry.validate()?;
            if !names.insert(entry.name()) {
                return Err(format!("duplicate access-control name: {}", entry.name()));
            }
        }

        let mut paths = HashSet::new();
        for endpoint in &self.endpoints {
            if !endpoint.path.starts_with('/') {
                return Err(format!("endpoint path must start with '/': {}", endpoint.path));
            }
            if !paths.insert(endpoint.path.as_str()) {
                return Err(format!("duplicate endpoint path: {}", endpoint.path));
            }
            for name in &endpoint.access_control {
                if !names.contains(name.as_str()) {
                    return Err(format!(
                        "endpoint {} references unknown access-control '{}'",
                        endpoint.path, name
                    ));
                }
            }
        }

        Ok(())
    }

    /// Resolve a configured path against the config directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        self.base_dir.join(path)
    }

    pub fn header_policy(&self) -> HeaderPolicy {
        HeaderPolicy::new(self.secure_cookies, self.response_headers.clone())
    }

    pub fn error_template(&self) -> Result<ErrorTemplate> {
        match &self.error_file {
            Some(path) => ErrorTemplate::from_file(&self.resolve(path)),
            None => Ok(ErrorTemplate::default()),
        }
    }

    /// Build every configured validator, keyed by name.
    pub fn build_validators(&self) -> Result<HashMap<String, Arc<dyn Validator>>> {
        let mut validators = HashMap::new();
        for entry in &self.access_control {
            let validator = entry
                .build(&self.base_dir)
                .with_context(|| format!("Failed to build access-control '{}'", entry.name()))?;
            validators.insert(entry.name().to_string(), validator);
        }
        Ok(validators)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn metadata_fixture() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata/idp-metadata.xml")
    }

    fn full_config() -> String {
        serde_json::json!({
            "listen": "127.0.0.1:8081",
            "secure-cookies": "strip",
            "response-headers": [
                {"op": "set", "name": "X-Frame-Options", "value": "DENY"}
            ],
            "backend": {
                "origin": "http://127.0.0.1:9000",
                "request-headers": {"X-Gateway": "zentinel"}
            },
            "access-control": [
                {"type": "basic-auth", "name": "ba", "users": ["alice:secret"]},
                {"type": "jwt", "name": "token", "secret": "s3cret"},
                {
                    "type": "saml2",
                    "name": "sso",
                    "idp-metadata-file": metadata_fixture(),
                    "sp-acs-url": "https://gw.example.com/saml/acs",
                    "sp-entity-id": "gw",
                    "array-attributes": ["memberOf"],
                    "allow-unverified-signatures": true
                }
            ],
            "endpoints": [
                {"path": "/saml/acs", "access-control": ["sso"]},
                {"path": "/", "access-control": ["ba"]}
            ]
        })
        .to_string()
    }

    fn minimal(extra: serde_json::Value) -> String {
        let mut value = serde_json::json!({
            "backend": {"origin": "http://127.0.0.1:9000"}
        });
        if let (Some(obj), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        value.to_string()
    }

    fn parse(data: &str) -> Result<GatewayConfig> {
        GatewayConfig::from_json(data, PathBuf::from("/etc/zentinel"))
    }

    #[test]
    fn test_defaults() {
        let config = parse(&minimal(serde_json::json!({}))).unwrap();
        assert_eq!(config.listen, "0.0.0.0:8080");
        assert_eq!(config.request_timeout_secs, 60);
        assert_eq!(config.max_body_bytes, 1024 * 1024);
        assert_eq!(config.secure_cookies, SecureCookies::Keep);
        assert_eq!(config.backend.timeout_secs, 30);
        assert_eq!(config.backend.user_id_header, "X-User-Id");
        assert_eq!(config.backend.auth_method_header, "X-Auth-Method");
        assert!(config.access_control.is_empty());
        assert!(config.endpoints.is_empty());
    }

    #[test]
    fn test_full_config() {
        let config = parse(&full_config()).unwrap();
        assert_eq!(config.listen, "127.0.0.1:8081");
        assert_eq!(config.secure_cookies, SecureCookies::Strip);
        assert_eq!(config.response_headers.len(), 1);
        assert_eq!(config.access_control.len(), 3);
        assert_eq!(config.access_control[0].name(), "ba");
        assert!(matches!(config.access_control[2], AccessControlConfig::Saml2(_)));
        assert_eq!(config.endpoints[1].access_control, vec!["ba".to_string()]);

        let validators = config.build_validators().unwrap();
        assert_eq!(validators.len(), 3);
        assert_eq!(validators["sso"].label(), "sso");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(full_config().as_bytes()).unwrap();

        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.base_dir, file.path().parent().unwrap());
    }

    #[test]
    fn test_load_missing_file() {
        let err = GatewayConfig::load(Path::new("not-there.json")).unwrap_err();
        assert!(err.to_string().contains("not-there.json"));
    }

    #[test]
    fn test_relative_paths_resolve_against_config_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("errors.html"), "{{status}} oops").unwrap();
        std::fs::copy(metadata_fixture(), dir.path().join("idp.xml")).unwrap();

        let data = minimal(serde_json::json!({
            "error-file": "errors.html",
            "access-control": [{
                "type": "saml2",
                "name": "sso",
                "idp-metadata-file": "idp.xml",
                "sp-acs-url": "https://gw.example.com/saml/acs",
                "sp-entity-id": "gw",
                "allow-unverified-signatures": true
            }]
        }));
        let path = dir.path().join("gateway.json");
        std::fs::write(&path, data).unwrap();

        let config = GatewayConfig::load(&path).unwrap();
        assert_eq!(config.resolve(Path::new("idp.xml")), dir.path().join("idp.xml"));
        assert!(config.error_template().is_ok());
        assert!(config.build_validators().is_ok());
    }

    #[test]
    fn test_missing_metadata_fails_build() {
        let data = minimal(serde_json::json!({
            "access-control": [{
                "type": "saml2",
                "name": "sso",
                "idp-metadata-file": "not-there.xml",
                "sp-acs-url": "https://gw.example.com/saml/acs",
                "sp-entity-id": "gw"
            }]
        }));
        let config = parse(&data).unwrap();
        let err = config.build_validators().err().unwrap();
        assert!(format!("{:#}", err).contains("not-there.xml"));
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let data = minimal(serde_json::json!({
            "access-control": [
                {"type": "basic-auth", "name": "x", "users": ["a:b"]},
                {"type": "jwt", "name": "x", "secret": "s"}
            ]
        }));
        let err = parse(&data).unwrap_err();
        assert!(err.to_string().contains("duplicate access-control name: x"));
    }

    #[test]
    fn test_rejects_unknown_reference() {
        let data = minimal(serde_json::json!({
            "endpoints": [{"path": "/", "access-control": ["nope"]}]
        }));
        let err = parse(&data).unwrap_err();
        assert!(err.to_string().contains("unknown access-control 'nope'"));
    }

    #[test]
    fn test_rejects_bad_values() {
        let cases = [
            serde_json::json!({"backend": {"origin": "ftp://example.com"}}),
            serde_json::json!({"backend": {"origin": "/relative"}}),
            serde_json::json!({"request-timeout-secs": 0}),
            serde_json::json!({"response-headers": [{"op": "remove", "name": "bad header"}]}),
            serde_json::json!({"endpoints": [{"path": "api"}]}),
            serde_json::json!({"access-control": [{"type": "basic-auth", "name": "ba"}]}),
            serde_json::json!({"access-control": [{"type": "ldap", "name": "x"}]}),
            serde_json::json!({"unknown-key": true}),
        ];

        for extra in cases {
            let data = minimal(extra.clone());
            assert!(parse(&data).is_err(), "accepted {}", extra);
        }
    }
}
