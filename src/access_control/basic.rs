//! HTTP Basic authentication.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;
use std::collections::HashMap;
use subtle::ConstantTimeEq;

use super::{header_str, AccessControlError, Claims, GatewayRequest, Validator};

fn default_realm() -> String {
    "protected".to_string()
}

/// Basic auth entry of the `access-control` list.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BasicAuthConfig {
    pub name: String,

    #[serde(default = "default_realm")]
    pub realm: String,

    /// Credentials as `user:password` pairs.
    #[serde(default)]
    pub users: Vec<String>,
}

impl BasicAuthConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.users.is_empty() {
            return Err(format!("basic-auth '{}' has no users", self.name));
        }
        for entry in &self.users {
            match entry.split_once(':') {
                Some((user, _)) if !user.is_empty() => {}
                _ => {
                    return Err(format!(
                        "basic-auth '{}': user entries must be 'user:password'",
                        self.name
                    ))
                }
            }
        }
        Ok(())
    }
}

/// Validates `Authorization: Basic` credentials against a static user list.
pub struct BasicAuth {
    label: String,
    realm: String,
    users: HashMap<String, String>,
}

impl BasicAuth {
    pub fn new(
        label: impl Into<String>,
        realm: impl Into<String>,
        users: HashMap<String, String>,
    ) -> Self {
        Self {
            label: label.into(),
            realm: realm.into(),
            users,
        }
    }

    pub fn from_config(config: &BasicAuthConfig) -> Self {
        let users = config
            .users
            .iter()
            .filter_map(|entry| entry.split_once(':'))
            .map(|(user, password)| (user.to_string(), password.to_string()))
            .collect();
        Self::new(&config.name, &config.realm, users)
    }

    fn challenge(&self) -> AccessControlError {
        AccessControlError::CredentialsRequired {
            label: self.label.clone(),
            challenge: Some(format!("Basic realm=\"{}\"", self.realm)),
        }
    }
}

impl Validator for BasicAuth {
    fn label(&self) -> &str {
        &self.label
    }

    fn validate(&self, req: &GatewayRequest) -> Result<Option<Claims>, AccessControlError> {
        let credentials = match header_str(req, "authorization") {
            Some(value) => match value.split_once(' ') {
                Some((scheme, rest)) if scheme.eq_ignore_ascii_case("basic") => rest.trim(),
                _ => return Err(self.challenge()),
            },
            None => return Err(self.challenge()),
        };

        let decoded = BASE64
            .decode(credentials)
            .map_err(|_| AccessControlError::invalid(&self.label, "invalid base64 in credentials"))?;
        let auth_str = String::from_utf8(decoded)
            .map_err(|_| AccessControlError::invalid(&self.label, "invalid UTF-8 in credentials"))?;

        let (username, password) = auth_str
            .split_once(':')
            .ok_or_else(|| AccessControlError::invalid(&self.label, "invalid credential format"))?;

        let matches = self
            .users
            .get(username)
            .map(|expected| bool::from(expected.as_bytes().ct_eq(password.as_bytes())))
            .unwrap_or(false);

        if !matches {
            return Err(AccessControlError::invalid(&self.label, "credential mismatch"));
        }

        Ok(Some(Claims::new(username)))
    }
}
