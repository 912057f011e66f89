//! Bearer token (JWT) validation.

use anyhow::{anyhow, Context, Result};
use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::{header_str, AccessControlError, ClaimValue, Claims, GatewayRequest, Validator};

fn default_algorithm() -> String {
    "HS256".to_string()
}

/// JWT entry of the `access-control` list.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct JwtConfig {
    pub name: String,

    /// HMAC secret.
    #[serde(default)]
    pub secret: Option<String>,

    /// PEM encoded RSA or EC public key.
    #[serde(default)]
    pub public_key_file: Option<PathBuf>,

    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    #[serde(default)]
    pub issuer: Option<String>,

    #[serde(default)]
    pub audience: Option<String>,

    /// Read the token from this cookie instead of the Authorization header.
    #[serde(default)]
    pub cookie: Option<String>,
}

impl JwtConfig {
    pub fn validate(&self) -> Result<(), String> {
        parse_algorithm(&self.algorithm).map_err(|e| format!("jwt '{}': {}", self.name, e))?;
        if self.secret.is_some() && self.public_key_file.is_some() {
            return Err(format!(
                "jwt '{}': secret and public-key-file are mutually exclusive",
                self.name
            ));
        }
        Ok(())
    }
}

fn parse_algorithm(name: &str) -> Result<Algorithm> {
    Ok(match name.to_uppercase().as_str() {
        "HS256" => Algorithm::HS256,
        "HS384" => Algorithm::HS384,
        "HS512" => Algorithm::HS512,
        "RS256" => Algorithm::RS256,
        "RS384" => Algorithm::RS384,
        "RS512" => Algorithm::RS512,
        "ES256" => Algorithm::ES256,
        "ES384" => Algorithm::ES384,
        _ => return Err(anyhow!("Unsupported JWT algorithm: {}", name)),
    })
}

#[derive(Debug, Deserialize)]
struct JwtClaims {
    sub: Option<String>,
    exp: Option<i64>,
    #[serde(flatten)]
    extra: HashMap<String, serde_json::Value>,
}

/// Validates bearer tokens signed with a shared secret or a public key.
pub struct JwtValidator {
    label: String,
    key: Option<DecodingKey>,
    validation: Validation,
    cookie: Option<String>,
}

impl JwtValidator {
    /// Build from config. `base_dir` resolves a relative public key path.
    pub fn from_config(config: &JwtConfig, base_dir: &Path) -> Result<Self> {
        let algorithm = parse_algorithm(&config.algorithm)?;

        let key = if let Some(secret) = &config.secret {
            Some(DecodingKey::from_secret(secret.as_bytes()))
        } else if let Some(path) = &config.public_key_file {
            let path = base_dir.join(path);
            let key_data = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read JWT public key: {:?}", path))?;
            Some(
                DecodingKey::from_rsa_pem(key_data.as_bytes())
                    .or_else(|_| DecodingKey::from_ec_pem(key_data.as_bytes()))
                    .context("Failed to parse JWT public key")?,
            )
        } else {
            None
        };

        let mut validation = Validation::new(algorithm);
        if let Some(ref issuer) = config.issuer {
            validation.set_issuer(&[issuer]);
        } else {
            validation.iss = None;
        }
        if let Some(ref audience) = config.audience {
            validation.set_audience(&[audience]);
        } else {
            validation.aud = None;
            validation.validate_aud = false;
        }

        Ok(Self {
            label: config.name.clone(),
            key,
            validation,
            cookie: config.cookie.clone(),
        })
    }

    fn token<'a>(&self, req: &'a GatewayRequest) -> Option<&'a str> {
        match &self.cookie {
            Some(name) => req
                .headers()
                .get_all(http::header::COOKIE)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .flat_map(|v| v.split(';'))
                .filter_map(|pair| pair.trim().split_once('='))
                .find(|(k, _)| k == name)
                .map(|(_, v)| v),
            None => {
                let value = header_str(req, "authorization")?;
                let (scheme, token) = value.split_once(' ')?;
                scheme
                    .eq_ignore_ascii_case("bearer")
                    .then(|| token.trim())
            }
        }
        .filter(|t| !t.is_empty())
    }
}

impl Validator for JwtValidator {
    fn label(&self) -> &str {
        &self.label
    }

    fn validate(&self, req: &GatewayRequest) -> Result<Option<Claims>, AccessControlError> {
        let key = self.key.as_ref().ok_or_else(|| AccessControlError::NotConfigured {
            label: self.label.clone(),
            reason: "no JWT secret or public key configured".to_string(),
        })?;

        let token = self
            .token(req)
            .ok_or_else(|| AccessControlError::CredentialsRequired {
                label: self.label.clone(),
                challenge: Some(format!("Bearer realm=\"{}\"", self.label)),
            })?;

        let token_data: TokenData<JwtClaims> = decode(token, key, &self.validation)
            .map_err(|e| AccessControlError::invalid(&self.label, format!("invalid token: {}", e)))?;

        let jwt = token_data.claims;
        let mut claims = Claims::new(jwt.sub.unwrap_or_else(|| "unknown".to_string()));
        claims.exp = jwt.exp;

        for (name, value) in jwt.extra {
            match value {
                serde_json::Value::String(s) => {
                    claims.attributes.insert(name, ClaimValue::Single(s));
                }
                serde_json::Value::Array(items) => {
                    let values: Vec<String> = items
                        .into_iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect();
                    claims.attributes.insert(name, ClaimValue::Multiple(values));
                }
                _ => {}
            }
        }

        Ok(Some(claims))
    }
}
