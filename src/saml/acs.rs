//! SAML2 Assertion Consumer Service validator.
//!
//! Consumes `SAMLResponse` posts from the IdP (HTTP-POST binding), checks them
//! against the trusted metadata and turns the assertion into claims.

use anyhow::{bail, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Duration, Utc};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::assertion::{AssertionInfo, WarningInfo};
use super::config::{Saml2Config, ServiceProviderConfig};
use super::document::{ResponseDocument, BEARER, STATUS_SUCCESS};
use super::metadata::TrustedMetadata;
use super::verify::{default_verifier, signature_values_checked, CertificatePinning, SignatureVerifier};
use crate::access_control::{
    header_str, AccessControlError, ClaimValue, Claims, GatewayRequest, Validator,
};

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const RESPONSE_FIELD: &str = "SAMLResponse";

/// Why a posted SAML response was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SamlError {
    #[error("method {0} not allowed, expected POST")]
    MethodNotAllowed(String),

    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("malformed form body: {0}")]
    MalformedBody(String),

    #[error("no SAMLResponse in request body")]
    MissingResponse,

    #[error("SAMLResponse is not valid base64: {0}")]
    InvalidBase64(String),

    #[error("SAMLResponse is not a SAML response: {0}")]
    MalformedDocument(String),

    #[error("IdP returned status {code}: {message}")]
    Status { code: String, message: String },

    #[error("destination {0:?} does not match the ACS URL")]
    Destination(String),

    #[error("signature rejected: {0}")]
    Signature(String),

    #[error("issuer {0:?} does not match the IdP entity id")]
    Issuer(String),

    #[error("encrypted assertions are not supported")]
    EncryptedAssertion,

    #[error("response contains no assertion")]
    MissingAssertion,

    #[error("assertion has no NameID")]
    MissingNameId,

    #[error("assertion has no subject confirmation")]
    MissingConfirmation,

    #[error("unsupported subject confirmation method {0:?}")]
    ConfirmationMethod(String),

    #[error("subject confirmation has no recipient")]
    MissingRecipient,

    #[error("subject confirmation recipient {0:?} does not match the ACS URL")]
    Recipient(String),

    #[error("subject confirmation has no NotOnOrAfter")]
    MissingConfirmationExpiry,

    #[error("subject confirmation expired")]
    ConfirmationExpired,

    #[error("assertion has no conditions")]
    MissingConditions,

    #[error("assertion conditions not met: {0}")]
    Conditions(WarningInfo),
}

/// The ACS validator.
pub struct Saml2Acs {
    sp: ServiceProviderConfig,
    metadata: Arc<TrustedMetadata>,
    verifier: Arc<dyn SignatureVerifier>,
}

impl Saml2Acs {
    pub fn new(
        metadata: Arc<TrustedMetadata>,
        label: impl Into<String>,
        acs_url: impl Into<String>,
        sp_entity_id: impl Into<String>,
        array_attributes: Vec<String>,
    ) -> Self {
        Self::with_service_provider(
            metadata,
            ServiceProviderConfig::new(label, acs_url, sp_entity_id, array_attributes),
        )
    }

    pub fn with_service_provider(metadata: Arc<TrustedMetadata>, sp: ServiceProviderConfig) -> Self {
        Self {
            sp,
            metadata,
            verifier: default_verifier(),
        }
    }

    /// Build from config, reading the metadata file relative to `base_dir`.
    ///
    /// Fails when signature values cannot be checked and the config does not
    /// opt into `allow-unverified-signatures`.
    pub fn from_config(config: &Saml2Config, base_dir: &Path) -> Result<Self> {
        let path = base_dir.join(&config.idp_metadata_file);
        let metadata = TrustedMetadata::load(&path)?;

        let verifier: Arc<dyn SignatureVerifier> = if signature_values_checked() {
            default_verifier()
        } else if config.allow_unverified_signatures {
            warn!(
                validator = %config.name,
                "SAML signature values are not verified, only embedded certificates are pinned"
            );
            Arc::new(CertificatePinning)
        } else {
            bail!(
                "saml2 '{}': XML signature verification needs the `xmlsec` feature; \
                 set allow-unverified-signatures to run without it",
                config.name
            );
        };

        info!(
            validator = %config.name,
            idp = %metadata.entity_id,
            idp_sso_url = %metadata.sso_url.as_deref().unwrap_or("-"),
            acs_url = %config.sp_acs_url,
            verified_signatures = signature_values_checked(),
            "SAML2 ACS configured"
        );

        Ok(Self::with_service_provider(Arc::new(metadata), config.service_provider())
            .with_verifier(verifier))
    }

    /// Replace the signature verifier.
    pub fn with_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn service_provider(&self) -> &ServiceProviderConfig {
        &self.sp
    }

    /// Decode and check the posted response.
    pub fn decode(&self, req: &GatewayRequest) -> Result<AssertionInfo, SamlError> {
        self.decode_at(req, Utc::now())
    }

    pub fn decode_at(&self, req: &GatewayRequest, now: DateTime<Utc>) -> Result<AssertionInfo, SamlError> {
        if req.method() != http::Method::POST {
            return Err(SamlError::MethodNotAllowed(req.method().to_string()));
        }

        if let Some(content_type) = header_str(req, "content-type") {
            let mime = content_type.split(';').next().unwrap_or("").trim();
            if !mime.eq_ignore_ascii_case(FORM_CONTENT_TYPE) {
                return Err(SamlError::UnsupportedContentType(content_type.to_string()));
            }
        }

        let form = parse_form(req.body())?;
        let encoded = form
            .into_iter()
            .find(|(k, _)| k == RESPONSE_FIELD)
            .map(|(_, v)| v)
            .ok_or(SamlError::MissingResponse)?;

        let compact: String = encoded.chars().filter(|c| *c != '\r' && *c != '\n').collect();
        let raw = BASE64
            .decode(compact.as_bytes())
            .map_err(|e| SamlError::InvalidBase64(e.to_string()))?;
        let xml = String::from_utf8(raw)
            .map_err(|_| SamlError::MalformedDocument("not valid UTF-8".to_string()))?;

        let document = ResponseDocument::parse(&xml).map_err(SamlError::MalformedDocument)?;
        self.check_document(&xml, &document, now)
    }

    /// Protocol checks on a structurally valid response.
    fn check_document(
        &self,
        xml: &str,
        document: &ResponseDocument,
        now: DateTime<Utc>,
    ) -> Result<AssertionInfo, SamlError> {
        let skew = Duration::seconds(self.sp.clock_skew_secs);

        let status = document.status_code.as_deref().unwrap_or("");
        if status != STATUS_SUCCESS {
            return Err(SamlError::Status {
                code: status.to_string(),
                message: document
                    .status_message
                    .clone()
                    .unwrap_or_else(|| "Unknown error".to_string()),
            });
        }

        if let Some(destination) = &document.destination {
            if destination != &self.sp.acs_url {
                return Err(SamlError::Destination(destination.clone()));
            }
        }

        self.verifier
            .verify(xml, document, &self.metadata)
            .map_err(SamlError::Signature)?;

        if let Some(issuer) = &document.issuer {
            if issuer != &self.metadata.entity_id {
                return Err(SamlError::Issuer(issuer.clone()));
            }
        }

        let assertion = match &document.assertion {
            Some(assertion) => assertion,
            None if document.encrypted_assertion => return Err(SamlError::EncryptedAssertion),
            None => return Err(SamlError::MissingAssertion),
        };

        if let Some(issuer) = &assertion.issuer {
            if issuer != &self.metadata.entity_id {
                return Err(SamlError::Issuer(issuer.clone()));
            }
        }

        let name_id = assertion
            .name_id
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or(SamlError::MissingNameId)?;

        // Every confirmation must be a bearer confirmation for this ACS.
        if assertion.confirmations.is_empty() {
            return Err(SamlError::MissingConfirmation);
        }
        for confirmation in &assertion.confirmations {
            if confirmation.method.as_deref() != Some(BEARER) {
                return Err(SamlError::ConfirmationMethod(
                    confirmation.method.clone().unwrap_or_default(),
                ));
            }
            match &confirmation.recipient {
                None => return Err(SamlError::MissingRecipient),
                Some(recipient) if recipient != &self.sp.acs_url => {
                    return Err(SamlError::Recipient(recipient.clone()));
                }
                Some(_) => {}
            }
            let not_on_or_after = confirmation
                .not_on_or_after
                .ok_or(SamlError::MissingConfirmationExpiry)?;
            if now >= not_on_or_after + skew {
                return Err(SamlError::ConfirmationExpired);
            }
        }

        let conditions = assertion
            .conditions
            .as_ref()
            .ok_or(SamlError::MissingConditions)?;

        let mut warning_info = WarningInfo::default();
        if let Some(not_before) = conditions.not_before {
            if now < not_before - skew {
                warning_info.invalid_time = true;
            }
        }
        if let Some(not_on_or_after) = conditions.not_on_or_after {
            if now >= not_on_or_after + skew {
                warning_info.invalid_time = true;
            }
        }
        if let Some(audiences) = &conditions.audiences {
            if !audiences.iter().any(|a| a == &self.sp.entity_id) {
                warning_info.not_in_audience = true;
            }
        }
        warning_info.one_time_use = conditions.one_time_use;

        let mut info = AssertionInfo::new(name_id);
        info.session_not_on_or_after = assertion.session_not_on_or_after;
        info.warning_info = warning_info;
        info.assertion_id = Some(assertion.id.clone());
        info.issuer = assertion.issuer.clone().or_else(|| document.issuer.clone());
        info.session_index = assertion.session_index.clone();
        // Repeated names across statements append in document order.
        for (name, values) in &assertion.attributes {
            info.values
                .entry(name.clone())
                .or_default()
                .extend(values.iter().cloned());
        }

        Ok(info)
    }

    /// Reject assertions with audience or time window warnings.
    pub fn validate_assertion_info(&self, info: &AssertionInfo) -> Result<(), SamlError> {
        if info.warning_info.is_rejecting() {
            return Err(SamlError::Conditions(info.warning_info));
        }
        if info.warning_info.one_time_use {
            debug!(validator = %self.sp.label, "Assertion marked OneTimeUse");
        }
        Ok(())
    }

    /// Claims of an assertion.
    ///
    /// Array attributes keep every value; all other attributes keep the last one.
    pub fn get_assertion_data(&self, info: &AssertionInfo) -> Claims {
        let mut claims = Claims::new(info.name_id.clone());
        claims.exp = info.session_not_on_or_after.map(|t| t.timestamp());

        for (name, values) in &info.values {
            if self.sp.is_array_attribute(name) {
                claims
                    .attributes
                    .insert(name.clone(), ClaimValue::Multiple(values.clone()));
            } else if let Some(last) = values.last() {
                claims
                    .attributes
                    .insert(name.clone(), ClaimValue::Single(last.clone()));
            }
        }

        claims
    }
}

impl Validator for Saml2Acs {
    fn label(&self) -> &str {
        &self.sp.label
    }

    fn validate(&self, req: &GatewayRequest) -> Result<Option<Claims>, AccessControlError> {
        let rejected = |e: SamlError| {
            warn!(validator = %self.sp.label, error = %e, "SAML response rejected");
            if e == SamlError::MissingResponse {
                AccessControlError::CredentialsRequired {
                    label: self.sp.label.clone(),
                    challenge: None,
                }
            } else {
                AccessControlError::invalid(&self.sp.label, "invalid SAML response")
            }
        };

        let info = self.decode(req).map_err(rejected)?;
        self.validate_assertion_info(&info).map_err(rejected)?;
        let claims = self.get_assertion_data(&info);

        info!(
            user_id = %claims.sub,
            idp = %info.issuer.as_deref().unwrap_or("unknown"),
            assertion_id = %info.assertion_id.as_deref().unwrap_or(""),
            session_index = %info.session_index.as_deref().unwrap_or("-"),
            attributes = claims.attributes.len(),
            "SAML assertion validated"
        );

        Ok(Some(claims))
    }
}

/// Strict `application/x-www-form-urlencoded` parsing.
fn parse_form(body: &[u8]) -> Result<Vec<(String, String)>, SamlError> {
    let body = std::str::from_utf8(body)
        .map_err(|_| SamlError::MalformedBody("body is not valid UTF-8".to_string()))?;

    body.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            Ok((decode_component(key)?, decode_component(value)?))
        })
        .collect()
}

fn decode_component(s: &str) -> Result<String, SamlError> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes.len() > i + 2
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit();
            if !valid {
                return Err(SamlError::MalformedBody(format!("invalid escape in {:?}", s)));
            }
            i += 3;
        } else {
            i += 1;
        }
    }

    let spaced = s.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|c| c.into_owned())
        .map_err(|_| SamlError::MalformedBody("escape sequence is not valid UTF-8".to_string()))
}
