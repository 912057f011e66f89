//! SAML Service Provider configuration.

use serde::Deserialize;
use std::path::PathBuf;

/// SAML2 entry of the `access-control` list.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Saml2Config {
    /// Label used in logs, claim maps and endpoint references.
    pub name: String,

    /// IdP metadata XML file, relative to the config file.
    pub idp_metadata_file: PathBuf,

    /// Assertion Consumer Service URL (where the IdP posts the SAML response).
    pub sp_acs_url: String,

    /// SP Entity ID, matched against the assertion audience.
    pub sp_entity_id: String,

    /// Attributes kept as lists even when only one value is present.
    #[serde(default)]
    pub array_attributes: Vec<String>,

    /// Clock skew tolerance in seconds.
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: i64,

    /// Accept responses whose signature values cannot be checked because the
    /// build lacks XML-DSig support. Embedded certificates are still pinned.
    #[serde(default)]
    pub allow_unverified_signatures: bool,
}

fn default_clock_skew() -> i64 {
    300 // 5 minutes
}

impl Saml2Config {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.idp_metadata_file.as_os_str().is_empty() {
            return Err(format!("saml2 '{}': idp-metadata-file is required", self.name));
        }

        if self.sp_acs_url.is_empty() {
            return Err(format!("saml2 '{}': sp-acs-url is required", self.name));
        }

        if !self.sp_acs_url.starts_with("http://") && !self.sp_acs_url.starts_with("https://") {
            return Err(format!(
                "saml2 '{}': sp-acs-url must be an absolute http(s) URL",
                self.name
            ));
        }

        if self.sp_entity_id.is_empty() {
            return Err(format!("saml2 '{}': sp-entity-id is required", self.name));
        }

        if self.clock_skew_secs < 0 {
            return Err(format!("saml2 '{}': clock-skew-secs must not be negative", self.name));
        }

        Ok(())
    }

    pub fn service_provider(&self) -> ServiceProviderConfig {
        ServiceProviderConfig {
            label: self.name.clone(),
            acs_url: self.sp_acs_url.clone(),
            entity_id: self.sp_entity_id.clone(),
            array_attributes: self.array_attributes.clone(),
            clock_skew_secs: self.clock_skew_secs,
        }
    }
}

/// Immutable per-validator SP settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceProviderConfig {
    pub label: String,
    pub acs_url: String,
    pub entity_id: String,
    pub array_attributes: Vec<String>,
    pub clock_skew_secs: i64,
}

impl ServiceProviderConfig {
    pub fn new(
        label: impl Into<String>,
        acs_url: impl Into<String>,
        entity_id: impl Into<String>,
        array_attributes: Vec<String>,
    ) -> Self {
        Self {
            label: label.into(),
            acs_url: acs_url.into(),
            entity_id: entity_id.into(),
            array_attributes,
            clock_skew_secs: default_clock_skew(),
        }
    }

    pub fn is_array_attribute(&self, name: &str) -> bool {
        self.array_attributes.iter().any(|a| a == name)
    }
}
