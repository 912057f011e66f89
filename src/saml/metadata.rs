//! Trusted IdP metadata.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use samael::metadata::EntityDescriptor;
use std::path::Path;
use tracing::debug;

/// What the gateway trusts about an identity provider.
///
/// Loaded once at startup and shared read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedMetadata {
    /// IdP entity id; response and assertion issuers must match it.
    pub entity_id: String,
    /// First advertised SSO location.
    pub sso_url: Option<String>,
    /// DER-encoded signing certificates.
    pub signing_certificates: Vec<Vec<u8>>,
}

impl TrustedMetadata {
    /// Read and parse a metadata file.
    ///
    /// Errors name the file, e.g. `not-there.xml: No such file or directory (os error 2)`.
    pub fn load(path: &Path) -> Result<Self> {
        let xml = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("{}: {}", path.display(), e))?;
        Self::from_xml(&xml).with_context(|| format!("{}: invalid IdP metadata", path.display()))
    }

    pub fn from_xml(xml: &str) -> Result<Self> {
        let descriptor: EntityDescriptor = xml
            .parse()
            .map_err(|e| anyhow!("Failed to parse metadata: {}", e))?;

        let entity_id = descriptor
            .entity_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| anyhow!("metadata has no entityID"))?;

        let idp = descriptor
            .idp_sso_descriptors
            .as_ref()
            .and_then(|d| d.first())
            .ok_or_else(|| anyhow!("metadata has no IDPSSODescriptor"))?;

        let sso_url = idp
            .single_sign_on_services
            .first()
            .map(|endpoint| endpoint.location.clone());

        let mut signing_certificates = Vec::new();
        for key in &idp.key_descriptors {
            if !matches!(key.key_use.as_deref(), None | Some("signing")) {
                continue;
            }
            let Some(x509) = key.key_info.x509_data.as_ref() else {
                continue;
            };
            for encoded in &x509.certificates {
                let der = decode_certificate(encoded)?;
                x509_parser::parse_x509_certificate(&der)
                    .map_err(|e| anyhow!("Failed to parse X.509 certificate: {:?}", e))?;
                signing_certificates.push(der);
            }
        }

        if signing_certificates.is_empty() {
            return Err(anyhow!("metadata has no signing certificate"));
        }

        debug!(
            entity_id = %entity_id,
            certificates = signing_certificates.len(),
            "IdP metadata loaded"
        );

        Ok(Self {
            entity_id,
            sso_url,
            signing_certificates,
        })
    }

    /// Whether `der` is one of the trusted signing certificates.
    pub fn trusts_certificate(&self, der: &[u8]) -> bool {
        self.signing_certificates.iter().any(|c| c.as_slice() == der)
    }
}

/// Decode a base64 certificate as found in `X509Certificate` elements.
pub(crate) fn decode_certificate(encoded: &str) -> Result<Vec<u8>> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    BASE64
        .decode(compact.as_bytes())
        .context("Failed to base64 decode certificate")
}
