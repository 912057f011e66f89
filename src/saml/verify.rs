//! Signature trust decision.

use super::document::{ResponseDocument, SignatureInfo, SignatureScope};
use super::metadata::{decode_certificate, TrustedMetadata};

/// Decides whether a SAML response is signed by the trusted IdP.
///
/// Receives the raw XML for implementations that verify XML-DSig themselves,
/// plus the parsed view.
pub trait SignatureVerifier: Send + Sync {
    fn verify(
        &self,
        xml: &str,
        document: &ResponseDocument,
        metadata: &TrustedMetadata,
    ) -> Result<(), String>;
}

/// Verifier used when nothing else is configured.
pub fn default_verifier() -> std::sync::Arc<dyn SignatureVerifier> {
    #[cfg(feature = "xmlsec")]
    {
        std::sync::Arc::new(XmlDsig)
    }
    #[cfg(not(feature = "xmlsec"))]
    {
        std::sync::Arc::new(Unavailable)
    }
}

/// True if this build can check XML-DSig signature values.
pub const fn signature_values_checked() -> bool {
    cfg!(feature = "xmlsec")
}

/// Rejects every response. Installed when the build has no XML-DSig support.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unavailable;

impl SignatureVerifier for Unavailable {
    fn verify(&self, _: &str, _: &ResponseDocument, _: &TrustedMetadata) -> Result<(), String> {
        Err("XML signature verification is not available in this build".to_string())
    }
}

/// Full XML-DSig check through xmlsec.
///
/// The first signature in document order must validate against one of the
/// metadata signing certificates and must reference the element it sits in.
#[cfg(feature = "xmlsec")]
#[derive(Debug, Default, Clone, Copy)]
pub struct XmlDsig;

#[cfg(feature = "xmlsec")]
impl SignatureVerifier for XmlDsig {
    fn verify(
        &self,
        xml: &str,
        document: &ResponseDocument,
        metadata: &TrustedMetadata,
    ) -> Result<(), String> {
        let signature = document
            .signatures
            .first()
            .ok_or_else(|| "response is not signed".to_string())?;
        check_reference(signature, document)?;

        if metadata.signing_certificates.is_empty() {
            return Err("metadata has no signing certificate".to_string());
        }

        let mut last_error = String::new();
        for der in &metadata.signing_certificates {
            match samael::crypto::verify_signed_xml(xml, der, Some("ID")) {
                Ok(()) => return Ok(()),
                Err(e) => last_error = e.to_string(),
            }
        }
        Err(format!("{:?} signature: {}", signature.scope, last_error))
    }
}

/// Requires a signature on the response or the assertion and pins every
/// embedded certificate to the metadata signing certificates.
///
/// Signature values are NOT checked. Only installed when a SAML validator is
/// configured with `allow-unverified-signatures`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CertificatePinning;

impl SignatureVerifier for CertificatePinning {
    fn verify(
        &self,
        _xml: &str,
        document: &ResponseDocument,
        metadata: &TrustedMetadata,
    ) -> Result<(), String> {
        if document.signatures.is_empty() {
            return Err("response is not signed".to_string());
        }

        for signature in &document.signatures {
            check_reference(signature, document)?;
            for encoded in &signature.certificates {
                let der = decode_certificate(encoded)
                    .map_err(|e| format!("{:?} signature: {}", signature.scope, e))?;
                if !metadata.trusts_certificate(&der) {
                    return Err(format!(
                        "{:?} signature uses an untrusted certificate",
                        signature.scope
                    ));
                }
            }
        }

        Ok(())
    }
}

/// A signature must cover the element that carries it.
fn check_reference(signature: &SignatureInfo, document: &ResponseDocument) -> Result<(), String> {
    let signed_id = match signature.scope {
        SignatureScope::Response => Some(document.id.as_str()),
        SignatureScope::Assertion => document.assertion.as_ref().map(|a| a.id.as_str()),
    };

    let covered = signature.references.iter().any(|uri| {
        uri.strip_prefix('#')
            .zip(signed_id)
            .map(|(r, id)| !id.is_empty() && r == id)
            .unwrap_or(false)
    });

    if covered {
        Ok(())
    } else {
        Err(format!(
            "{:?} signature does not reference the signed element",
            signature.scope
        ))
    }
}
