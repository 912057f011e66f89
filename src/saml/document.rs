//! Flattened view of a parsed `samlp:Response`.
//!
//! Protocol checks run against this view instead of the raw schema types.

use chrono::{DateTime, Utc};
use samael::schema::{Assertion, Response};

pub const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
pub const BEARER: &str = "urn:oasis:names:tc:SAML:2.0:cm:bearer";

/// Where a `Signature` element was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScope {
    Response,
    Assertion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureInfo {
    pub scope: SignatureScope,
    /// `URI` of every `Reference` in `SignedInfo`.
    pub references: Vec<String>,
    /// Base64 certificates from the signature's `KeyInfo`.
    pub certificates: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectConfirmation {
    pub method: Option<String>,
    pub recipient: Option<String>,
    pub not_on_or_after: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssertionConditions {
    pub not_before: Option<DateTime<Utc>>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    /// `None` when the assertion carries no audience restriction.
    pub audiences: Option<Vec<String>>,
    pub one_time_use: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssertionDocument {
    pub id: String,
    pub issuer: Option<String>,
    pub name_id: Option<String>,
    pub confirmations: Vec<SubjectConfirmation>,
    pub conditions: Option<AssertionConditions>,
    pub session_index: Option<String>,
    pub session_not_on_or_after: Option<DateTime<Utc>>,
    /// Attribute name and values, in document order.
    pub attributes: Vec<(String, Vec<String>)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseDocument {
    pub id: String,
    pub destination: Option<String>,
    pub status_code: Option<String>,
    pub status_message: Option<String>,
    pub issuer: Option<String>,
    pub signatures: Vec<SignatureInfo>,
    pub encrypted_assertion: bool,
    pub assertion: Option<AssertionDocument>,
}

impl ResponseDocument {
    /// Parse response XML.
    pub fn parse(xml: &str) -> Result<Self, String> {
        let response: Response = xml.parse().map_err(|e| format!("{}", e))?;
        Ok(Self::from_schema(&response))
    }

    fn from_schema(response: &Response) -> Self {
        let mut signatures = Vec::new();
        if let Some(signature) = &response.signature {
            signatures.push(SignatureInfo {
                scope: SignatureScope::Response,
                references: signature_references(signature),
                certificates: signature_certificates(signature),
            });
        }
        if let Some(signature) = response.assertion.as_ref().and_then(|a| a.signature.as_ref()) {
            signatures.push(SignatureInfo {
                scope: SignatureScope::Assertion,
                references: signature_references(signature),
                certificates: signature_certificates(signature),
            });
        }

        Self {
            id: response.id.clone(),
            destination: response.destination.clone(),
            status_code: response
                .status
                .as_ref()
                .and_then(|s| s.status_code.value.clone()),
            status_message: response
                .status
                .as_ref()
                .and_then(|s| s.status_message.as_ref())
                .and_then(|m| m.value.clone()),
            issuer: response.issuer.as_ref().and_then(|i| i.value.clone()),
            signatures,
            encrypted_assertion: response.encrypted_assertion.is_some(),
            assertion: response.assertion.as_ref().map(assertion_document),
        }
    }
}

fn signature_references(signature: &samael::signature::Signature) -> Vec<String> {
    signature
        .signed_info
        .reference
        .iter()
        .filter_map(|r| r.uri.clone())
        .collect()
}

fn signature_certificates(signature: &samael::signature::Signature) -> Vec<String> {
    signature
        .key_info
        .iter()
        .flatten()
        .filter_map(|info| info.x509_data.as_ref())
        .flat_map(|data| data.certificates.iter().cloned())
        .collect()
}

fn assertion_document(assertion: &Assertion) -> AssertionDocument {
    let subject = assertion.subject.as_ref();

    let confirmations = subject
        .and_then(|s| s.subject_confirmations.as_ref())
        .into_iter()
        .flatten()
        .map(|c| {
            let data = c.subject_confirmation_data.as_ref();
            SubjectConfirmation {
                method: c.method.clone(),
                recipient: data.and_then(|d| d.recipient.clone()),
                not_on_or_after: data.and_then(|d| d.not_on_or_after),
            }
        })
        .collect();

    let conditions = assertion.conditions.as_ref().map(|c| AssertionConditions {
        not_before: c.not_before,
        not_on_or_after: c.not_on_or_after,
        audiences: c.audience_restrictions.as_ref().map(|restrictions| {
            restrictions
                .iter()
                .flat_map(|r| r.audience.iter().cloned())
                .collect()
        }),
        one_time_use: c.one_time_use.is_some(),
    });

    let authn = assertion
        .authn_statements
        .as_ref()
        .and_then(|stmts| stmts.first());

    let attributes = assertion
        .attribute_statements
        .iter()
        .flatten()
        .flat_map(|statement| statement.attributes.iter())
        .filter_map(|attr| {
            let name = attr.name.clone()?;
            let values = attr.values.iter().filter_map(|v| v.value.clone()).collect();
            Some((name, values))
        })
        .collect();

    AssertionDocument {
        id: assertion.id.clone(),
        issuer: assertion.issuer.value.clone(),
        name_id: subject
            .and_then(|s| s.name_id.as_ref())
            .map(|n| n.value.clone()),
        confirmations,
        conditions,
        session_index: authn.and_then(|s| s.session_index.clone()),
        session_not_on_or_after: authn.and_then(|s| s.session_not_on_or_after),
        attributes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_garbage_is_rejected() {
        assert!(ResponseDocument::parse("abcde").is_err());
        assert!(ResponseDocument::parse("").is_err());
    }

    #[test]
    fn test_parse_response_fixture() {
        let doc = ResponseDocument::parse(include_str!("../../testdata/saml-response.xml")).unwrap();
        assert_eq!(doc.id, "_r7c1d2e3f");
        assert_eq!(doc.destination.as_deref(), Some("http://www.examle.org/saml/acs"));
        assert_eq!(doc.status_code.as_deref(), Some(STATUS_SUCCESS));
        assert!(doc.signatures.is_empty());
        assert!(!doc.encrypted_assertion);

        let assertion = doc.assertion.unwrap();
        assert_eq!(assertion.name_id.as_deref(), Some("abc12345"));
        assert_eq!(assertion.confirmations.len(), 1);
        assert_eq!(assertion.confirmations[0].method.as_deref(), Some(BEARER));

        let conditions = assertion.conditions.unwrap();
        assert_eq!(conditions.audiences, Some(vec!["my-sp-entity-id".to_string()]));
        assert!(conditions.one_time_use);
        assert!(conditions.not_before.is_some());

        let names: Vec<&str> = assertion.attributes.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["displayName", "memberOf", "displayName", "memberOf", "mail"]);
    }

    #[test]
    fn test_parse_signature_references() {
        let doc =
            ResponseDocument::parse(include_str!("../../testdata/saml-response-forged.xml")).unwrap();
        assert_eq!(doc.signatures.len(), 1);
        assert_eq!(doc.signatures[0].scope, SignatureScope::Response);
        assert_eq!(doc.signatures[0].references, vec!["#_f0f1f2f3".to_string()]);
        assert!(doc.signatures[0].certificates.is_empty());

        let assertion = doc.assertion.unwrap();
        assert_eq!(assertion.id, "_f4f5f6f7");
        assert!(!assertion.conditions.unwrap().one_time_use);
    }
}
