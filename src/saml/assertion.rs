//! Assertion data extracted from a validated SAML response.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Condition failures that do not abort decoding.
///
/// `not_in_audience` and `invalid_time` reject the assertion later on;
/// `one_time_use` is informational since no assertion cache is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarningInfo {
    pub not_in_audience: bool,
    pub invalid_time: bool,
    pub one_time_use: bool,
}

impl WarningInfo {
    /// True if any rejecting warning is set.
    pub fn is_rejecting(&self) -> bool {
        self.not_in_audience || self.invalid_time
    }
}

impl std::fmt::Display for WarningInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = Vec::new();
        if self.not_in_audience {
            names.push("not_in_audience");
        }
        if self.invalid_time {
            names.push("invalid_time");
        }
        if self.one_time_use {
            names.push("one_time_use");
        }
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join(","))
        }
    }
}

/// Identity data of one assertion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssertionInfo {
    pub name_id: String,
    pub session_not_on_or_after: Option<DateTime<Utc>>,
    /// Attribute values by attribute name, in document order.
    pub values: BTreeMap<String, Vec<String>>,
    pub warning_info: WarningInfo,

    pub assertion_id: Option<String>,
    pub issuer: Option<String>,
    pub session_index: Option<String>,
}

impl AssertionInfo {
    pub fn new(name_id: impl Into<String>) -> Self {
        Self {
            name_id: name_id.into(),
            ..Default::default()
        }
    }

    pub fn with_value(mut self, name: &str, values: &[&str]) -> Self {
        self.values.insert(
            name.to_string(),
            values.iter().map(|v| v.to_string()).collect(),
        );
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_rejection() {
        assert!(!WarningInfo::default().is_rejecting());
        assert!(WarningInfo {
            not_in_audience: true,
            ..Default::default()
        }
        .is_rejecting());
        assert!(WarningInfo {
            invalid_time: true,
            ..Default::default()
        }
        .is_rejecting());
        assert!(!WarningInfo {
            one_time_use: true,
            ..Default::default()
        }
        .is_rejecting());
    }

    #[test]
    fn test_warning_display() {
        let warnings = WarningInfo {
            not_in_audience: true,
            one_time_use: true,
            ..Default::default()
        };
        assert_eq!(warnings.to_string(), "not_in_audience,one_time_use");
        assert_eq!(WarningInfo::default().to_string(), "none");
    }
}
