//! Volunteer identity: the authenticated email of the caller.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::DomainError;

/// Canonical (trimmed, lower-cased) email identifying a volunteer.
///
/// Identities are resolved by the authentication layer; the pipeline never
/// accepts one from a request body. Comparison is case-insensitive because the
/// canonical form is lower case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VolunteerIdentity(String);

impl VolunteerIdentity {
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("volunteer identity must not be blank"));
        }

        match trimmed.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {
                Ok(Self(trimmed.to_lowercase()))
            }
            _ => Err(DomainError::validation(format!(
                "volunteer identity `{trimmed}` is not an email address"
            ))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive comparison against a raw email such as a post owner.
    pub fn matches_email(&self, email: &str) -> bool {
        self.0.eq_ignore_ascii_case(email.trim())
    }
}

impl fmt::Display for VolunteerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for VolunteerIdentity {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<VolunteerIdentity> for String {
    fn from(value: VolunteerIdentity) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_trims_and_lowercases() {
        let identity = VolunteerIdentity::parse("  Alice@Example.COM ").expect("identity");
        assert_eq!(identity.as_str(), "alice@example.com");
        assert!(identity.matches_email("ALICE@example.com"));
    }

    #[test]
    fn parse_rejects_blank_and_non_email_values() {
        assert!(VolunteerIdentity::parse("   ").is_err());
        assert!(VolunteerIdentity::parse("alice").is_err());
        assert!(VolunteerIdentity::parse("@example.com").is_err());
        assert!(VolunteerIdentity::parse("alice@").is_err());
    }

    #[test]
    fn deserialization_applies_validation() {
        let parsed: VolunteerIdentity =
            serde_json::from_str("\"Bob@Example.org\"").expect("valid identity");
        assert_eq!(parsed.as_str(), "bob@example.org");
        assert!(serde_json::from_str::<VolunteerIdentity>("\"\"").is_err());
    }
}
