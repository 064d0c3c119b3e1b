use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const LOCAL_PART_MIN: usize = 2;
pub const LOCAL_PART_MAX: usize = 256;
pub const DOMAIN_MIN: usize = 2;
pub const DOMAIN_MAX: usize = 64;

/// Errors raised while parsing a UPI identifier.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpiIdError {
    #[error("UPI id must contain exactly one '@': {0}")]
    MissingSeparator(String),
    #[error("UPI id local part must be 2-256 characters: {0}")]
    LocalPartLength(String),
    #[error("UPI id domain must be 2-64 characters: {0}")]
    DomainLength(String),
    #[error("UPI id may only contain [A-Za-z0-9._-] around the '@': {0}")]
    InvalidCharacter(String),
}

impl UpiIdError {
    /// The raw input that failed to parse.
    pub fn input(&self) -> &str {
        match self {
            UpiIdError::MissingSeparator(s)
            | UpiIdError::LocalPartLength(s)
            | UpiIdError::DomainLength(s)
            | UpiIdError::InvalidCharacter(s) => s,
        }
    }
}

/// Payment identifier of the form `local@domain`.
///
/// Construction always goes through [`UpiId::parse`], so holding a `UpiId`
/// means the grammar has been checked.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UpiId(String);

impl UpiId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, UpiIdError> {
        let raw = raw.into();
        let mut parts = raw.split('@');
        let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(UpiIdError::MissingSeparator(raw));
        };

        if !(LOCAL_PART_MIN..=LOCAL_PART_MAX).contains(&local.len()) {
            return Err(UpiIdError::LocalPartLength(raw));
        }
        if !(DOMAIN_MIN..=DOMAIN_MAX).contains(&domain.len()) {
            return Err(UpiIdError::DomainLength(raw));
        }
        if !local.bytes().chain(domain.bytes()).all(is_id_byte) {
            return Err(UpiIdError::InvalidCharacter(raw));
        }

        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn local_part(&self) -> &str {
        self.0.split('@').next().unwrap_or_default()
    }

    pub fn domain(&self) -> &str {
        self.0.rsplit('@').next().unwrap_or_default()
    }
}

fn is_id_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-')
}

impl fmt::Display for UpiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for UpiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UpiId({})", self.0)
    }
}

impl AsRef<str> for UpiId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for UpiId {
    type Err = UpiIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UpiId::parse(s)
    }
}

impl TryFrom<String> for UpiId {
    type Error = UpiIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        UpiId::parse(value)
    }
}

impl From<UpiId> for String {
    fn from(value: UpiId) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn accepts_common_identifiers() {
        for raw in ["alice@bank", "merchant.store-01@okicici", "ab@cd", "a_b@ybl"] {
            let id = UpiId::parse(raw).unwrap();
            assert_eq!(id.as_str(), raw);
        }
        let id = UpiId::parse("shop.42@paytm").unwrap();
        assert_eq!(id.local_part(), "shop.42");
        assert_eq!(id.domain(), "paytm");
    }

    #[test]
    fn rejects_malformed_identifiers() {
        assert!(matches!(
            UpiId::parse("alicebank"),
            Err(UpiIdError::MissingSeparator(_))
        ));
        assert!(matches!(
            UpiId::parse("al@ice@bank"),
            Err(UpiIdError::MissingSeparator(_))
        ));
        assert!(matches!(
            UpiId::parse("a@bank"),
            Err(UpiIdError::LocalPartLength(_))
        ));
        assert!(matches!(
            UpiId::parse("alice@b"),
            Err(UpiIdError::DomainLength(_))
        ));
        assert!(matches!(
            UpiId::parse("ali ce@bank"),
            Err(UpiIdError::InvalidCharacter(_))
        ));
        assert_eq!(UpiId::parse("x").unwrap_err().input(), "x");
    }

    #[test]
    fn input_is_not_normalised() {
        assert!(matches!(
            UpiId::parse(" alice@bank"),
            Err(UpiIdError::InvalidCharacter(_))
        ));
        let upper = UpiId::parse("Shop@Bank").unwrap();
        assert_eq!(upper.as_str(), "Shop@Bank");
        assert_ne!(upper, UpiId::parse("shop@bank").unwrap());
    }

    #[test]
    fn length_bounds_are_inclusive() {
        let local = "a".repeat(LOCAL_PART_MAX);
        let domain = "b".repeat(DOMAIN_MAX);
        assert!(UpiId::parse(format!("{local}@{domain}")).is_ok());
        assert!(UpiId::parse(format!("{local}a@{domain}")).is_err());
        assert!(UpiId::parse(format!("{local}@{domain}b")).is_err());
    }

    #[test]
    fn deserialization_enforces_grammar() {
        let ok: UpiId = serde_json::from_str("\"alice@bank\"").unwrap();
        assert_eq!(ok.as_str(), "alice@bank");
        assert!(serde_json::from_str::<UpiId>("\"bad\"").is_err());
    }

    proptest! {
        #[test]
        fn grammar_accepts_generated_ids(
            local in "[A-Za-z0-9._-]{2,40}",
            domain in "[A-Za-z0-9._-]{2,64}",
        ) {
            let raw = format!("{local}@{domain}");
            let id = UpiId::parse(raw.clone()).unwrap();
            prop_assert_eq!(id.local_part(), local.as_str());
            prop_assert_eq!(id.domain(), domain.as_str());
        }

        #[test]
        fn grammar_rejects_foreign_characters(
            local in "[A-Za-z0-9]{1,10}[ !#$%&*+/=?^]{1}[A-Za-z0-9]{1,10}",
        ) {
            let raw = format!("{local}@bank");
            prop_assert!(UpiId::parse(raw).is_err());
        }
    }
}
