use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::{FleetError, Result};

// ---------------------------------------------------------------------------
// TenantKey
// ---------------------------------------------------------------------------

/// Identity of one paired messaging account: a phone number reduced to
/// its digits.
///
/// The only way to build a `TenantKey` is through [`TenantKey::parse`],
/// which strips every non-digit character. Every map, file name and
/// database row in the daemon is keyed by this normalized form, so
/// `"+1 (555) 010-2030"` and `"15550102030"` always name the same tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantKey(String);

// ---

impl TenantKey {
    // ---
    /// Normalize `raw` into a tenant key.
    ///
    /// Returns [`FleetError::InvalidTenant`] when no digits remain.
    pub fn parse(raw: &str) -> Result<Self> {
        // ---
        let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
        if digits.is_empty() {
            return Err(FleetError::InvalidTenant(raw.to_string()));
        }
        Ok(Self(digits))
    }

    // ---

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// ---

impl fmt::Display for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantKey {
    type Error = FleetError;

    fn try_from(raw: String) -> Result<Self> {
        Self::parse(&raw)
    }
}

impl From<TenantKey> for String {
    fn from(key: TenantKey) -> Self {
        key.0
    }
}

impl AsRef<str> for TenantKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn parse_strips_formatting() {
        let key = TenantKey::parse("+1 (555) 010-2030").unwrap();
        assert_eq!(key.as_str(), "15550102030");
    }

    #[test]
    fn formatted_and_bare_numbers_are_the_same_tenant() {
        let a = TenantKey::parse("+44 7700 900123").unwrap();
        let b = TenantKey::parse("447700900123").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn parse_rejects_keys_without_digits() {
        assert!(matches!(
            TenantKey::parse("+-() "),
            Err(FleetError::InvalidTenant(_))
        ));
        assert!(TenantKey::parse("").is_err());
    }

    #[test]
    fn serde_normalizes_on_the_way_in() {
        let key: TenantKey = serde_json::from_str("\"62-812-3456\"").unwrap();
        assert_eq!(key.as_str(), "628123456");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"628123456\"");
    }
}
