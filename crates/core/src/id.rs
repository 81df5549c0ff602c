//! Strongly-typed identifiers used across the execution core.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a tenant (multi-tenant boundary), e.g. `acme`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

/// Identifier of the module (skill family) issuing the operation, e.g. `lifecycle-audit`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModuleId(String);

/// Name of the operation within a module, e.g. `extract`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OperationName(String);

macro_rules! impl_name_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Validate and wrap a raw identifier.
            ///
            /// Leading/trailing whitespace is trimmed; empty values and control
            /// characters are rejected.
            pub fn new(raw: impl AsRef<str>) -> Result<Self, DomainError> {
                let trimmed = raw.as_ref().trim();
                if trimmed.is_empty() {
                    return Err(DomainError::invalid_id(format!("{}: must not be empty", $name)));
                }
                if trimmed.chars().any(char::is_control) {
                    return Err(DomainError::invalid_id(format!(
                        "{}: contains control characters",
                        $name
                    )));
                }
                Ok(Self(trimmed.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $t {
            type Error = DomainError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }
    };
}

impl_name_newtype!(TenantId, "TenantId");
impl_name_newtype!(ModuleId, "ModuleId");
impl_name_newtype!(OperationName, "OperationName");

/// Opaque identifier of a claimant holding (or having held) a claim on a key.
///
/// A fresh token is minted for every claim attempt so a crashed executor's
/// late commit can be told apart from its successor's.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerToken(Uuid);

impl OwnerToken {
    /// Mint a new token (UUIDv7, time-ordered).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for OwnerToken {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for OwnerToken {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid =
            Uuid::from_str(s).map_err(|e| DomainError::invalid_id(format!("OwnerToken: {e}")))?;
        Ok(Self(uuid))
    }
}

/// Full identity of an operation invocation, minus its input payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationScope {
    pub tenant_id: TenantId,
    pub module_id: ModuleId,
    pub operation_name: OperationName,
}

impl OperationScope {
    pub fn new(tenant_id: TenantId, module_id: ModuleId, operation_name: OperationName) -> Self {
        Self {
            tenant_id,
            module_id,
            operation_name,
        }
    }

    /// Build a scope from raw strings, validating each part.
    pub fn parse(
        tenant_id: impl AsRef<str>,
        module_id: impl AsRef<str>,
        operation_name: impl AsRef<str>,
    ) -> Result<Self, DomainError> {
        Ok(Self {
            tenant_id: TenantId::new(tenant_id)?,
            module_id: ModuleId::new(module_id)?,
            operation_name: OperationName::new(operation_name)?,
        })
    }
}

impl core::fmt::Display for OperationScope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.module_id, self.operation_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_trimmed() {
        let tenant = TenantId::new("  acme ").unwrap();
        assert_eq!(tenant.as_str(), "acme");
    }

    #[test]
    fn empty_and_control_names_are_rejected() {
        assert!(matches!(ModuleId::new("   "), Err(DomainError::InvalidId(_))));
        assert!(matches!(OperationName::new("ex\ntract"), Err(DomainError::InvalidId(_))));
    }

    #[test]
    fn names_deserialize_with_validation() {
        let ok: TenantId = serde_json::from_str("\"acme\"").unwrap();
        assert_eq!(ok.as_str(), "acme");
        assert!(serde_json::from_str::<TenantId>("\"\"").is_err());
    }

    #[test]
    fn owner_token_round_trips_through_display() {
        let token = OwnerToken::new();
        let parsed: OwnerToken = token.to_string().parse().unwrap();
        assert_eq!(parsed, token);
    }

    #[test]
    fn scope_display_joins_parts() {
        let scope = OperationScope::parse("acme", "lifecycle-audit", "extract").unwrap();
        assert_eq!(scope.to_string(), "acme/lifecycle-audit/extract");
    }
}
