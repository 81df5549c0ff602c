//! Idempotency key derivation.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::canonical::canonicalize;
use crate::error::{DomainError, DomainResult};
use crate::id::OperationScope;

/// Version tag mixed into every digest; bump it if the canonical form changes.
const KEY_DOMAIN: &[u8] = b"skillrun-idempotency-v1";

/// Deterministic identity of an operation invocation.
///
/// SHA-256 (hex) over the tenant, module, operation name and the canonical
/// rendering of the input. Fields are length-prefixed so that no two distinct
/// identities can produce the same hashed material.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Derive the key for `scope` invoked with `input`.
    pub fn derive(scope: &OperationScope, input: &Value) -> DomainResult<Self> {
        let canonical = canonicalize(input)?;

        let mut hasher = Sha256::new();
        absorb(&mut hasher, KEY_DOMAIN);
        absorb(&mut hasher, scope.tenant_id.as_str().as_bytes());
        absorb(&mut hasher, scope.module_id.as_str().as_bytes());
        absorb(&mut hasher, scope.operation_name.as_str().as_bytes());
        absorb(&mut hasher, canonical.as_bytes());

        Ok(Self(hex::encode(hasher.finalize())))
    }

    /// Re-hydrate a key previously rendered with `as_str` (e.g. read from storage).
    pub fn from_hex(raw: &str) -> DomainResult<Self> {
        let valid = raw.len() == 64 && raw.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if !valid {
            return Err(DomainError::invalid_id(format!(
                "IdempotencyKey: expected 64 lowercase hex chars, got {raw:?}"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

fn absorb(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for IdempotencyKey {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<IdempotencyKey> for String {
    fn from(value: IdempotencyKey) -> Self {
        value.0
    }
}
