use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use validator::Validate;

/// Prefix of every tenant namespace (`tenant_<id>`)
pub const NAMESPACE_PREFIX: &str = "tenant_";

/// Longest tenant id whose namespace still fits PostgreSQL's 63-byte identifier limit
pub const TENANT_ID_MAX_LEN: usize = 63 - NAMESPACE_PREFIX.len();

/// Rejected tenant identifier
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid tenant identifier {value:?}: {reason}")]
pub struct InvalidTenantId {
    pub value: String,
    pub reason: &'static str,
}

/// Validated tenant identifier.
///
/// The id ends up inside generated DDL and session statements, so it can
/// only be built through [`TenantId::new`], which enforces the allow-list
/// (ASCII letters, digits, underscore) and the length bound. Letters are
/// folded to lowercase so that one tenant maps to exactly one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(value: &str) -> Result<Self, InvalidTenantId> {
        let reject = |reason| InvalidTenantId {
            value: value.to_string(),
            reason,
        };

        if value.is_empty() {
            return Err(reject("must not be empty"));
        }
        if value.len() > TENANT_ID_MAX_LEN {
            return Err(reject("longer than 56 characters"));
        }
        if !value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            return Err(reject("only letters, digits and underscore are allowed"));
        }

        Ok(Self(value.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Namespace (schema) name owned by this tenant
    pub fn namespace(&self) -> String {
        format!("{}{}", NAMESPACE_PREFIX, self.0)
    }

    /// Quoted namespace, safe to embed in DDL
    pub fn quoted_namespace(&self) -> String {
        quote_ident(&self.namespace())
    }

    /// Value for `search_path`: the tenant namespace, then `public` for shared objects
    pub fn search_path(&self) -> String {
        format!("{}, public", self.quoted_namespace())
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = InvalidTenantId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TenantId {
    type Error = InvalidTenantId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl<'de> Deserialize<'de> for TenantId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::new(&raw).map_err(serde::de::Error::custom)
    }
}

/// Quote an identifier the way PostgreSQL expects: wrap in double quotes
/// and double any embedded quote.
pub fn quote_ident(ident: &str) -> String {
    let mut quoted = String::with_capacity(ident.len() + 2);
    quoted.push('"');
    for ch in ident.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Onboarding request for a new tenant
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateTenant {
    /// Human-readable part of the generated tenant id
    #[validate(length(min = 1, max = 40), regex(path = *PREFIX_REGEX))]
    pub prefix: String,

    #[validate(length(min = 1, max = 255))]
    pub name: String,
}

// Tenant id prefix validation regex
lazy_static::lazy_static! {
    static ref PREFIX_REGEX: regex::Regex = regex::Regex::new(r"^[a-z0-9_]+$").unwrap();
}
