use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::errors::AppError;
use crate::events::{Loggable, Severity};

// =============================================================================
// PERMISSION CODE
// =============================================================================

/// Canonical `resource.action` string, lowercase and dot-separated.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PermissionCode(String);

impl PermissionCode {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let segments: Vec<&str> = raw.split('.').collect();
        let well_formed = segments.len() >= 2
            && segments.iter().all(|segment| {
                !segment.is_empty()
                    && segment
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
            });

        if !well_formed {
            return Err(AppError::bad_request(format!(
                "permission code must look like `resource.action`: {raw:?}"
            )));
        }

        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn resource(&self) -> &str {
        self.0.split('.').next().unwrap_or_default()
    }

    /// Everything after the first dot.
    pub fn action(&self) -> &str {
        self.0.split_once('.').map(|(_, action)| action).unwrap_or_default()
    }
}

impl fmt::Display for PermissionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PermissionCode {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PermissionCode> for String {
    fn from(code: PermissionCode) -> Self {
        code.0
    }
}

// =============================================================================
// ROLE
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Role {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// The single role that must hold every permission in the catalog.
    pub is_superuser: bool,
    /// Incremented on every grant mutation for this role.
    pub grant_revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Loggable for Role {
    fn entity_type() -> &'static str { "role" }
    fn subject_id(&self) -> i64 { self.id }
    fn severity(&self) -> Severity { Severity::Critical }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewRole {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub is_superuser: bool,
}

impl NewRole {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            description: None,
            is_superuser: false,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn superuser(mut self) -> Self {
        self.is_superuser = true;
        self
    }
}

// =============================================================================
// PERMISSION
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Permission {
    pub id: i64,
    #[schema(example = "order.view")]
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Loggable for Permission {
    fn entity_type() -> &'static str { "permission" }
    fn subject_id(&self) -> i64 { self.id }
    fn severity(&self) -> Severity { Severity::Critical }
}

#[derive(Debug, Clone)]
pub struct NewPermission {
    pub code: PermissionCode,
    pub description: Option<String>,
}

impl NewPermission {
    pub fn new(code: &str, description: &str) -> Result<Self, AppError> {
        Ok(Self {
            code: PermissionCode::parse(code)?,
            description: Some(description.to_string()),
        })
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PermissionCreateRequest {
    #[schema(example = "po.approve")]
    pub code: String,
    #[schema(example = "Approve purchase orders")]
    pub description: Option<String>,
}

// =============================================================================
// ROLE-PERMISSION GRANT
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
pub struct Grant {
    pub role_id: i64,
    pub permission_id: i64,
}

/// Which path mutated a grant; recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum GrantSource {
    Reconcile,
    Manual,
}

/// A single grant insert or delete as published on the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantChange {
    pub role_id: i64,
    pub permission_id: i64,
    pub code: String,
    pub source: GrantSource,
}

impl Loggable for GrantChange {
    fn entity_type() -> &'static str { "grant" }
    fn subject_id(&self) -> i64 { self.role_id }
    fn severity(&self) -> Severity { Severity::Critical }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct GrantRequest {
    pub role_id: i64,
    #[schema(example = "workorder.view")]
    pub permission_code: String,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct GrantQuery {
    /// Restrict the listing to one role
    pub role_id: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct GrantView {
    pub role_id: i64,
    pub permission_id: i64,
    pub code: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_resource_and_action() {
        let code = PermissionCode::parse("order.view").unwrap();
        assert_eq!(code.resource(), "order");
        assert_eq!(code.action(), "view");
        assert_eq!(code.to_string(), "order.view");

        let hyphenated = PermissionCode::parse("purchase-order.approve").unwrap();
        assert_eq!(hyphenated.resource(), "purchase-order");
    }

    #[test]
    fn rejects_malformed_codes() {
        for raw in ["", "order", "Order.view", "order.", ".view", "order..view", "order view.x"] {
            assert!(PermissionCode::parse(raw).is_err(), "{raw:?} should be rejected");
        }
    }

    #[test]
    fn deserializes_through_validation() {
        let ok: PermissionCode = serde_json::from_str("\"invoice.create\"").unwrap();
        assert_eq!(ok.as_str(), "invoice.create");
        assert!(serde_json::from_str::<PermissionCode>("\"INVOICE\"").is_err());
    }
}
