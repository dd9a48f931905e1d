//! Desired role -> permission state, authored outside the store.
//!
//! A declaration lists, per role id, either a set of permission codes or the
//! wildcard `"*"`. Exactly one role carries the wildcard: the superuser.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::errors::{AppError, AppResult};
use crate::models::rbac::PermissionCode;

pub mod defaults;

pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DesiredGrants {
    /// Every permission currently in the catalog.
    All,
    Codes(BTreeSet<String>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyDeclaration {
    entries: BTreeMap<i64, DesiredGrants>,
}

// =============================================================================
// FILE FORMAT
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PolicyFile {
    pub roles: Vec<PolicyEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PolicyEntry {
    pub role_id: i64,
    /// `"*"` or a list of permission codes
    #[schema(value_type = Object, example = json!(["workorder.view", "workorder.create"]))]
    pub permissions: PermissionsSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PermissionsSpec {
    Wildcard(String),
    Codes(Vec<String>),
}

impl TryFrom<PolicyFile> for PolicyDeclaration {
    type Error = AppError;

    fn try_from(file: PolicyFile) -> Result<Self, Self::Error> {
        let mut builder = PolicyBuilder::default();
        for entry in file.roles {
            match entry.permissions {
                PermissionsSpec::Wildcard(w) if w == WILDCARD => builder = builder.superuser(entry.role_id),
                PermissionsSpec::Wildcard(other) => builder.errors.push(format!(
                    "role {}: permissions must be \"*\" or a list of codes, got {other:?}",
                    entry.role_id
                )),
                PermissionsSpec::Codes(codes) => builder = builder.role(entry.role_id, codes),
            }
        }
        builder.build()
    }
}

impl From<&PolicyDeclaration> for PolicyFile {
    fn from(policy: &PolicyDeclaration) -> Self {
        PolicyFile {
            roles: policy
                .entries
                .iter()
                .map(|(role_id, desired)| PolicyEntry {
                    role_id: *role_id,
                    permissions: match desired {
                        DesiredGrants::All => PermissionsSpec::Wildcard(WILDCARD.to_string()),
                        DesiredGrants::Codes(codes) => PermissionsSpec::Codes(codes.iter().cloned().collect()),
                    },
                })
                .collect(),
        }
    }
}

// =============================================================================
// DECLARATION
// =============================================================================

impl PolicyDeclaration {
    pub fn builder() -> PolicyBuilder {
        PolicyBuilder::default()
    }

    pub fn from_json_str(raw: &str) -> AppResult<Self> {
        let de = &mut serde_json::Deserializer::from_str(raw);
        let file: PolicyFile = serde_path_to_error::deserialize(de)
            .map_err(|e| AppError::invalid_policy(format!("{} at {}", e.inner(), e.path())))?;
        file.try_into()
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read policy from {}", path.display()))?;
        Self::from_json_str(&raw).with_context(|| format!("failed to load policy from {}", path.display()))
    }

    pub fn entries(&self) -> impl Iterator<Item = (i64, &DesiredGrants)> {
        self.entries.iter().map(|(role_id, desired)| (*role_id, desired))
    }

    pub fn get(&self, role_id: i64) -> Option<&DesiredGrants> {
        self.entries.get(&role_id)
    }

    pub fn role_ids(&self) -> Vec<i64> {
        self.entries.keys().copied().collect()
    }

    pub fn superuser_role_id(&self) -> Option<i64> {
        self.entries
            .iter()
            .find(|(_, desired)| matches!(desired, DesiredGrants::All))
            .map(|(role_id, _)| *role_id)
    }

    /// Every explicitly declared code, across roles.
    pub fn declared_codes(&self) -> BTreeSet<&str> {
        self.entries
            .values()
            .filter_map(|desired| match desired {
                DesiredGrants::Codes(codes) => Some(codes.iter().map(String::as_str)),
                DesiredGrants::All => None,
            })
            .flatten()
            .collect()
    }

    /// Subset of this declaration for the given roles, e.g. to retry the roles
    /// that hit a reconciliation conflict.
    pub fn restricted_to(&self, role_ids: &[i64]) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|(role_id, _)| role_ids.contains(role_id))
                .map(|(role_id, desired)| (*role_id, desired.clone()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct PolicyBuilder {
    entries: Vec<(i64, DesiredGrants)>,
    errors: Vec<String>,
}

impl PolicyBuilder {
    pub fn superuser(mut self, role_id: i64) -> Self {
        self.entries.push((role_id, DesiredGrants::All));
        self
    }

    pub fn role<I, C>(mut self, role_id: i64, codes: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        let mut set = BTreeSet::new();
        for code in codes {
            let code = code.into();
            match PermissionCode::parse(&code) {
                Ok(_) => {
                    set.insert(code);
                }
                Err(e) => self.errors.push(format!("role {role_id}: {e}")),
            }
        }
        self.entries.push((role_id, DesiredGrants::Codes(set)));
        self
    }

    pub fn build(self) -> AppResult<PolicyDeclaration> {
        let mut errors = self.errors;
        let mut entries = BTreeMap::new();

        for (role_id, desired) in self.entries {
            if entries.insert(role_id, desired).is_some() {
                errors.push(format!("role {role_id} is declared more than once"));
            }
        }

        let wildcard_roles: Vec<i64> = entries
            .iter()
            .filter(|(_, desired)| matches!(desired, DesiredGrants::All))
            .map(|(role_id, _)| *role_id)
            .collect();
        match wildcard_roles.len() {
            1 => {}
            0 => errors.push("exactly one role must be declared with \"*\" (the superuser)".to_string()),
            _ => errors.push(format!("only one role may be declared with \"*\", found {wildcard_roles:?}")),
        }

        if !errors.is_empty() {
            return Err(AppError::invalid_policy(errors.join("; ")));
        }

        Ok(PolicyDeclaration { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wildcard_and_code_lists() {
        let policy = PolicyDeclaration::from_json_str(
            r#"{"roles": [
                {"role_id": 1, "permissions": "*"},
                {"role_id": 7, "permissions": ["workorder.view", "workorder.create", "workorder.view"]}
            ]}"#,
        )
        .unwrap();

        assert_eq!(policy.superuser_role_id(), Some(1));
        assert_eq!(
            policy.get(7),
            Some(&DesiredGrants::Codes(BTreeSet::from([
                "workorder.create".to_string(),
                "workorder.view".to_string()
            ])))
        );
        assert_eq!(policy.declared_codes().len(), 2);
    }

    #[test]
    fn requires_exactly_one_superuser() {
        let none = PolicyDeclaration::builder().role(2, ["invoice.view"]).build();
        assert!(matches!(none, Err(AppError::InvalidPolicy(_))));

        let two = PolicyDeclaration::builder().superuser(1).superuser(2).build();
        assert!(matches!(two, Err(AppError::InvalidPolicy(_))));
    }

    #[test]
    fn rejects_duplicates_bad_wildcards_and_malformed_codes() {
        let dup = PolicyDeclaration::builder()
            .superuser(1)
            .role(2, ["invoice.view"])
            .role(2, ["order.view"])
            .build();
        assert!(matches!(dup, Err(AppError::InvalidPolicy(m)) if m.contains("more than once")));

        let bad_wildcard = PolicyDeclaration::from_json_str(
            r#"{"roles": [{"role_id": 1, "permissions": "all"}]}"#,
        );
        assert!(matches!(bad_wildcard, Err(AppError::InvalidPolicy(_))));

        let malformed = PolicyDeclaration::builder().superuser(1).role(2, ["Invoice View"]).build();
        assert!(matches!(malformed, Err(AppError::InvalidPolicy(m)) if m.contains("role 2")));
    }

    #[test]
    fn parse_errors_name_the_json_path() {
        let err = PolicyDeclaration::from_json_str(r#"{"roles": [{"role_id": "seven", "permissions": []}]}"#)
            .unwrap_err();
        assert!(err.to_string().contains("roles[0].role_id"), "{err}");
    }

    #[test]
    fn unknown_but_well_formed_codes_are_accepted() {
        let policy = PolicyDeclaration::builder().superuser(1).role(3, ["po.cancel"]).build().unwrap();
        assert!(policy.declared_codes().contains("po.cancel"));
    }

    #[test]
    fn restricted_to_keeps_only_named_roles() {
        let policy = PolicyDeclaration::builder()
            .superuser(1)
            .role(2, ["invoice.view"])
            .role(7, ["workorder.view"])
            .build()
            .unwrap();
        let subset = policy.restricted_to(&[7]);
        assert_eq!(subset.role_ids(), vec![7]);
        assert_eq!(subset.superuser_role_id(), None);
    }

    #[test]
    fn file_round_trip_preserves_the_declaration() {
        let policy = PolicyDeclaration::builder().superuser(1).role(2, ["invoice.view"]).build().unwrap();
        let json = serde_json::to_string(&PolicyFile::from(&policy)).unwrap();
        assert_eq!(PolicyDeclaration::from_json_str(&json).unwrap(), policy);
    }
}
