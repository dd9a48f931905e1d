//! Request-time mapping from (HTTP method, path) to a permission code.
//!
//! The resource is the *first* path segment only, singularised by stripping a
//! single trailing `s`. `POST /orders/5/issue-materials` therefore requires
//! `order.create`, not anything derived from the sub-resource.
//!
//! Irregular plurals are not handled: `/categories` derives `categorie.view`.
//! Resources like that need an explicit exception table before they are routed
//! through this function.

use crate::errors::AppError;
use crate::models::rbac::PermissionCode;

/// Action half of a derived permission code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    View,
    Create,
    Update,
    Delete,
}

impl Action {
    /// Method names are matched exactly; HTTP methods are case-sensitive.
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "GET" => Some(Action::View),
            "POST" => Some(Action::Create),
            "PUT" | "PATCH" => Some(Action::Update),
            "DELETE" => Some(Action::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::View => "view",
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }

    pub fn all() -> [Action; 4] {
        [Action::View, Action::Create, Action::Update, Action::Delete]
    }

    pub fn is_derivable(action: &str) -> bool {
        Self::all().iter().any(|a| a.as_str() == action)
    }
}

/// First non-empty path segment.
pub fn resource_token(path: &str) -> &str {
    path.split('/').find(|segment| !segment.is_empty()).unwrap_or_default()
}

/// Naive singular form: strip one trailing `s` when something is left.
pub fn singularize(token: &str) -> &str {
    match token.strip_suffix('s') {
        Some(stem) if !stem.is_empty() => stem,
        _ => token,
    }
}

/// Permission code required for `method path`, or an empty string when none
/// can be derived. Callers must treat the empty string as deny.
pub fn derive(method: &str, path: &str) -> String {
    let resource = singularize(resource_token(path));
    match Action::from_method(method) {
        Some(action) if !resource.is_empty() => format!("{}.{}", resource, action.as_str()),
        _ => String::new(),
    }
}

/// Like [`derive`], but reports the empty case as `DerivationAmbiguous` and
/// validates the result as a catalog-shaped code.
pub fn derive_code(method: &str, path: &str) -> Result<PermissionCode, AppError> {
    let ambiguous = || AppError::DerivationAmbiguous {
        method: method.to_string(),
        path: path.to_string(),
    };

    let code = derive(method, path);
    if code.is_empty() {
        return Err(ambiguous());
    }
    // A resource segment with uppercase or odd characters derives a code the
    // catalog can never contain.
    PermissionCode::parse(&code).map_err(|_| ambiguous())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn maps_methods_to_actions() {
        assert_eq!(derive("GET", "/orders"), "order.view");
        assert_eq!(derive("POST", "/orders"), "order.create");
        assert_eq!(derive("PUT", "/orders/5"), "order.update");
        assert_eq!(derive("PATCH", "/orders/5"), "order.update");
        assert_eq!(derive("DELETE", "/orders/5"), "order.delete");
    }

    #[test]
    fn uses_first_segment_only() {
        assert_eq!(derive("POST", "/orders/5/issue-materials"), "order.create");
        assert_eq!(derive("GET", "//invoices///12"), "invoice.view");
        assert_eq!(derive("GET", "workorders"), "workorder.view");
    }

    #[test]
    fn singularizes_by_single_suffix_strip() {
        assert_eq!(singularize("s"), "s");
        assert_eq!(singularize("ss"), "s");
        assert_eq!(singularize("inventory"), "inventory");
        assert_eq!(derive("GET", "/status"), "statu.view");
        assert_eq!(derive("GET", "/categories"), "categorie.view");
    }

    #[test]
    fn empty_when_nothing_derivable() {
        assert_eq!(derive("GET", ""), "");
        assert_eq!(derive("GET", "/"), "");
        assert_eq!(derive("OPTIONS", "/orders"), "");
        assert_eq!(derive("get", "/orders"), "");
        assert!(matches!(derive_code("HEAD", "/orders"), Err(AppError::DerivationAmbiguous { .. })));
        assert!(matches!(derive_code("GET", "/Orders"), Err(AppError::DerivationAmbiguous { .. })));
        assert_eq!(derive_code("GET", "/orders").unwrap().as_str(), "order.view");
    }

    fn method() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("GET".to_string()),
            Just("POST".to_string()),
            Just("PUT".to_string()),
            Just("PATCH".to_string()),
            Just("DELETE".to_string()),
            "[A-Za-z]{0,8}",
        ]
    }

    proptest! {
        #[test]
        fn derive_is_deterministic(m in method(), path in "[a-z/0-9-]{0,24}") {
            prop_assert_eq!(derive(&m, &path), derive(&m, &path));
        }

        #[test]
        fn unmapped_methods_derive_nothing(m in "[A-Za-z]{0,8}", path in "/[a-z]{1,12}(/[0-9]{1,3})?") {
            prop_assume!(Action::from_method(&m).is_none());
            prop_assert_eq!(derive(&m, &path), "");
        }

        #[test]
        fn paths_without_segments_derive_nothing(m in method(), slashes in "/{0,6}") {
            prop_assert_eq!(derive(&m, &slashes), "");
        }

        #[test]
        fn trailing_segments_never_change_the_code(
            m in method(),
            resource in "[a-z]{1,12}",
            tail in "(/[a-z0-9-]{1,8}){0,4}",
        ) {
            let base = format!("/{resource}");
            let nested = format!("/{resource}{tail}");
            prop_assert_eq!(derive(&m, &base), derive(&m, &nested));
        }

        #[test]
        fn derived_codes_are_resource_dot_action(m in method(), resource in "[a-z]{1,12}") {
            let code = derive(&m, &format!("/{resource}"));
            if let Some(action) = Action::from_method(&m) {
                let expected_resource = singularize(&resource);
                prop_assert_eq!(code, format!("{}.{}", expected_resource, action.as_str()));
            } else {
                prop_assert!(code.is_empty());
            }
        }
    }
}
