//! Username → routing policy lookup.
//!
//! Identities come from a static table only. A username that is not in the
//! table resolves to `Route::Rejected`; nothing about the connection itself
//! is consulted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Banner written to a rejected identity before the connection is closed.
pub const REJECTION_BANNER: &str = "access denied: identity not recognized";

/// Where an identity's session is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// Straight to a fixed vector.
    Vector,
    /// User picks a vector from the triage screen.
    Triage,
    /// Turned away at login.
    Rejected,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Vector => "vector",
            Route::Triage => "triage",
            Route::Rejected => "rejected",
        }
    }
}

/// One row of the policy table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityPolicy {
    pub route: Route,
    #[serde(default)]
    pub vector: Option<String>,
}

impl IdentityPolicy {
    pub fn triage() -> Self {
        Self {
            route: Route::Triage,
            vector: None,
        }
    }

    pub fn vector(name: &str) -> Self {
        Self {
            route: Route::Vector,
            vector: Some(name.to_string()),
        }
    }

    pub fn rejected() -> Self {
        Self {
            route: Route::Rejected,
            vector: None,
        }
    }
}

/// A resolved identity. Immutable for the life of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub route: Route,
    /// Vector name, empty unless `route` is `Vector`.
    pub vector: String,
}

impl Identity {
    pub fn is_rejected(&self) -> bool {
        self.route == Route::Rejected
    }

    pub fn preselected_vector(&self) -> Option<&str> {
        match self.route {
            Route::Vector if !self.vector.is_empty() => Some(&self.vector),
            _ => None,
        }
    }
}

/// Static identity table.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    table: HashMap<String, IdentityPolicy>,
}

impl IdentityResolver {
    pub fn new(table: HashMap<String, IdentityPolicy>) -> Self {
        Self { table }
    }

    /// Table used when the configuration does not provide one.
    pub fn builtin() -> Self {
        let table = [
            ("guest", IdentityPolicy::triage()),
            ("visitor", IdentityPolicy::triage()),
            ("operator", IdentityPolicy::vector("relay")),
            ("analyst", IdentityPolicy::vector("archive")),
            ("root", IdentityPolicy::rejected()),
        ]
        .into_iter()
        .map(|(name, policy)| (name.to_string(), policy))
        .collect();
        Self::new(table)
    }

    pub fn resolve(&self, username: &str) -> Identity {
        match self.table.get(username) {
            Some(policy) => Identity {
                username: username.to_string(),
                route: policy.route,
                vector: match policy.route {
                    Route::Vector => policy.vector.clone().unwrap_or_default(),
                    Route::Triage | Route::Rejected => String::new(),
                },
            },
            None => Identity {
                username: username.to_string(),
                route: Route::Rejected,
                vector: String::new(),
            },
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_users_resolve_from_table() {
        let resolver = IdentityResolver::builtin();

        let guest = resolver.resolve("guest");
        assert_eq!(guest.route, Route::Triage);
        assert_eq!(guest.preselected_vector(), None);

        let operator = resolver.resolve("operator");
        assert_eq!(operator.route, Route::Vector);
        assert_eq!(operator.preselected_vector(), Some("relay"));
    }

    #[test]
    fn unknown_user_is_rejected() {
        let identity = IdentityResolver::builtin().resolve("mallory");
        assert!(identity.is_rejected());
        assert_eq!(identity.username, "mallory");
        assert!(identity.vector.is_empty());
    }

    #[test]
    fn lookup_is_exact() {
        let resolver = IdentityResolver::builtin();
        assert!(resolver.resolve("Guest").is_rejected());
        assert!(resolver.resolve(" guest").is_rejected());
    }

    #[test]
    fn explicit_rejection_entry() {
        assert!(IdentityResolver::builtin().resolve("root").is_rejected());
    }

    #[test]
    fn vector_is_dropped_for_non_vector_routes() {
        let mut table = HashMap::new();
        table.insert(
            "odd".to_string(),
            IdentityPolicy {
                route: Route::Triage,
                vector: Some("relay".to_string()),
            },
        );
        let identity = IdentityResolver::new(table).resolve("odd");
        assert!(identity.vector.is_empty());
    }
}
