//! Type-safe identifier newtypes for certman.
//!
//! These types keep owner identities and certificate-request names apart at
//! compile time, so an owner UID can never be passed where a record name is
//! expected.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of the resource that owns a set of certificate requests.
///
/// Ownership filtering is done on this value alone; two records in the same
/// namespace with different owners are never confused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Create from an existing string
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Name of a certificate-request record.
///
/// Derived deterministically from the owning cluster and the certificate
/// bundle, so re-deriving it for unchanged input always yields the same name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestName(String);

impl RequestName {
    /// Derive the request name for a bundle of a cluster
    ///
    /// The result is `<cluster>-<bundle>`, lower-cased.
    pub fn for_bundle(cluster: &str, bundle: &str) -> Self {
        Self(format!("{}-{}", cluster, bundle).to_lowercase())
    }

    /// Wrap an already-derived name (e.g. one read back from a store)
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert to owned String
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for RequestName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for RequestName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_request_name_lowercases() {
        let name = RequestName::for_bundle("Prod-Cluster", "PrimaryCert");
        assert_eq!(name.as_str(), "prod-cluster-primarycert");
    }

    #[test]
    fn test_owner_id_display() {
        let owner = OwnerId::from("5c7a-uid");
        assert_eq!(owner.to_string(), "5c7a-uid");
    }

    proptest! {
        #[test]
        fn request_name_is_deterministic(cluster in "[A-Za-z0-9-]{1,20}", bundle in "[A-Za-z0-9-]{1,20}") {
            let first = RequestName::for_bundle(&cluster, &bundle);
            let second = RequestName::for_bundle(&cluster, &bundle);
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first.as_str(), first.as_str().to_lowercase());
        }
    }
}
