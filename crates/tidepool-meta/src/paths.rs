//! Metadata path layout
//!
//! Stores live under `/{cluster}/Stores/{store}`.

use tidepool_common::{Error, Result};

/// Composes and parses store paths for one cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorePaths {
    root: String,
}

impl StorePaths {
    /// Name of the collection node under the cluster
    pub const STORES_NODE: &'static str = "Stores";

    /// Paths for `cluster`
    pub fn new(cluster: &str) -> Self {
        Self {
            root: format!("/{cluster}/{}", Self::STORES_NODE),
        }
    }

    /// Collection root holding one child per store
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Path of the node holding `store`
    pub fn store_path(&self, store: &str) -> String {
        format!("{}/{store}", self.root)
    }

    /// Check that `name` can be used as a single path component
    pub fn validate_store_name(name: &str) -> Result<()> {
        if name.is_empty() || name.contains('/') {
            return Err(Error::consistency(format!("invalid store name {name:?}")));
        }
        Ok(())
    }

    /// Extract the store name from a store path
    ///
    /// Anything other than a direct child of the root is a consistency error.
    pub fn parse_store_name<'a>(&self, path: &'a str) -> Result<&'a str> {
        let name = path
            .strip_prefix(self.root.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| {
                Error::consistency(format!("path {path} is not under {}", self.root))
            })?;
        Self::validate_store_name(name)?;
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_and_parse() {
        let paths = StorePaths::new("east");
        assert_eq!(paths.root(), "/east/Stores");
        let path = paths.store_path("users");
        assert_eq!(path, "/east/Stores/users");
        assert_eq!(paths.parse_store_name(&path).unwrap(), "users");
    }

    #[test]
    fn test_parse_rejects_foreign_paths() {
        let paths = StorePaths::new("east");
        for path in [
            "/east/Stores",
            "/east/Stores/",
            "/east/Storesx/users",
            "/west/Stores/users",
            "/east/Stores/users/v1",
        ] {
            assert!(
                matches!(paths.parse_store_name(path), Err(Error::Consistency(_))),
                "{path} should be rejected"
            );
        }
    }
}
