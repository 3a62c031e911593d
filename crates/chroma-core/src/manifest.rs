//! Host permissions implied by an application's declared configuration
//!
//! The manifest generator lives in external build tooling; the core only
//! answers which host capabilities its storage and scheduling usage needs.

use core::fmt;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::config::AppManifestConfig;

/// A host capability the application must be granted
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Durable key-value storage, needed by any central store
    Storage,
    /// Wall-clock wake-ups, needed by scheduled jobs
    Alarms,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Storage => "storage",
            Permission::Alarms => "alarms",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute the permissions an app declaration requires, sorted and deduplicated
pub fn required_permissions(app: &AppManifestConfig) -> Vec<Permission> {
    let mut permissions = BTreeSet::new();
    if !app.stores.is_empty() {
        permissions.insert(Permission::Storage);
    }
    if !app.jobs.is_empty() {
        permissions.insert(Permission::Alarms);
    }
    permissions.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobDeclaration;

    #[test]
    fn test_empty_app_needs_nothing() {
        assert!(required_permissions(&AppManifestConfig::default()).is_empty());
    }

    #[test]
    fn test_stores_and_jobs() {
        let app = AppManifestConfig {
            name: "wallet".into(),
            stores: vec!["wallet".into(), "prices".into()],
            jobs: vec![JobDeclaration {
                name: "refresh".into(),
                schedule: "*/5 * * * *".into(),
            }],
        };
        assert_eq!(
            required_permissions(&app),
            vec![Permission::Storage, Permission::Alarms]
        );
        assert_eq!(Permission::Storage.to_string(), "storage");
    }
}
