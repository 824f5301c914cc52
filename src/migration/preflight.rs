//! Preflight checks run before any workflow mutates state

use super::Workflow;
use crate::error::{Error, Result};
use tracing::debug;

/// Verbs and resources the workflows need, checked before mutating
pub const REQUIRED_PERMISSIONS: &[(&str, &str)] = &[
    ("create", "persistentvolumes"),
    ("delete", "persistentvolumes"),
    ("create", "persistentvolumeclaims"),
    ("delete", "persistentvolumeclaims"),
    ("delete", "pods"),
    ("patch", "nodes"),
];

impl Workflow {
    /// Fail with [`Error::PermissionDenied`] listing every missing grant
    pub async fn check_permissions(&self, namespace: &str) -> Result<()> {
        let mut missing = Vec::new();

        for (verb, resource) in REQUIRED_PERMISSIONS {
            let namespace = match *resource {
                "persistentvolumes" | "nodes" => None,
                _ => Some(namespace),
            };

            if !self.kube.can_i(verb, resource, namespace).await? {
                missing.push(format!("{} {}", verb, resource));
            }
        }

        if !missing.is_empty() {
            return Err(Error::PermissionDenied(format!(
                "missing permissions: {}",
                missing.join(", ")
            )));
        }

        debug!("All {} permissions granted", REQUIRED_PERMISSIONS.len());
        Ok(())
    }

    /// Disk relocation needs a user login; API tokens are refused by the
    /// hypervisor for it
    pub fn require_privileged(&self, region: &str) -> Result<()> {
        if self.pool.is_privileged(region)? {
            return Ok(());
        }

        Err(Error::PermissionDenied(format!(
            "region {} needs username/password credentials to relocate disks",
            region
        )))
    }
}
