//! Migration Orchestrator
//!
//! Out-of-band workflows that move a volume to another hypervisor node or
//! rebind volumes to different claims:
//!
//! - **migrate**: relocate a claim's disk to another node of its region
//! - **rename**: recreate a claim under a new name on the same volume
//! - **swap**: exchange the volumes behind two claims
//!
//! Every workflow runs the same shape: preflight, drain (optional, with
//! cordoning), the storage-side action, then uncordon on every exit path.

pub mod cordon;
pub mod drain;
pub mod migrate;
pub mod preflight;
pub mod rename;
pub mod swap;

pub use cordon::CordonGuard;
pub use preflight::REQUIRED_PERMISSIONS;

use crate::cluster::ClusterPool;
use crate::domain::ports::KubeApiRef;
use crate::error::{Error, Result};
use crate::volume::VolumeId;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Configuration
// =============================================================================

/// Poll and wait durations of the workflows
#[derive(Debug, Clone)]
pub struct WorkflowTiming {
    pub poll_interval: Duration,
    /// Pause after the last consumer is gone
    pub settle_delay: Duration,
    pub drain_timeout: Duration,
    pub detach_timeout: Duration,
}

impl Default for WorkflowTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            settle_delay: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(300),
            detach_timeout: Duration::from_secs(300),
        }
    }
}

/// Default bound on the relocation task, in seconds
pub const DEFAULT_MIGRATE_TIMEOUT: u64 = 10800;

// =============================================================================
// Workflow
// =============================================================================

/// Claim together with the driver volume it is bound to
#[derive(Debug, Clone)]
pub struct BoundClaim {
    pub claim: PersistentVolumeClaim,
    pub volume: PersistentVolume,
    pub id: VolumeId,
}

impl BoundClaim {
    pub fn volume_name(&self) -> &str {
        self.volume.metadata.name.as_deref().unwrap_or_default()
    }
}

/// Shared state of the migrate, rename and swap workflows
pub struct Workflow {
    kube: KubeApiRef,
    pool: Arc<ClusterPool>,
    driver_name: String,
    timing: WorkflowTiming,
}

impl Workflow {
    pub fn new(kube: KubeApiRef, pool: Arc<ClusterPool>, driver_name: impl Into<String>) -> Self {
        Self {
            kube,
            pool,
            driver_name: driver_name.into(),
            timing: WorkflowTiming::default(),
        }
    }

    pub fn with_timing(mut self, timing: WorkflowTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn timing(&self) -> &WorkflowTiming {
        &self.timing
    }

    /// Resolve `namespace/name` to its bound volume.
    ///
    /// The volume must be provisioned by this driver.
    pub async fn bound_claim(&self, namespace: &str, name: &str) -> Result<BoundClaim> {
        let claim = self
            .kube
            .get_pvc(namespace, name)
            .await?
            .ok_or_else(|| Error::not_found("PersistentVolumeClaim", format!("{}/{}", namespace, name)))?;

        let volume_name = claim
            .spec
            .as_ref()
            .and_then(|s| s.volume_name.clone())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                Error::Conflict(format!("PersistentVolumeClaim {}/{} is not bound", namespace, name))
            })?;

        let volume = self
            .kube
            .get_pv(&volume_name)
            .await?
            .ok_or_else(|| Error::not_found("PersistentVolume", &volume_name))?;

        let csi = volume
            .spec
            .as_ref()
            .and_then(|s| s.csi.as_ref())
            .filter(|csi| csi.driver == self.driver_name)
            .ok_or_else(|| {
                Error::Conflict(format!(
                    "PersistentVolume {} is not managed by {}",
                    volume_name, self.driver_name
                ))
            })?;

        let id = VolumeId::parse_compat(&csi.volume_handle)?;

        Ok(BoundClaim { claim, volume, id })
    }
}
