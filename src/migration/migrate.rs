//! Relocate a claim's disk to another node of its region

use super::{BoundClaim, Workflow};
use crate::cluster::wait_for_task;
use crate::csi::types::{LABEL_K8S_ZONE, LABEL_NODE, LABEL_ZONE};
use crate::error::{Error, Result};
use crate::volume::VolumeId;
use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Node affinity keys that pin a volume to its zone
const ZONE_KEYS: &[&str] = &[LABEL_ZONE, LABEL_K8S_ZONE, LABEL_NODE];

/// Copy of `volume` addressing `id` on `zone`, ready to be created again
fn relocated_volume(volume: &PersistentVolume, id: &VolumeId, zone: &str, policy: &str) -> PersistentVolume {
    let mut moved = PersistentVolume {
        metadata: ObjectMeta {
            name: volume.metadata.name.clone(),
            labels: volume.metadata.labels.clone(),
            annotations: volume.metadata.annotations.clone(),
            ..Default::default()
        },
        spec: volume.spec.clone(),
        status: None,
    };

    let Some(spec) = moved.spec.as_mut() else {
        return moved;
    };
    spec.persistent_volume_reclaim_policy = Some(policy.to_string());
    if let Some(csi) = spec.csi.as_mut() {
        csi.volume_handle = id.to_string();
    }

    let terms = spec
        .node_affinity
        .as_mut()
        .and_then(|a| a.required.as_mut())
        .map(|r| r.node_selector_terms.iter_mut());
    for term in terms.into_iter().flatten() {
        for expression in term.match_expressions.iter_mut().flatten() {
            if ZONE_KEYS.contains(&expression.key.as_str()) {
                expression.values = Some(vec![zone.to_string()]);
            }
        }
    }

    moved
}

impl Workflow {
    /// Move the disk behind `namespace/claim` to hypervisor node `target`.
    ///
    /// Only that one volume is copied; other disks on the source node are
    /// left alone. `timeout` bounds the copy task.
    pub async fn migrate(
        &self,
        namespace: &str,
        claim: &str,
        target: &str,
        force: bool,
        timeout: Duration,
    ) -> Result<()> {
        let bound = self.bound_claim(namespace, claim).await?;
        let id = &bound.id;

        if id.is_shared() {
            return Err(Error::invalid(format!(
                "volume {} is on shared storage and has no node to migrate from",
                id
            )));
        }
        if id.zone() == target {
            info!("Volume {} already lives on {}", id, target);
            return Ok(());
        }
        if id.storage().is_empty() {
            return Err(Error::invalid(format!(
                "volume {} does not name its storage",
                id
            )));
        }

        self.require_privileged(id.region())?;

        let client = self.pool.get(id.region())?;
        let online = client
            .cluster_status()
            .await?
            .iter()
            .any(|m| m.kind == "node" && m.name == target && m.online);
        if !online {
            return Err(Error::not_found("node", format!("{}/{}", id.region(), target)));
        }

        let guard = self.drain(namespace, &[claim], force).await?;
        let result = self.relocate(&bound, target, timeout).await;

        if let Some(guard) = guard {
            guard.release().await;
        }

        result?;
        info!("Migrated {}/{} to {}", namespace, claim, target);
        Ok(())
    }

    async fn relocate(&self, bound: &BoundClaim, target: &str, timeout: Duration) -> Result<()> {
        let id = &bound.id;
        self.wait_detached(id).await?;

        let client = self.pool.get(id.region())?;
        let volid = id.volid();

        info!("Copying {} from {} to {}", volid, id.zone(), target);
        let upid = client
            .copy_volume(id.zone(), id.storage(), &volid, target)
            .await?;
        wait_for_task(client.as_ref(), id.zone(), &upid, timeout, self.timing.poll_interval).await?;

        let copied = client
            .storage_content(target, id.storage())
            .await?
            .iter()
            .any(|v| v.volid == volid);
        if !copied {
            return Err(Error::Internal(format!(
                "volume {} missing from {} after copy",
                volid, target
            )));
        }

        let mut moved = id.clone();
        moved.set_zone(target);
        self.rewrite_volume(bound.volume_name(), &moved, target).await?;

        // The volume record already points at the copy.
        if let Err(e) = client.delete_disk(id.zone(), id.storage(), &volid).await {
            warn!("Failed to remove source copy of {} on {}: {}", volid, id.zone(), e);
            return Err(Error::Internal(format!(
                "volume moved to {} but its source copy on {} remains: {}",
                target,
                id.zone(),
                e
            )));
        }
        Ok(())
    }

    /// Wait until no VM other than the provisioning VM references the disk
    async fn wait_detached(&self, id: &VolumeId) -> Result<()> {
        let deadline = Instant::now() + self.timing.detach_timeout;

        while Instant::now() <= deadline {
            match self.pool.find_disk_owner(id).await? {
                None => return Ok(()),
                Some(owner) => debug!("Disk {} still attached to VM {}", id, owner.vmid),
            }
            sleep(self.timing.poll_interval).await;
        }

        Err(Error::Timeout {
            action: "disk detach".to_string(),
            resource: id.to_string(),
        })
    }

    /// Recreate the volume record with the new handle and zone affinity
    async fn rewrite_volume(&self, name: &str, id: &VolumeId, zone: &str) -> Result<()> {
        let policy = self.retain(name).await?;
        let current = self
            .kube
            .get_pv(name)
            .await?
            .ok_or_else(|| Error::not_found("PersistentVolume", name))?;

        let moved = relocated_volume(&current, id, zone, &policy);

        self.kube.delete_pv(name).await?;
        self.kube.create_pv(&moved).await?;
        info!("Volume {} now points at {}", name, id);
        Ok(())
    }
}
