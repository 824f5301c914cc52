//! Claim rename and the rebinding steps shared with swap

use super::{BoundClaim, Workflow};
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

const RETAIN: &str = "Retain";

/// Annotations the binder owns; a recreated claim must not carry them
const BINDER_ANNOTATION_PREFIX: &str = "pv.kubernetes.io/";

/// One claim to recreate under `name` on `volume`
pub struct Rebind<'a> {
    /// Existing claim to delete, also the template of the new one
    pub from: &'a BoundClaim,
    pub name: &'a str,
    pub volume: &'a PersistentVolume,
}

fn volume_name(volume: &PersistentVolume) -> &str {
    volume.metadata.name.as_deref().unwrap_or_default()
}

/// New claim modelled on `template`, asking for `volume` by name
fn claim_for(template: &PersistentVolumeClaim, name: &str, volume: &PersistentVolume) -> PersistentVolumeClaim {
    let annotations: BTreeMap<String, String> = template
        .metadata
        .annotations
        .iter()
        .flatten()
        .filter(|(key, _)| !key.starts_with(BINDER_ANNOTATION_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let capacity = volume
        .spec
        .as_ref()
        .and_then(|s| s.capacity.as_ref())
        .and_then(|c| c.get("storage"))
        .cloned();

    let mut spec = template.spec.clone().unwrap_or_default();
    spec.volume_name = Some(volume_name(volume).to_string());
    if let Some(capacity) = capacity {
        spec.resources
            .get_or_insert_with(Default::default)
            .requests
            .get_or_insert_with(Default::default)
            .insert("storage".to_string(), capacity);
    }

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: template.metadata.namespace.clone(),
            labels: template.metadata.labels.clone(),
            annotations: (!annotations.is_empty()).then_some(annotations),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    }
}

impl Workflow {
    /// Recreate `from` as `to`, keeping its volume
    pub async fn rename(&self, namespace: &str, from: &str, to: &str, force: bool) -> Result<()> {
        if from == to {
            return Err(Error::invalid("old and new claim names are the same"));
        }
        if self.kube.get_pvc(namespace, to).await?.is_some() {
            return Err(Error::ResourceExists {
                kind: "PersistentVolumeClaim".to_string(),
                name: format!("{}/{}", namespace, to),
            });
        }

        let bound = self.bound_claim(namespace, from).await?;
        let guard = self.drain(namespace, &[from], force).await?;

        let result = self
            .rebind(
                namespace,
                &[Rebind {
                    from: &bound,
                    name: to,
                    volume: &bound.volume,
                }],
            )
            .await;

        if let Some(guard) = guard {
            guard.release().await;
        }

        result?;
        info!("Renamed {}/{} to {}", namespace, from, to);
        Ok(())
    }

    /// Delete the claims of `plan` and recreate them on their new volumes.
    ///
    /// Volumes are switched to `Retain` for the duration so deleting a
    /// claim never deletes its disk; the original policy is restored once
    /// the new claims are bound.
    pub(super) async fn rebind(&self, namespace: &str, plan: &[Rebind<'_>]) -> Result<()> {
        let mut policies = Vec::with_capacity(plan.len());
        for step in plan {
            let name = volume_name(step.volume);
            policies.push((name, self.retain(name).await?));
        }

        for step in plan {
            let claim = step.from.claim.metadata.name.as_deref().unwrap_or_default();
            info!("Deleting claim {}/{}", namespace, claim);
            self.kube.delete_pvc(namespace, claim).await?;
        }

        for step in plan {
            self.release_volume(volume_name(step.volume)).await?;
        }

        for step in plan {
            info!(
                "Creating claim {}/{} on volume {}",
                namespace,
                step.name,
                volume_name(step.volume)
            );
            let claim = claim_for(&step.from.claim, step.name, step.volume);
            self.kube.create_pvc(namespace, &claim).await?;
        }

        for step in plan {
            self.wait_bound(namespace, step.name).await?;
        }

        for (name, policy) in policies {
            self.set_reclaim_policy(name, &policy).await?;
        }

        Ok(())
    }

    async fn fetch_volume(&self, name: &str) -> Result<PersistentVolume> {
        self.kube
            .get_pv(name)
            .await?
            .ok_or_else(|| Error::not_found("PersistentVolume", name))
    }

    /// Switch the volume to `Retain`; returns the policy it had
    pub(super) async fn retain(&self, name: &str) -> Result<String> {
        let volume = self.fetch_volume(name).await?;
        let policy = volume
            .spec
            .as_ref()
            .and_then(|s| s.persistent_volume_reclaim_policy.clone())
            .unwrap_or_else(|| "Delete".to_string());

        if policy != RETAIN {
            self.set_reclaim_policy(name, RETAIN).await?;
        }
        Ok(policy)
    }

    pub(super) async fn set_reclaim_policy(&self, name: &str, policy: &str) -> Result<()> {
        let mut volume = self.fetch_volume(name).await?;
        let spec = volume.spec.get_or_insert_with(Default::default);
        if spec.persistent_volume_reclaim_policy.as_deref() == Some(policy) {
            return Ok(());
        }

        debug!("Setting reclaim policy of {} to {}", name, policy);
        spec.persistent_volume_reclaim_policy = Some(policy.to_string());
        self.kube.replace_pv(&volume).await?;
        Ok(())
    }

    /// Drop the volume's claim reference so a new claim can bind it
    async fn release_volume(&self, name: &str) -> Result<()> {
        let mut volume = self.fetch_volume(name).await?;
        if let Some(spec) = volume.spec.as_mut() {
            spec.claim_ref = None;
        }
        self.kube.replace_pv(&volume).await?;
        Ok(())
    }

    async fn wait_bound(&self, namespace: &str, name: &str) -> Result<()> {
        let deadline = Instant::now() + self.timing.drain_timeout;

        while Instant::now() <= deadline {
            let phase = self
                .kube
                .get_pvc(namespace, name)
                .await?
                .and_then(|claim| claim.status)
                .and_then(|status| status.phase);
            if phase.as_deref() == Some("Bound") {
                return Ok(());
            }

            sleep(self.timing.poll_interval).await;
        }

        Err(Error::Timeout {
            action: "claim binding".to_string(),
            resource: format!("{}/{}", namespace, name),
        })
    }
}
