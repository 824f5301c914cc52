//! Claim consumers and draining

use super::cordon::CordonGuard;
use super::Workflow;
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::Pod;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

/// True when `pod` mounts any of `claims`, is bound to a node and has not
/// terminated. An unscheduled pod holds no attachment.
fn consumes(pod: &Pod, claims: &[&str]) -> bool {
    let scheduled = pod
        .spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .is_some_and(|node| !node.is_empty());
    if !scheduled {
        return false;
    }

    let finished = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Succeeded" || phase == "Failed");
    if finished {
        return false;
    }

    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|v| v.persistent_volume_claim.as_ref())
        .any(|source| claims.contains(&source.claim_name.as_str()))
}

fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or_default()
}

impl Workflow {
    /// Scheduled, unfinished pods in `namespace` that use any of `claims`
    pub async fn consumers(&self, namespace: &str, claims: &[&str]) -> Result<Vec<Pod>> {
        Ok(self
            .kube
            .list_pods(namespace)
            .await?
            .into_iter()
            .filter(|pod| consumes(pod, claims))
            .collect())
    }

    /// Make sure nothing uses `claims`.
    ///
    /// Without consumers nothing is touched and `None` is returned. With
    /// consumers and no `force` the call fails with [`Error::Conflict`].
    /// Otherwise every driver node is cordoned, the consumers are deleted
    /// and the call waits until they are gone; the returned guard holds the
    /// cordoned nodes.
    pub async fn drain(
        &self,
        namespace: &str,
        claims: &[&str],
        force: bool,
    ) -> Result<Option<CordonGuard>> {
        let pods = self.consumers(namespace, claims).await?;
        if pods.is_empty() {
            debug!("No pods use {:?}", claims);
            return Ok(None);
        }

        let names: Vec<&str> = pods.iter().map(pod_name).collect();
        if !force {
            return Err(Error::Conflict(format!(
                "{:?} in use by pods {:?}, use --force to evict them",
                claims, names
            )));
        }

        let mut guard = CordonGuard::new(self.kube.clone());
        match self.evict(namespace, claims, &pods, &mut guard).await {
            Ok(()) => Ok(Some(guard)),
            Err(e) => {
                guard.release().await;
                Err(e)
            }
        }
    }

    async fn evict(
        &self,
        namespace: &str,
        claims: &[&str],
        pods: &[Pod],
        guard: &mut CordonGuard,
    ) -> Result<()> {
        for node in self.driver_nodes().await? {
            guard.cordon(&node).await?;
        }

        for pod in pods {
            info!("Deleting pod {}/{}", namespace, pod_name(pod));
            self.kube.delete_pod(namespace, pod_name(pod)).await?;
        }

        let deadline = Instant::now() + self.timing.drain_timeout;
        loop {
            let remaining = self.consumers(namespace, claims).await?;
            if remaining.is_empty() {
                break;
            }
            if Instant::now() > deadline {
                return Err(Error::Timeout {
                    action: "pod termination".to_string(),
                    resource: format!("{}/{:?}", namespace, claims),
                });
            }

            debug!("Waiting for {} pods to terminate", remaining.len());
            sleep(self.timing.poll_interval).await;
        }

        sleep(self.timing.settle_delay).await;
        Ok(())
    }
}
