//! Cordon bookkeeping
//!
//! [`CordonGuard`] owns the nodes a workflow made unschedulable and gives
//! them back on release.

use super::Workflow;
use crate::domain::ports::KubeApiRef;
use crate::error::Result;
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Set of nodes cordoned by one workflow run.
///
/// Call [`CordonGuard::release`] on every exit path. A guard dropped while
/// still holding nodes uncordons them on a background task.
pub struct CordonGuard {
    kube: KubeApiRef,
    nodes: Vec<String>,
}

impl std::fmt::Debug for CordonGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CordonGuard")
            .field("nodes", &self.nodes)
            .finish()
    }
}

impl CordonGuard {
    pub fn new(kube: KubeApiRef) -> Self {
        Self {
            kube,
            nodes: Vec::new(),
        }
    }

    /// Cordon `node` and remember it.
    ///
    /// The node is held even when the patch reports an error, since the
    /// change may have been applied anyway.
    pub async fn cordon(&mut self, node: &str) -> Result<()> {
        if self.nodes.iter().any(|n| n == node) {
            return Ok(());
        }

        self.nodes.push(node.to_string());
        self.kube.set_unschedulable(node, true).await?;
        info!("Cordoned node {}", node);
        Ok(())
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    /// Uncordon every held node. Failures are logged, not returned, so they
    /// never hide the workflow's own outcome.
    pub async fn release(mut self) {
        let nodes = std::mem::take(&mut self.nodes);
        uncordon_all(&self.kube, nodes).await;
    }
}

async fn uncordon_all(kube: &KubeApiRef, nodes: Vec<String>) {
    for node in nodes {
        match kube.set_unschedulable(&node, false).await {
            Ok(()) => info!("Uncordoned node {}", node),
            Err(e) => warn!("Failed to uncordon node {}: {}", node, e),
        }
    }
}

impl Drop for CordonGuard {
    fn drop(&mut self) {
        if self.nodes.is_empty() {
            return;
        }

        let nodes = std::mem::take(&mut self.nodes);
        warn!("Cordon guard dropped holding nodes {:?}", nodes);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let kube = self.kube.clone();
                handle.spawn(async move { uncordon_all(&kube, nodes).await });
            }
            Err(_) => warn!("No runtime to uncordon {:?}; uncordon them manually", nodes),
        }
    }
}

impl Workflow {
    /// Nodes whose CSINode object lists this driver
    pub async fn driver_nodes(&self) -> Result<BTreeSet<String>> {
        let nodes = self
            .kube
            .list_csi_nodes()
            .await?
            .into_iter()
            .filter(|csi_node| {
                csi_node
                    .spec
                    .drivers
                    .iter()
                    .any(|driver| driver.name == self.driver_name)
            })
            .filter_map(|csi_node| csi_node.metadata.name)
            .collect();

        Ok(nodes)
    }
}
