//! Kubernetes Adapter
//!
//! [`KubeApi`] implementation on a `kube` client.

use crate::domain::ports::KubeApi;
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::CSINode;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::json;
use std::path::Path;
use tracing::debug;

/// Treat a 404 from the API server as success
fn ignore_not_found<T>(result: std::result::Result<T, kube::Error>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Orchestrator client backed by the cluster API server
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using an explicit kubeconfig, or the in-cluster / default
    /// configuration when none is given
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self> {
        let client = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    Error::Configuration(format!("kubeconfig {}: {}", path.display(), e))
                })?;
                let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| {
                        Error::Configuration(format!("kubeconfig {}: {}", path.display(), e))
                    })?;
                Client::try_from(config)?
            }
            None => Client::try_default().await?,
        };

        Ok(Self::new(client))
    }

    fn clear_finalizers() -> Patch<serde_json::Value> {
        Patch::Merge(json!({ "metadata": { "finalizers": null } }))
    }
}

#[async_trait]
impl KubeApi for KubeClient {
    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn set_unschedulable(&self, name: &str, unschedulable: bool) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = Patch::Merge(json!({ "spec": { "unschedulable": unschedulable } }));
        api.patch(name, &PatchParams::default(), &patch).await?;
        debug!("Node {} unschedulable={}", name, unschedulable);
        Ok(())
    }

    async fn list_csi_nodes(&self) -> Result<Vec<CSINode>> {
        let api: Api<CSINode> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn create_pv(&self, pv: &PersistentVolume) -> Result<PersistentVolume> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        Ok(api.create(&PostParams::default(), pv).await?)
    }

    async fn replace_pv(&self, pv: &PersistentVolume) -> Result<PersistentVolume> {
        let name = pv
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::invalid("PersistentVolume has no name"))?;
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        Ok(api.replace(name, &PostParams::default(), pv).await?)
    }

    async fn delete_pv(&self, name: &str) -> Result<()> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)?;
        ignore_not_found(
            api.patch(name, &PatchParams::default(), &Self::clear_finalizers())
                .await,
        )
    }

    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), pvc).await?)
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)?;
        ignore_not_found(
            api.patch(name, &PatchParams::default(), &Self::clear_finalizers())
                .await,
        )
    }

    async fn can_i(&self, verb: &str, resource: &str, namespace: Option<&str>) -> Result<bool> {
        let api: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
        let review = SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(ResourceAttributes {
                    verb: Some(verb.to_string()),
                    resource: Some(resource.to_string()),
                    namespace: namespace.map(str::to_string),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        let response = api.create(&PostParams::default(), &review).await?;
        Ok(response.status.is_some_and(|status| status.allowed))
    }
}
