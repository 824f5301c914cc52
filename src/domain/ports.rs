//! Domain Ports - Core trait definitions for the driver
//!
//! These traits define the boundaries between the volume lifecycle logic and
//! the systems it drives: a hypervisor cluster, the local mount table and the
//! container orchestrator API. Adapters implement them for production; tests
//! substitute in-memory fakes.

use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::CSINode;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

// =============================================================================
// Hypervisor Types
// =============================================================================

/// API version reported by a cluster
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiVersion {
    pub version: String,
    #[serde(default)]
    pub release: String,
}

/// Entry of the cluster status listing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterMember {
    /// `cluster` or `node`
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default, deserialize_with = "de_flag")]
    pub online: bool,
}

/// Resource kinds the cluster resource listing can be filtered by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Vm,
    Storage,
    Node,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Vm => "vm",
            ResourceKind::Storage => "storage",
            ResourceKind::Node => "node",
        }
    }
}

/// Entry of the cluster resource listing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterResource {
    pub id: String,
    /// `qemu`, `lxc`, `storage`, `node`, ...
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub vmid: Option<u32>,
    #[serde(default)]
    pub storage: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "de_flag")]
    pub shared: bool,
}

/// Capacity and sharing status of a storage on one node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageStatus {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub used: u64,
    #[serde(default)]
    pub avail: u64,
    #[serde(default, deserialize_with = "de_flag")]
    pub shared: bool,
    #[serde(default, deserialize_with = "de_flag")]
    pub active: bool,
    #[serde(rename = "type", default)]
    pub storage_type: String,
}

/// Volume stored on a storage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageVolume {
    /// `storage:disk`
    pub volid: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub vmid: Option<u32>,
}

/// Disk creation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskRequest {
    pub vmid: u32,
    pub filename: String,
    pub size_bytes: u64,
    pub format: Option<String>,
}

/// State of an asynchronous hypervisor task
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStatus {
    /// `running` or `stopped`
    pub status: String,
    #[serde(default)]
    pub exitstatus: Option<String>,
}

impl TaskStatus {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }

    pub fn is_ok(&self) -> bool {
        self.exitstatus.as_deref() == Some("OK")
    }
}

/// The hypervisor encodes booleans as 0/1, sometimes as strings
fn de_flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Bool(b) => b,
        serde_json::Value::Number(n) => n.as_u64().unwrap_or(0) != 0,
        serde_json::Value::String(s) => s == "1" || s.eq_ignore_ascii_case("true"),
        _ => false,
    })
}

// =============================================================================
// Hypervisor Port
// =============================================================================

/// Port for one hypervisor cluster
#[async_trait]
pub trait HypervisorApi: Send + Sync {
    /// Region (cluster alias) this client talks to
    fn region(&self) -> &str;

    /// Whether the client holds a privileged user login rather than a token
    fn is_privileged(&self) -> bool {
        false
    }

    async fn version(&self) -> Result<ApiVersion>;

    async fn cluster_status(&self) -> Result<Vec<ClusterMember>>;

    async fn cluster_resources(&self, kind: ResourceKind) -> Result<Vec<ClusterResource>>;

    async fn storage_status(&self, node: &str, storage: &str) -> Result<StorageStatus>;

    async fn storage_content(&self, node: &str, storage: &str) -> Result<Vec<StorageVolume>>;

    /// Allocate a disk; returns its volid
    async fn create_disk(&self, node: &str, storage: &str, request: &DiskRequest)
        -> Result<String>;

    async fn delete_disk(&self, node: &str, storage: &str, volid: &str) -> Result<()>;

    async fn vm_config(&self, node: &str, vmid: u32) -> Result<BTreeMap<String, String>>;

    /// Copy the single volume `volid` from `storage` on `node` to the
    /// same storage on `target`, keeping its volid; returns the task id.
    /// The source copy is left in place.
    async fn copy_volume(
        &self,
        node: &str,
        storage: &str,
        volid: &str,
        target: &str,
    ) -> Result<String>;

    async fn task_status(&self, node: &str, upid: &str) -> Result<TaskStatus>;
}

impl std::fmt::Debug for dyn HypervisorApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HypervisorApi")
            .field("region", &self.region())
            .finish()
    }
}

// =============================================================================
// Mounter Port
// =============================================================================

/// Filesystem usage of a mounted volume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilesystemStats {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_bytes: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
    pub used_inodes: u64,
}

/// Port for host-local format and mount primitives
#[async_trait]
pub trait Mounter: Send + Sync {
    async fn is_mount_point(&self, path: &Path) -> Result<bool>;

    /// Create a filesystem on `source` unless one exists, then mount it
    async fn format_and_mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
        mkfs_args: &[String],
    ) -> Result<()>;

    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: Option<&str>,
        options: &[String],
    ) -> Result<()>;

    /// Unmount `target`; a target that is not mounted is left alone
    async fn unmount(&self, target: &Path) -> Result<()>;

    /// Device backing the mount at `target`
    async fn device_for_mount(&self, target: &Path) -> Result<Option<String>>;

    async fn resize_filesystem(&self, device: &str, target: &Path) -> Result<()>;

    async fn filesystem_stats(&self, path: &Path) -> Result<FilesystemStats>;

    async fn block_device_size(&self, device: &str) -> Result<u64>;
}

// =============================================================================
// Orchestrator Port
// =============================================================================

/// Port for the container orchestrator API
#[async_trait]
pub trait KubeApi: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    /// Cordon (`true`) or uncordon (`false`) a node
    async fn set_unschedulable(&self, name: &str, unschedulable: bool) -> Result<()>;

    async fn list_csi_nodes(&self) -> Result<Vec<CSINode>>;

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>>;

    async fn create_pv(&self, pv: &PersistentVolume) -> Result<PersistentVolume>;

    async fn replace_pv(&self, pv: &PersistentVolume) -> Result<PersistentVolume>;

    /// Delete a volume record, clearing finalizers so it goes away at once
    async fn delete_pv(&self, name: &str) -> Result<()>;

    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>>;

    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim>;

    /// Delete a claim, clearing finalizers so it goes away at once
    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()>;

    /// Dry-run access check for the current credentials
    async fn can_i(&self, verb: &str, resource: &str, namespace: Option<&str>) -> Result<bool>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type HypervisorApiRef = Arc<dyn HypervisorApi>;
pub type MounterRef = Arc<dyn Mounter>;
pub type KubeApiRef = Arc<dyn KubeApi>;
