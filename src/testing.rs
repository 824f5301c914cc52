//! In-memory fakes of the driver's ports, for unit tests

use crate::csi::types::{LABEL_REGION, LABEL_ZONE};
use crate::domain::ports::*;
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, Node, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    NodeSpec, ObjectReference, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimStatus, PersistentVolumeClaimVolumeSource,
    PersistentVolumeSpec, Pod, PodSpec, PodStatus, Volume, VolumeNodeAffinity,
};
use k8s_openapi::api::storage::v1::{CSINode, CSINodeDriver, CSINodeSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

// =============================================================================
// Hypervisor
// =============================================================================

struct FakeStorage {
    node: String,
    name: String,
    shared: bool,
    avail: u64,
}

struct FakeVm {
    node: String,
    vmid: u32,
    name: String,
    config: BTreeMap<String, String>,
}

struct FakeTask {
    remaining: u32,
    exitstatus: String,
}

#[derive(Default)]
struct HypervisorState {
    nodes: Vec<ClusterMember>,
    storages: Vec<FakeStorage>,
    vms: Vec<FakeVm>,
    /// Keyed by (node, storage); shared storages use an empty node
    disks: BTreeMap<(String, String), Vec<StorageVolume>>,
    tasks: BTreeMap<String, FakeTask>,
    copies: Vec<(String, String, String)>,
    fail_create: Option<String>,
    fail_copy: Option<String>,
    privileged: bool,
}

impl HypervisorState {
    fn storage(&self, node: &str, storage: &str) -> Option<&FakeStorage> {
        self.storages
            .iter()
            .find(|s| s.node == node && s.name == storage)
    }

    fn disk_key(&self, node: &str, storage: &str) -> (String, String) {
        let shared = self
            .storages
            .iter()
            .any(|s| s.name == storage && s.shared);
        let node = if shared { "" } else { node };
        (node.to_string(), storage.to_string())
    }
}

/// One in-memory hypervisor cluster
pub struct FakeHypervisor {
    region: String,
    state: Mutex<HypervisorState>,
}

impl FakeHypervisor {
    pub fn new(region: &str) -> Self {
        Self {
            region: region.to_string(),
            state: Mutex::new(HypervisorState::default()),
        }
    }

    fn api_error(&self, status: u16, reason: impl Into<String>) -> Error {
        Error::ClusterApi {
            region: self.region.clone(),
            status: Some(status),
            reason: reason.into(),
        }
    }

    pub fn add_node(&self, name: &str, online: bool) {
        self.state.lock().nodes.push(ClusterMember {
            kind: "node".to_string(),
            name: name.to_string(),
            online,
        });
    }

    pub fn add_storage(&self, node: &str, storage: &str, shared: bool, avail: u64) {
        self.state.lock().storages.push(FakeStorage {
            node: node.to_string(),
            name: storage.to_string(),
            shared,
            avail,
        });
    }

    pub fn add_vm(&self, node: &str, vmid: u32, name: &str, uuid: Option<&str>) {
        let mut config = BTreeMap::from([("name".to_string(), name.to_string())]);
        if let Some(uuid) = uuid {
            config.insert("smbios1".to_string(), format!("uuid={}", uuid));
        }

        self.state.lock().vms.push(FakeVm {
            node: node.to_string(),
            vmid,
            name: name.to_string(),
            config,
        });
    }

    /// Reference `volid` from the VM's config as its next SCSI disk
    pub fn attach_disk(&self, node: &str, vmid: u32, volid: &str) {
        let mut state = self.state.lock();
        if let Some(vm) = state
            .vms
            .iter_mut()
            .find(|vm| vm.node == node && vm.vmid == vmid)
        {
            let slot = (0..)
                .map(|n| format!("scsi{}", n))
                .find(|key| !vm.config.contains_key(key))
                .unwrap_or_default();
            vm.config.insert(slot, format!("{},backup=0,iothread=1", volid));
        }
    }

    pub fn detach_disk(&self, node: &str, vmid: u32, volid: &str) {
        let mut state = self.state.lock();
        if let Some(vm) = state
            .vms
            .iter_mut()
            .find(|vm| vm.node == node && vm.vmid == vmid)
        {
            vm.config
                .retain(|_, value| value.split(',').next() != Some(volid));
        }
    }

    pub fn add_disk(&self, node: &str, storage: &str, volid: &str, size: u64) {
        let mut state = self.state.lock();
        let key = state.disk_key(node, storage);
        state.disks.entry(key).or_default().push(StorageVolume {
            volid: volid.to_string(),
            size,
            format: "raw".to_string(),
            vmid: None,
        });
    }

    pub fn has_disk(&self, node: &str, storage: &str, volid: &str) -> bool {
        self.disk_size(node, storage, volid).is_some()
    }

    pub fn disk_size(&self, node: &str, storage: &str, volid: &str) -> Option<u64> {
        let state = self.state.lock();
        let key = state.disk_key(node, storage);
        state
            .disks
            .get(&key)?
            .iter()
            .find(|d| d.volid == volid)
            .map(|d| d.size)
    }

    /// Make every following disk creation fail with `reason`
    pub fn fail_create(&self, reason: &str) {
        self.state.lock().fail_create = Some(reason.to_string());
    }

    /// Register a task that reports `running` for `running_polls` status
    /// calls, then stops with `exitstatus`. `u32::MAX` never stops.
    pub fn add_task(&self, node: &str, running_polls: u32, exitstatus: &str) -> String {
        let mut state = self.state.lock();
        let upid = format!("UPID:{}:{:08X}:qmigrate::root@pam:", node, state.tasks.len());
        state.tasks.insert(
            upid.clone(),
            FakeTask {
                remaining: running_polls,
                exitstatus: exitstatus.to_string(),
            },
        );
        upid
    }

    /// Report a user login instead of an API token
    pub fn set_privileged(&self, privileged: bool) {
        self.state.lock().privileged = privileged;
    }

    /// Make every following volume copy task stop with `exitstatus`
    pub fn fail_copy(&self, exitstatus: &str) {
        self.state.lock().fail_copy = Some(exitstatus.to_string());
    }

    /// Volume copies as (source node, volid, target node)
    pub fn copies(&self) -> Vec<(String, String, String)> {
        self.state.lock().copies.clone()
    }
}

#[async_trait]
impl HypervisorApi for FakeHypervisor {
    fn region(&self) -> &str {
        &self.region
    }

    fn is_privileged(&self) -> bool {
        self.state.lock().privileged
    }

    async fn version(&self) -> Result<ApiVersion> {
        Ok(ApiVersion {
            version: "8.2.4".to_string(),
            release: "8.2".to_string(),
        })
    }

    async fn cluster_status(&self) -> Result<Vec<ClusterMember>> {
        let mut members = vec![ClusterMember {
            kind: "cluster".to_string(),
            name: self.region.clone(),
            online: true,
        }];
        members.extend(self.state.lock().nodes.iter().cloned());
        Ok(members)
    }

    async fn cluster_resources(&self, kind: ResourceKind) -> Result<Vec<ClusterResource>> {
        let state = self.state.lock();
        let resources = match kind {
            ResourceKind::Vm => state
                .vms
                .iter()
                .map(|vm| ClusterResource {
                    id: format!("qemu/{}", vm.vmid),
                    kind: "qemu".to_string(),
                    node: vm.node.clone(),
                    name: Some(vm.name.clone()),
                    vmid: Some(vm.vmid),
                    status: Some("running".to_string()),
                    ..Default::default()
                })
                .collect(),
            ResourceKind::Storage => state
                .storages
                .iter()
                .map(|s| ClusterResource {
                    id: format!("storage/{}/{}", s.node, s.name),
                    kind: "storage".to_string(),
                    node: s.node.clone(),
                    storage: Some(s.name.clone()),
                    status: Some("available".to_string()),
                    shared: s.shared,
                    ..Default::default()
                })
                .collect(),
            ResourceKind::Node => state
                .nodes
                .iter()
                .map(|n| ClusterResource {
                    id: format!("node/{}", n.name),
                    kind: "node".to_string(),
                    node: n.name.clone(),
                    status: Some(if n.online { "online" } else { "offline" }.to_string()),
                    ..Default::default()
                })
                .collect(),
        };
        Ok(resources)
    }

    async fn storage_status(&self, node: &str, storage: &str) -> Result<StorageStatus> {
        let state = self.state.lock();
        let found = state.storage(node, storage).ok_or_else(|| {
            self.api_error(
                400,
                format!("Parameter verification failed. storage '{}' does not exist", storage),
            )
        })?;

        Ok(StorageStatus {
            total: found.avail * 2,
            used: found.avail,
            avail: found.avail,
            shared: found.shared,
            active: true,
            storage_type: if found.shared { "rbd" } else { "lvmthin" }.to_string(),
        })
    }

    async fn storage_content(&self, node: &str, storage: &str) -> Result<Vec<StorageVolume>> {
        let state = self.state.lock();
        if state.storage(node, storage).is_none() {
            return Err(self.api_error(
                400,
                format!("Parameter verification failed. storage '{}' does not exist", storage),
            ));
        }
        let key = state.disk_key(node, storage);
        Ok(state.disks.get(&key).cloned().unwrap_or_default())
    }

    async fn create_disk(&self, node: &str, storage: &str, request: &DiskRequest) -> Result<String> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.fail_create {
            return Err(self.api_error(500, reason.clone()));
        }
        if state.storage(node, storage).is_none() {
            return Err(self.api_error(400, "Parameter verification failed. storage"));
        }

        let volid = match &request.format {
            Some(_) => format!("{}:{}/{}", storage, request.vmid, request.filename),
            None => format!("{}:{}", storage, request.filename),
        };
        let key = state.disk_key(node, storage);
        state.disks.entry(key).or_default().push(StorageVolume {
            volid: volid.clone(),
            size: request.size_bytes,
            format: request.format.clone().unwrap_or_else(|| "raw".to_string()),
            vmid: Some(request.vmid),
        });
        Ok(volid)
    }

    async fn delete_disk(&self, node: &str, storage: &str, volid: &str) -> Result<()> {
        let mut state = self.state.lock();
        let key = state.disk_key(node, storage);
        let disks = state.disks.entry(key).or_default();
        let before = disks.len();
        disks.retain(|d| d.volid != volid);
        if disks.len() == before {
            return Err(self.api_error(500, format!("volume {} does not exist", volid)));
        }
        Ok(())
    }

    async fn vm_config(&self, node: &str, vmid: u32) -> Result<BTreeMap<String, String>> {
        self.state
            .lock()
            .vms
            .iter()
            .find(|vm| vm.node == node && vm.vmid == vmid)
            .map(|vm| vm.config.clone())
            .ok_or_else(|| {
                self.api_error(500, format!("Configuration file 'qemu-server/{}.conf' does not exist", vmid))
            })
    }

    async fn copy_volume(
        &self,
        node: &str,
        storage: &str,
        volid: &str,
        target: &str,
    ) -> Result<String> {
        let exitstatus = {
            let mut state = self.state.lock();
            if state.storage(target, storage).is_none() {
                return Err(self.api_error(
                    400,
                    format!("Parameter verification failed. storage '{}' does not exist", storage),
                ));
            }
            state
                .copies
                .push((node.to_string(), volid.to_string(), target.to_string()));

            match state.fail_copy.clone() {
                Some(exitstatus) => exitstatus,
                None => {
                    let source = state.disk_key(node, storage);
                    let disk = state
                        .disks
                        .get(&source)
                        .and_then(|disks| disks.iter().find(|d| d.volid == volid))
                        .cloned()
                        .ok_or_else(|| {
                            self.api_error(500, format!("volume {} does not exist", volid))
                        })?;
                    let destination = state.disk_key(target, storage);
                    state.disks.entry(destination).or_default().push(disk);
                    "OK".to_string()
                }
            }
        };

        Ok(self.add_task(node, 1, &exitstatus))
    }

    async fn task_status(&self, _node: &str, upid: &str) -> Result<TaskStatus> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(upid)
            .ok_or_else(|| self.api_error(500, format!("no such task {}", upid)))?;

        if task.remaining > 0 {
            if task.remaining != u32::MAX {
                task.remaining -= 1;
            }
            return Ok(TaskStatus {
                status: "running".to_string(),
                exitstatus: None,
            });
        }

        Ok(TaskStatus {
            status: "stopped".to_string(),
            exitstatus: Some(task.exitstatus.clone()),
        })
    }
}

// =============================================================================
// Mounter
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub source: String,
    pub fs_type: Option<String>,
    pub options: Vec<String>,
}

#[derive(Default)]
struct MounterState {
    mounts: BTreeMap<String, MountRecord>,
    formatted: Vec<(String, String, Vec<String>)>,
    stats: FilesystemStats,
    device_sizes: BTreeMap<String, u64>,
    resized: Vec<String>,
}

/// Mount table kept in memory
#[derive(Default)]
pub struct FakeMounter {
    state: Mutex<MounterState>,
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

impl FakeMounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount_at(&self, target: &str) -> Option<MountRecord> {
        self.state.lock().mounts.get(target).cloned()
    }

    /// Format calls as (device, filesystem, mkfs arguments)
    pub fn formatted(&self) -> Vec<(String, String, Vec<String>)> {
        self.state.lock().formatted.clone()
    }

    pub fn mount_count(&self) -> usize {
        self.state.lock().mounts.len()
    }

    pub fn set_stats(&self, stats: FilesystemStats) {
        self.state.lock().stats = stats;
    }

    pub fn add_mount(&self, source: &str, target: &str) {
        self.state.lock().mounts.insert(
            target.to_string(),
            MountRecord {
                source: source.to_string(),
                fs_type: None,
                options: Vec::new(),
            },
        );
    }

    pub fn set_device_size(&self, device: &str, size: u64) {
        self.state
            .lock()
            .device_sizes
            .insert(device.to_string(), size);
    }

    pub fn resized(&self) -> Vec<String> {
        self.state.lock().resized.clone()
    }
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn is_mount_point(&self, path: &Path) -> Result<bool> {
        Ok(self.state.lock().mounts.contains_key(&path_key(path)))
    }

    async fn format_and_mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
        mkfs_args: &[String],
    ) -> Result<()> {
        let mut state = self.state.lock();
        state
            .formatted
            .push((source.to_string(), fs_type.to_string(), mkfs_args.to_vec()));
        state.mounts.insert(
            path_key(target),
            MountRecord {
                source: source.to_string(),
                fs_type: Some(fs_type.to_string()),
                options: options.to_vec(),
            },
        );
        Ok(())
    }

    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: Option<&str>,
        options: &[String],
    ) -> Result<()> {
        self.state.lock().mounts.insert(
            path_key(target),
            MountRecord {
                source: source.to_string(),
                fs_type: fs_type.map(str::to_string),
                options: options.to_vec(),
            },
        );
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        self.state.lock().mounts.remove(&path_key(target));
        Ok(())
    }

    async fn device_for_mount(&self, target: &Path) -> Result<Option<String>> {
        Ok(self
            .state
            .lock()
            .mounts
            .get(&path_key(target))
            .map(|m| m.source.clone()))
    }

    async fn resize_filesystem(&self, device: &str, _target: &Path) -> Result<()> {
        self.state.lock().resized.push(device.to_string());
        Ok(())
    }

    async fn filesystem_stats(&self, _path: &Path) -> Result<FilesystemStats> {
        Ok(self.state.lock().stats)
    }

    async fn block_device_size(&self, device: &str) -> Result<u64> {
        self.state
            .lock()
            .device_sizes
            .get(device)
            .copied()
            .ok_or_else(|| Error::DeviceNotFound {
                device: device.to_string(),
            })
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

#[derive(Default)]
struct KubeState {
    nodes: BTreeMap<String, Node>,
    csi_nodes: Vec<CSINode>,
    pods: BTreeMap<(String, String), Pod>,
    pvs: BTreeMap<String, PersistentVolume>,
    pvcs: BTreeMap<(String, String), PersistentVolumeClaim>,
    cordon_log: Vec<(String, bool)>,
    denied: BTreeSet<(String, String)>,
    deleted_pods: Vec<String>,
    recreate_pods: bool,
    fail_cordon: BTreeSet<String>,
    next_uid: u32,
}

fn claim_pod(namespace: &str, name: &str, node: Option<&str>, phase: &str, claims: &[&str]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: node.map(str::to_string),
            volumes: Some(
                claims
                    .iter()
                    .map(|claim| Volume {
                        name: format!("{}-data", claim),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: claim.to_string(),
                            read_only: None,
                        }),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
    }
}

/// Orchestrator API kept in memory.
///
/// Creating a claim that names a volume binds it immediately.
#[derive(Default)]
pub struct FakeKube {
    state: Mutex<KubeState>,
}

impl FakeKube {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, name: &str, labels: &[(&str, &str)]) {
        let node = Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(NodeSpec::default()),
            ..Default::default()
        };
        self.state.lock().nodes.insert(name.to_string(), node);
    }

    /// Register a node whose CSINode object lists `drivers`
    pub fn add_csi_node(&self, name: &str, drivers: &[&str]) {
        if !self.state.lock().nodes.contains_key(name) {
            self.add_node(name, &[]);
        }

        let csi_node = CSINode {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: CSINodeSpec {
                drivers: drivers
                    .iter()
                    .map(|driver| CSINodeDriver {
                        name: driver.to_string(),
                        node_id: name.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            },
        };
        self.state.lock().csi_nodes.push(csi_node);
    }

    pub fn add_pod(&self, namespace: &str, name: &str, node: &str, claims: &[&str]) {
        let pod = claim_pod(namespace, name, Some(node), "Running", claims);
        self.state
            .lock()
            .pods
            .insert((namespace.to_string(), name.to_string()), pod);
    }

    /// Replace every deleted pod with an unscheduled Pending copy, the way a
    /// workload controller does
    pub fn recreate_deleted_pods(&self) {
        self.state.lock().recreate_pods = true;
    }

    pub fn add_pv(&self, pv: PersistentVolume) {
        let name = pv.metadata.name.clone().unwrap_or_default();
        self.state.lock().pvs.insert(name, pv);
    }

    pub fn add_pvc(&self, pvc: PersistentVolumeClaim) {
        let namespace = pvc.metadata.namespace.clone().unwrap_or_default();
        let name = pvc.metadata.name.clone().unwrap_or_default();
        self.state.lock().pvcs.insert((namespace, name), pvc);
    }

    pub fn pv(&self, name: &str) -> Option<PersistentVolume> {
        self.state.lock().pvs.get(name).cloned()
    }

    pub fn pvc(&self, namespace: &str, name: &str) -> Option<PersistentVolumeClaim> {
        self.state
            .lock()
            .pvcs
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Cordon calls as (node, unschedulable)
    pub fn cordon_log(&self) -> Vec<(String, bool)> {
        self.state.lock().cordon_log.clone()
    }

    pub fn is_unschedulable(&self, name: &str) -> bool {
        self.state
            .lock()
            .nodes
            .get(name)
            .and_then(|n| n.spec.as_ref())
            .and_then(|s| s.unschedulable)
            .unwrap_or(false)
    }

    pub fn deleted_pods(&self) -> Vec<String> {
        self.state.lock().deleted_pods.clone()
    }

    /// Apply the next cordon of `name` but report it as failed
    pub fn fail_cordon(&self, name: &str) {
        self.state.lock().fail_cordon.insert(name.to_string());
    }

    pub fn deny(&self, verb: &str, resource: &str) {
        self.state
            .lock()
            .denied
            .insert((verb.to_string(), resource.to_string()));
    }
}

#[async_trait]
impl KubeApi for FakeKube {
    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        Ok(self.state.lock().nodes.get(name).cloned())
    }

    async fn set_unschedulable(&self, name: &str, unschedulable: bool) -> Result<()> {
        let mut state = self.state.lock();
        let node = state
            .nodes
            .get_mut(name)
            .ok_or_else(|| Error::not_found("Node", name))?;
        node.spec.get_or_insert_with(Default::default).unschedulable = Some(unschedulable);
        state.cordon_log.push((name.to_string(), unschedulable));

        if unschedulable && state.fail_cordon.remove(name) {
            return Err(Error::Internal(format!("patch of node {} timed out", name)));
        }
        Ok(())
    }

    async fn list_csi_nodes(&self) -> Result<Vec<CSINode>> {
        Ok(self.state.lock().csi_nodes.clone())
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        Ok(self
            .state
            .lock()
            .pods
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let key = (namespace.to_string(), name.to_string());
        let Some(pod) = state.pods.remove(&key) else {
            return Ok(());
        };
        state.deleted_pods.push(name.to_string());

        if state.recreate_pods {
            let claims: Vec<String> = pod
                .spec
                .iter()
                .flat_map(|s| s.volumes.iter().flatten())
                .filter_map(|v| v.persistent_volume_claim.as_ref())
                .map(|c| c.claim_name.clone())
                .collect();
            let claims: Vec<&str> = claims.iter().map(String::as_str).collect();
            state
                .pods
                .insert(key, claim_pod(namespace, name, None, "Pending", &claims));
        }
        Ok(())
    }

    async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>> {
        Ok(self.pv(name))
    }

    async fn create_pv(&self, pv: &PersistentVolume) -> Result<PersistentVolume> {
        let name = pv.metadata.name.clone().unwrap_or_default();
        let mut state = self.state.lock();
        if state.pvs.contains_key(&name) {
            return Err(Error::ResourceExists {
                kind: "PersistentVolume".to_string(),
                name,
            });
        }
        state.pvs.insert(name, pv.clone());
        Ok(pv.clone())
    }

    async fn replace_pv(&self, pv: &PersistentVolume) -> Result<PersistentVolume> {
        let name = pv.metadata.name.clone().unwrap_or_default();
        let mut state = self.state.lock();
        if !state.pvs.contains_key(&name) {
            return Err(Error::not_found("PersistentVolume", name));
        }
        state.pvs.insert(name, pv.clone());
        Ok(pv.clone())
    }

    async fn delete_pv(&self, name: &str) -> Result<()> {
        self.state.lock().pvs.remove(name);
        Ok(())
    }

    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.pvc(namespace, name))
    }

    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        let name = pvc.metadata.name.clone().unwrap_or_default();
        let key = (namespace.to_string(), name.clone());

        let mut state = self.state.lock();
        if state.pvcs.contains_key(&key) {
            return Err(Error::ResourceExists {
                kind: "PersistentVolumeClaim".to_string(),
                name,
            });
        }

        state.next_uid += 1;
        let uid = format!("uid-{}", state.next_uid);
        let mut created = pvc.clone();
        created.metadata.namespace = Some(namespace.to_string());
        created.metadata.uid = Some(uid.clone());

        let volume_name = created.spec.as_ref().and_then(|s| s.volume_name.clone());
        let pv = match volume_name {
            Some(volume_name) => state.pvs.get_mut(&volume_name),
            None => None,
        };
        if let Some(pv) = pv {
            let unclaimed = pv
                .spec
                .as_ref()
                .map_or(true, |s| s.claim_ref.is_none());
            if unclaimed {
                pv.spec.get_or_insert_with(Default::default).claim_ref = Some(ObjectReference {
                    kind: Some("PersistentVolumeClaim".to_string()),
                    namespace: Some(namespace.to_string()),
                    name: Some(name.clone()),
                    uid: Some(uid),
                    ..Default::default()
                });
                let capacity = pv.spec.as_ref().and_then(|s| s.capacity.clone());
                created.status = Some(PersistentVolumeClaimStatus {
                    phase: Some("Bound".to_string()),
                    capacity,
                    ..Default::default()
                });
            }
        }

        state.pvcs.insert(key, created.clone());
        Ok(created)
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()> {
        self.state
            .lock()
            .pvcs
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn can_i(&self, verb: &str, resource: &str, _namespace: Option<&str>) -> Result<bool> {
        Ok(!self
            .state
            .lock()
            .denied
            .contains(&(verb.to_string(), resource.to_string())))
    }
}

// =============================================================================
// Object Builders
// =============================================================================

/// PersistentVolume of `driver` bound to `namespace/claim`, pinned to the
/// zone encoded in `handle`
pub fn csi_pv(
    name: &str,
    driver: &str,
    handle: &str,
    namespace: &str,
    claim: &str,
    reclaim_policy: &str,
) -> PersistentVolume {
    let mut segments = handle.split('/');
    let region = segments.next().unwrap_or_default();
    let zone = segments.next().unwrap_or_default();

    let mut expressions = vec![NodeSelectorRequirement {
        key: LABEL_REGION.to_string(),
        operator: "In".to_string(),
        values: Some(vec![region.to_string()]),
    }];
    if !zone.is_empty() {
        expressions.push(NodeSelectorRequirement {
            key: LABEL_ZONE.to_string(),
            operator: "In".to_string(),
            values: Some(vec![zone.to_string()]),
        });
    }

    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            resource_version: Some("100".to_string()),
            uid: Some(format!("pv-uid-{}", name)),
            finalizers: Some(vec!["kubernetes.io/pv-protection".to_string()]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            capacity: Some(BTreeMap::from([(
                "storage".to_string(),
                Quantity("10Gi".to_string()),
            )])),
            claim_ref: Some(ObjectReference {
                kind: Some("PersistentVolumeClaim".to_string()),
                namespace: Some(namespace.to_string()),
                name: Some(claim.to_string()),
                uid: Some(format!("pvc-uid-{}", claim)),
                ..Default::default()
            }),
            csi: Some(CSIPersistentVolumeSource {
                driver: driver.to_string(),
                volume_handle: handle.to_string(),
                fs_type: Some("ext4".to_string()),
                ..Default::default()
            }),
            node_affinity: Some(VolumeNodeAffinity {
                required: Some(NodeSelector {
                    node_selector_terms: vec![NodeSelectorTerm {
                        match_expressions: Some(expressions),
                        match_fields: None,
                    }],
                }),
            }),
            persistent_volume_reclaim_policy: Some(reclaim_policy.to_string()),
            storage_class_name: Some("pve-lvm".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Claim in `namespace` bound to the volume `pv`
pub fn bound_pvc(namespace: &str, name: &str, pv: &str, size: &str) -> PersistentVolumeClaim {
    let capacity = BTreeMap::from([("storage".to_string(), Quantity(size.to_string()))]);

    let mut spec = PersistentVolumeClaimSpec {
        access_modes: Some(vec!["ReadWriteOnce".to_string()]),
        storage_class_name: Some("pve-lvm".to_string()),
        volume_name: Some(pv.to_string()),
        resources: Some(Default::default()),
        ..Default::default()
    };
    if let Some(resources) = spec.resources.as_mut() {
        resources.requests = Some(capacity.clone());
    }

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("pvc-uid-{}", name)),
            annotations: Some(BTreeMap::from([(
                "pv.kubernetes.io/bind-completed".to_string(),
                "yes".to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(spec),
        status: Some(PersistentVolumeClaimStatus {
            phase: Some("Bound".to_string()),
            capacity: Some(capacity),
            ..Default::default()
        }),
    }
}
