//! Cluster Pool
//!
//! Keyed registry of hypervisor clients, one per region.

use super::client::PveClient;
use super::config::ClustersConfig;
use crate::domain::ports::{HypervisorApi, HypervisorApiRef, ResourceKind};
use crate::error::{Error, Result};
use crate::volume::{VolumeId, PROVISIONING_VM_ID};
use futures::future::try_join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

// =============================================================================
// VM Lookup
// =============================================================================

/// Criteria for locating the VM backing an orchestrator node
#[derive(Debug, Clone, Copy)]
pub enum VmFilter<'a> {
    /// VM name equal to the node name, or the node name's first label
    Name(&'a str),
    /// SMBIOS uuid of the VM
    Uuid(&'a str),
    /// Both of the above must match
    NameAndUuid { name: &'a str, uuid: &'a str },
}

impl VmFilter<'_> {
    fn name(&self) -> Option<&str> {
        match self {
            VmFilter::Name(name) | VmFilter::NameAndUuid { name, .. } => Some(*name),
            VmFilter::Uuid(_) => None,
        }
    }

    fn uuid(&self) -> Option<&str> {
        match self {
            VmFilter::Uuid(uuid) | VmFilter::NameAndUuid { uuid, .. } => Some(*uuid),
            VmFilter::Name(_) => None,
        }
    }
}

/// Where a VM lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmLocation {
    pub region: String,
    pub node: String,
    pub vmid: u32,
    pub name: String,
}

/// Node name matches a VM name exactly or by its first DNS label
fn name_matches(node_name: &str, vm_name: &str) -> bool {
    node_name == vm_name
        || node_name
            .strip_prefix(vm_name)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// Extract `uuid=<value>` from an `smbios1` config entry
fn smbios_uuid(smbios: &str) -> Option<&str> {
    smbios
        .split(',')
        .find_map(|part| part.strip_prefix("uuid="))
}

// =============================================================================
// Pool
// =============================================================================

/// Registry of cluster clients keyed by region
#[derive(Debug)]
pub struct ClusterPool {
    clients: BTreeMap<String, HypervisorApiRef>,
}

impl ClusterPool {
    /// Build REST clients for every configured cluster
    pub fn new(config: &ClustersConfig) -> Result<Self> {
        let clients = config
            .clusters
            .iter()
            .map(|cluster| PveClient::new(cluster).map(|c| Arc::new(c) as HypervisorApiRef))
            .collect::<Result<Vec<_>>>()?;

        Self::from_clients(clients)
    }

    /// Build a pool over existing clients
    pub fn from_clients(clients: Vec<HypervisorApiRef>) -> Result<Self> {
        if clients.is_empty() {
            return Err(Error::ClustersNotFound);
        }

        let mut by_region = BTreeMap::new();
        for client in clients {
            let region = client.region().to_string();
            if by_region.insert(region.clone(), client).is_some() {
                return Err(Error::Configuration(format!(
                    "region {} is configured more than once",
                    region
                )));
            }
        }

        Ok(Self { clients: by_region })
    }

    /// Client for a region
    pub fn get(&self, region: &str) -> Result<HypervisorApiRef> {
        self.clients
            .get(region)
            .cloned()
            .ok_or_else(|| Error::RegionNotFound {
                region: region.to_string(),
            })
    }

    pub fn regions(&self) -> impl Iterator<Item = &str> {
        self.clients.keys().map(String::as_str)
    }

    /// Whether the region's client holds privileged credentials
    pub fn is_privileged(&self, region: &str) -> Result<bool> {
        Ok(self.get(region)?.is_privileged())
    }

    /// Verify every cluster answers version, status and resource calls.
    /// Clusters are probed concurrently.
    pub async fn check_all(&self) -> Result<()> {
        try_join_all(self.clients.values().map(|client| Self::check(client.as_ref()))).await?;
        Ok(())
    }

    async fn check(client: &dyn HypervisorApi) -> Result<()> {
        let region = client.region();
        let version = client.version().await?;
        let members = client.cluster_status().await?;
        let vms = client.cluster_resources(ResourceKind::Vm).await?;

        if vms.is_empty() {
            warn!(
                "Cluster {} lists no VMs; check the permissions of the configured credentials",
                region
            );
        }

        info!(
            "Cluster {} reachable: version {}, {} status entries, {} VMs",
            region,
            version.version,
            members.len(),
            vms.len()
        );
        Ok(())
    }

    /// Locate a VM across every cluster
    pub async fn find_vm(&self, filter: VmFilter<'_>) -> Result<VmLocation> {
        for client in self.clients.values() {
            if let Some(location) = Self::find_vm_in(client.as_ref(), filter).await? {
                return Ok(location);
            }
        }

        let name = filter.name().or(filter.uuid()).unwrap_or_default();
        Err(Error::not_found("VM", name))
    }

    pub async fn find_vm_by_name(&self, name: &str) -> Result<VmLocation> {
        self.find_vm(VmFilter::Name(name)).await
    }

    pub async fn find_vm_by_uuid(&self, uuid: &str) -> Result<VmLocation> {
        self.find_vm(VmFilter::Uuid(uuid)).await
    }

    /// Locate a VM within one cluster
    pub async fn find_vm_in(
        client: &dyn HypervisorApi,
        filter: VmFilter<'_>,
    ) -> Result<Option<VmLocation>> {
        let resources = client.cluster_resources(ResourceKind::Vm).await?;

        for resource in resources.iter().filter(|r| r.kind == "qemu") {
            let (Some(vmid), Some(vm_name)) = (resource.vmid, resource.name.as_deref()) else {
                continue;
            };

            if let Some(name) = filter.name() {
                if !name_matches(name, vm_name) {
                    continue;
                }
            }

            if let Some(uuid) = filter.uuid() {
                let config = client.vm_config(&resource.node, vmid).await?;
                let found = config.get("smbios1").and_then(|s| smbios_uuid(s));
                if !found.is_some_and(|found| found.eq_ignore_ascii_case(uuid)) {
                    continue;
                }
            }

            return Ok(Some(VmLocation {
                region: client.region().to_string(),
                node: resource.node.clone(),
                vmid,
                name: vm_name.to_string(),
            }));
        }

        Ok(None)
    }

    /// VM that currently has the volume's disk attached, if any.
    /// The provisioning VM does not count as an owner.
    pub async fn find_disk_owner(&self, volume: &VolumeId) -> Result<Option<VmLocation>> {
        let client = self.get(volume.region())?;
        let volid = volume.volid();

        let resources = client.cluster_resources(ResourceKind::Vm).await?;
        for resource in resources.iter().filter(|r| r.kind == "qemu") {
            let Some(vmid) = resource.vmid else {
                continue;
            };
            if vmid == PROVISIONING_VM_ID {
                continue;
            }
            if !volume.is_shared() && resource.node != volume.node() {
                continue;
            }

            let config = client.vm_config(&resource.node, vmid).await?;
            let attached = config
                .values()
                .any(|value| value.split(',').next() == Some(volid.as_str()));

            if attached {
                debug!("Disk {} is attached to VM {}", volid, vmid);
                return Ok(Some(VmLocation {
                    region: volume.region().to_string(),
                    node: resource.node.clone(),
                    vmid,
                    name: resource.name.clone().unwrap_or_default(),
                }));
            }
        }

        Ok(None)
    }
}

/// Poll a hypervisor task until it stops.
///
/// A task that stops with an exit status other than `OK` fails with
/// [`Error::TaskFailed`]; running past `timeout` fails with
/// [`Error::Timeout`].
pub async fn wait_for_task(
    client: &dyn HypervisorApi,
    node: &str,
    upid: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;

    while Instant::now() <= deadline {
        let status = client.task_status(node, upid).await?;
        if !status.is_running() {
            if status.is_ok() {
                return Ok(());
            }
            return Err(Error::TaskFailed {
                upid: upid.to_string(),
                status: status.exitstatus.unwrap_or(status.status),
            });
        }

        sleep(poll_interval).await;
    }

    Err(Error::Timeout {
        action: "task completion".to_string(),
        resource: upid.to_string(),
    })
}
