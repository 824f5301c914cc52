//! Controller Service
//!
//! Volume lifecycle calls that run once per cluster: create, delete,
//! publish and capacity. Disk mutations are serialized per volume id.

use super::lock::ResourceLock;
use super::types::*;
use crate::cluster::{ClusterPool, VmFilter};
use crate::domain::ports::{DiskRequest, HypervisorApi, ResourceKind};
use crate::error::{Error, Result};
use crate::volume::{provisioned_disk_name, StorageParameters, VolumeId, PROVISIONING_VM_ID};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Sizing
// =============================================================================

const GIB: u64 = 1024 * 1024 * 1024;

/// Size of a volume created without a capacity range
pub const DEFAULT_VOLUME_SIZE: u64 = 10 * GIB;

/// Resolve the capacity range to a whole number of GiB
pub fn requested_size(range: Option<&CapacityRange>) -> Result<u64> {
    let (required, limit) = range
        .map(|r| (r.required_bytes, r.limit_bytes))
        .unwrap_or((0, 0));

    if required == 0 {
        if limit > 0 && limit < DEFAULT_VOLUME_SIZE {
            let size = limit / GIB * GIB;
            if size == 0 {
                return Err(Error::invalid(format!(
                    "limit of {} bytes is below the 1GiB allocation unit",
                    limit
                )));
            }
            return Ok(size);
        }
        return Ok(DEFAULT_VOLUME_SIZE);
    }

    let size = required
        .div_ceil(GIB)
        .checked_mul(GIB)
        .ok_or_else(|| Error::invalid(format!("required {} bytes is too large", required)))?;
    if limit > 0 && size > limit {
        return Err(Error::invalid(format!(
            "required {} bytes rounds up to {} bytes, above the limit of {}",
            required, size, limit
        )));
    }

    Ok(size)
}

// =============================================================================
// Placement
// =============================================================================

/// Placement labels gathered from the topology requirement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placement {
    pub region: Option<String>,
    pub zone: Option<String>,
    pub node: Option<String>,
}

impl Placement {
    fn complete(&self) -> bool {
        self.region.is_some() && (self.zone.is_some() || self.node.is_some())
    }

    fn absorb(&mut self, topology: &Topology) {
        if self.region.is_none() {
            self.region = topology.region().map(str::to_string);
        }
        if self.zone.is_none() {
            self.zone = topology.zone().map(str::to_string);
        }
        if self.node.is_none() {
            self.node = topology.node().map(str::to_string);
        }
    }

    /// Collect labels field by field: each field takes the first non-empty
    /// value among the preferred entries, then among the requisite ones.
    pub fn resolve(requirement: Option<&TopologyRequirement>) -> Self {
        let mut placement = Self::default();
        let Some(requirement) = requirement else {
            return placement;
        };

        for topology in requirement
            .preferred
            .iter()
            .chain(requirement.requisite.iter())
        {
            placement.absorb(topology);
            if placement.complete() {
                break;
            }
        }

        placement
    }

    /// Node the disk lands on, empty when unconstrained
    pub fn zone(&self) -> &str {
        self.zone
            .as_deref()
            .or(self.node.as_deref())
            .unwrap_or_default()
    }
}

fn topology_for(volume: &VolumeId) -> Topology {
    let mut segments = BTreeMap::from([(LABEL_REGION.to_string(), volume.region().to_string())]);
    if !volume.is_shared() {
        segments.insert(LABEL_ZONE.to_string(), volume.zone().to_string());
    }
    Topology { segments }
}

async fn first_online_node(client: &dyn HypervisorApi) -> Result<String> {
    client
        .cluster_status()
        .await?
        .into_iter()
        .find(|member| member.kind == "node" && member.online)
        .map(|member| member.name)
        .ok_or_else(|| {
            Error::FailedPrecondition(format!("region {} has no online node", client.region()))
        })
}

// =============================================================================
// Controller Service
// =============================================================================

/// Controller role of the driver
pub struct ControllerService {
    pool: Arc<ClusterPool>,
    locks: ResourceLock,
}

impl ControllerService {
    pub fn new(pool: Arc<ClusterPool>) -> Self {
        Self {
            pool,
            locks: ResourceLock::new(),
        }
    }

    pub fn pool(&self) -> &ClusterPool {
        &self.pool
    }

    pub async fn create_volume(&self, request: CreateVolumeRequest) -> Result<CreateVolumeResponse> {
        if request.name.is_empty() {
            return Err(Error::invalid("volume name is required"));
        }
        if request.volume_capabilities.is_empty() {
            return Err(Error::invalid("volume capabilities are required"));
        }

        let params = StorageParameters::from_map(&request.parameters)?;
        if params.storage.is_empty() {
            return Err(Error::invalid("parameter storage is required"));
        }

        let size = requested_size(request.capacity_range.as_ref())?;
        let placement = Placement::resolve(request.accessibility_requirements.as_ref());
        let region = placement
            .region
            .clone()
            .ok_or_else(|| Error::invalid("topology region is required"))?;
        let client = self.pool.get(&region)?;

        let node = match placement.zone() {
            "" => first_online_node(client.as_ref()).await?,
            zone => zone.to_string(),
        };

        let status = client
            .storage_status(&node, &params.storage)
            .await
            .map_err(|e| Error::invalid(e.to_string()))?;

        let zone = if status.shared {
            ""
        } else if placement.zone().is_empty() {
            return Err(Error::invalid(format!(
                "storage {} is local to each node, a zone is required",
                params.storage
            )));
        } else {
            node.as_str()
        };

        let volume = VolumeId::with_format(
            &region,
            zone,
            &params.storage,
            &provisioned_disk_name(&request.name),
            params.format(),
        );
        let key = volume.to_string();

        let guard = self.locks.lock(&key).await;

        let existing = client
            .storage_content(&node, &params.storage)
            .await
            .map_err(|e| Error::invalid(e.to_string()))?
            .into_iter()
            .find(|content| content.volid == volume.volid());

        match existing {
            Some(content) if content.size == size => {
                debug!("Volume {} already exists", key);
            }
            Some(content) => {
                return Err(Error::Conflict(format!(
                    "volume {} exists with size {}, requested {}",
                    key, content.size, size
                )));
            }
            None => {
                info!("Creating volume {} ({} bytes) on node {}", key, size, node);

                let disk = DiskRequest {
                    vmid: PROVISIONING_VM_ID,
                    filename: volume.filename().to_string(),
                    size_bytes: size,
                    format: params.format.clone(),
                };
                client
                    .create_disk(&node, &params.storage, &disk)
                    .await
                    .map_err(|e| Error::invalid(e.to_string()))?;
            }
        }

        self.locks.unlock(guard);

        let mut volume_context = params.to_map();
        volume_context.insert(CONTEXT_SUB_PATH.to_string(), volume.device_path());

        Ok(CreateVolumeResponse {
            volume: Volume {
                capacity_bytes: size,
                volume_id: key,
                volume_context,
                accessible_topology: vec![topology_for(&volume)],
            },
        })
    }

    pub async fn delete_volume(&self, request: DeleteVolumeRequest) -> Result<()> {
        if request.volume_id.is_empty() {
            return Err(Error::invalid("volume id is required"));
        }

        let volume = VolumeId::parse_compat(&request.volume_id)?;
        let client = self.pool.get(volume.region())?;

        let internal = |e: Error| Error::Internal(format!("delete {}: {}", request.volume_id, e));

        let node = match volume.node() {
            "" => first_online_node(client.as_ref()).await.map_err(internal)?,
            node => node.to_string(),
        };

        let storages = if volume.storage().is_empty() {
            client
                .cluster_resources(ResourceKind::Storage)
                .await
                .map_err(internal)?
                .into_iter()
                .filter(|r| r.node == node)
                .filter_map(|r| r.storage)
                .collect()
        } else {
            vec![volume.storage().to_string()]
        };

        // Keyed by the canonical id, the same key create uses
        for storage in storages {
            let mut candidate = volume.clone();
            candidate.set_storage(storage.as_str());
            let _guard = self.locks.lock(&candidate.to_string()).await;

            let volid = candidate.volid();
            let contents = match client.storage_content(&node, &storage).await {
                Ok(contents) => contents,
                Err(e) if e.is_not_found() || e.is_parameter_verification() => continue,
                Err(e) => return Err(internal(e)),
            };

            if contents.iter().any(|c| c.volid == volid) {
                info!("Deleting volume {} ({})", request.volume_id, volid);
                client
                    .delete_disk(&node, &storage, &volid)
                    .await
                    .map_err(internal)?;
                return Ok(());
            }
        }

        debug!("Volume {} is already gone", request.volume_id);
        Ok(())
    }

    pub async fn controller_publish_volume(
        &self,
        request: ControllerPublishVolumeRequest,
    ) -> Result<ControllerPublishVolumeResponse> {
        if request.volume_id.is_empty() {
            return Err(Error::invalid("volume id is required"));
        }
        if request.node_id.is_empty() {
            return Err(Error::invalid("node id is required"));
        }
        if request.volume_capability.is_none() {
            return Err(Error::invalid("volume capability is required"));
        }
        if request.readonly {
            return Err(Error::invalid("readonly volumes are not supported"));
        }

        let volume = VolumeId::parse_compat(&request.volume_id)?;
        let client = self.pool.get(volume.region())?;

        let vm = ClusterPool::find_vm_in(client.as_ref(), VmFilter::Name(&request.node_id))
            .await?
            .ok_or_else(|| Error::not_found("VM", &request.node_id))?;
        debug!(
            "Publishing {} to VM {} on {}",
            request.volume_id, vm.vmid, vm.node
        );

        let device_path = request
            .volume_context
            .get(CONTEXT_SUB_PATH)
            .filter(|p| !p.is_empty())
            .cloned()
            .unwrap_or_else(|| volume.device_path());

        Ok(ControllerPublishVolumeResponse {
            publish_context: BTreeMap::from([(PUBLISH_DEVICE_PATH.to_string(), device_path)]),
        })
    }

    pub async fn controller_unpublish_volume(
        &self,
        request: ControllerUnpublishVolumeRequest,
    ) -> Result<()> {
        if request.volume_id.is_empty() {
            return Err(Error::invalid("volume id is required"));
        }
        if request.node_id.is_empty() {
            return Err(Error::invalid("node id is required"));
        }

        VolumeId::parse_compat(&request.volume_id)?;
        Ok(())
    }

    pub async fn get_capacity(&self, request: GetCapacityRequest) -> Result<GetCapacityResponse> {
        let topology = request
            .accessible_topology
            .as_ref()
            .ok_or_else(|| Error::invalid("accessible topology is required"))?;
        let region = topology
            .region()
            .ok_or_else(|| Error::invalid("topology region is required"))?;
        let zone = topology
            .zone()
            .or(topology.node())
            .ok_or_else(|| Error::invalid("topology zone is required"))?;
        let storage = request
            .parameters
            .get("storage")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::invalid("parameter storage is required"))?;

        let client = self.pool.get(region)?;
        let available_capacity = match client.storage_status(zone, storage).await {
            Ok(status) => status.avail,
            Err(e) if e.is_parameter_verification() => {
                warn!("Storage {} is not available on {}/{}", storage, region, zone);
                0
            }
            Err(e) => return Err(Error::invalid(e.to_string())),
        };

        Ok(GetCapacityResponse { available_capacity })
    }

    pub fn controller_get_capabilities(&self) -> ControllerGetCapabilitiesResponse {
        ControllerGetCapabilitiesResponse {
            capabilities: vec![
                ControllerCapability::CreateDeleteVolume,
                ControllerCapability::PublishUnpublishVolume,
                ControllerCapability::GetCapacity,
                ControllerCapability::ExpandVolume,
                ControllerCapability::GetVolume,
            ],
        }
    }
}

/// Controller calls the driver does not offer
pub const UNIMPLEMENTED_CONTROLLER_CALLS: &[&str] = &[
    "ValidateVolumeCapabilities",
    "ListVolumes",
    "CreateSnapshot",
    "DeleteSnapshot",
    "ListSnapshots",
    "ControllerExpandVolume",
    "ControllerGetVolume",
];
