//! Node Service
//!
//! Host-local half of the volume lifecycle: staging a published disk at a
//! node-wide path, bind-mounting it into workloads, reporting usage and
//! growing the filesystem after the disk was enlarged.

use super::device::DeviceResolver;
use super::types::*;
use crate::domain::ports::{KubeApiRef, MounterRef};
use crate::error::{Error, Result};
use crate::volume::StorageParameters;
use std::collections::BTreeMap;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use tracing::{debug, info};

/// Filesystem used when the capability names none
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// Attachable volumes per node without a label override
pub const DEFAULT_MAX_VOLUMES: u64 = 24;

/// Upper bound of the per-node override
pub const MAX_VOLUMES_LIMIT: u64 = 30;

/// Attachable volume count from the node's labels
pub fn max_volumes(labels: &BTreeMap<String, String>) -> u64 {
    labels
        .get(LABEL_MAX_VOLUMES)
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|v| (1..=MAX_VOLUMES_LIMIT as i64).contains(v))
        .map(|v| v as u64)
        .unwrap_or(DEFAULT_MAX_VOLUMES)
}

fn label<'a>(labels: &'a BTreeMap<String, String>, keys: [&str; 2]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| labels.get(*key))
        .map(String::as_str)
        .find(|value| !value.is_empty())
}

fn require<'a>(value: &'a str, what: &str) -> Result<&'a str> {
    if value.is_empty() {
        return Err(Error::invalid(format!("{} is required", what)));
    }
    Ok(value)
}

fn require_device_path(publish_context: &BTreeMap<String, String>) -> Result<&str> {
    publish_context
        .get(PUBLISH_DEVICE_PATH)
        .map(String::as_str)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| Error::invalid(format!("{} is required in publish context", PUBLISH_DEVICE_PATH)))
}

/// Node role of the driver
pub struct NodeService {
    node_id: String,
    kube: KubeApiRef,
    mounter: MounterRef,
    devices: DeviceResolver,
}

impl NodeService {
    pub fn new(
        node_id: impl Into<String>,
        kube: KubeApiRef,
        mounter: MounterRef,
        devices: DeviceResolver,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            kube,
            mounter,
            devices,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn node_stage_volume(&self, request: NodeStageVolumeRequest) -> Result<()> {
        require(&request.volume_id, "volume id")?;
        let staging = require(&request.staging_target_path, "staging target path")?;
        let capability = request
            .volume_capability
            .as_ref()
            .ok_or_else(|| Error::invalid("volume capability is required"))?;
        let device_path = require_device_path(&request.publish_context)?;

        if capability.is_block() {
            debug!("Volume {} is a block volume, nothing to stage", request.volume_id);
            return Ok(());
        }

        let staging = Path::new(staging);
        if self.mounter.is_mount_point(staging).await? {
            debug!("Volume {} already staged at {}", request.volume_id, staging.display());
            return Ok(());
        }

        let params = StorageParameters::from_map(&request.volume_context)?;
        let fs_type = match capability.fs_type() {
            "" => DEFAULT_FS_TYPE,
            fs_type => fs_type,
        };

        let mut options: Vec<String> = capability.mount_flags().to_vec();
        for option in params.mount_options() {
            if !options.contains(&option) {
                options.push(option);
            }
        }
        if fs_type == "xfs" && !options.iter().any(|o| o == "nouuid") {
            options.push("nouuid".to_string());
        }

        let device = self.devices.resolve(device_path).await?;
        tokio::fs::create_dir_all(staging).await?;

        info!(
            "Staging volume {} from {} at {} ({})",
            request.volume_id,
            device,
            staging.display(),
            fs_type
        );
        self.mounter
            .format_and_mount(&device, staging, fs_type, &options, &params.mkfs_args(fs_type))
            .await
    }

    pub async fn node_unstage_volume(&self, request: NodeUnstageVolumeRequest) -> Result<()> {
        require(&request.volume_id, "volume id")?;
        let staging = require(&request.staging_target_path, "staging target path")?;

        info!("Unstaging volume {} from {}", request.volume_id, staging);
        self.mounter.unmount(Path::new(staging)).await
    }

    pub async fn node_publish_volume(&self, request: NodePublishVolumeRequest) -> Result<()> {
        require(&request.volume_id, "volume id")?;
        let capability = request
            .volume_capability
            .as_ref()
            .ok_or_else(|| Error::invalid("volume capability is required"))?;

        let mode = capability.mode();
        if !matches!(
            mode,
            AccessMode::SingleNodeWriter | AccessMode::SingleNodeReaderOnly
        ) {
            return Err(Error::invalid(format!("access mode {:?} is not supported", mode)));
        }

        let staging = require(&request.staging_target_path, "staging target path")?;
        let target = require(&request.target_path, "target path")?;
        require_device_path(&request.publish_context)?;

        if capability.is_block() {
            return Err(Error::Unimplemented("NodePublishVolume for block volumes".to_string()));
        }

        let target = Path::new(target);
        if self.mounter.is_mount_point(target).await? {
            debug!("Volume {} already published at {}", request.volume_id, target.display());
            return Ok(());
        }

        let readonly = request.readonly || mode == AccessMode::SingleNodeReaderOnly;
        let mut options = vec![
            "bind".to_string(),
            if readonly { "ro" } else { "rw" }.to_string(),
        ];
        options.extend(capability.mount_flags().iter().cloned());

        tokio::fs::create_dir_all(target).await?;

        info!("Publishing volume {} at {}", request.volume_id, target.display());
        self.mounter.mount(staging, target, None, &options).await
    }

    pub async fn node_unpublish_volume(&self, request: NodeUnpublishVolumeRequest) -> Result<()> {
        require(&request.volume_id, "volume id")?;
        let target = Path::new(require(&request.target_path, "target path")?);

        info!("Unpublishing volume {} from {}", request.volume_id, target.display());
        self.mounter.unmount(target).await?;

        if let Err(e) = tokio::fs::remove_dir(target).await {
            debug!("Leaving {} in place: {}", target.display(), e);
        }
        Ok(())
    }

    pub async fn node_get_volume_stats(
        &self,
        request: NodeGetVolumeStatsRequest,
    ) -> Result<NodeGetVolumeStatsResponse> {
        require(&request.volume_id, "volume id")?;
        let path = Path::new(require(&request.volume_path, "volume path")?);

        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found("volume path", path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        if metadata.file_type().is_block_device() {
            let total = self.mounter.block_device_size(&request.volume_path).await?;
            return Ok(NodeGetVolumeStatsResponse {
                usage: vec![VolumeUsage {
                    total,
                    unit: UsageUnit::Bytes,
                    ..Default::default()
                }],
            });
        }

        let stats = self.mounter.filesystem_stats(path).await?;
        Ok(NodeGetVolumeStatsResponse {
            usage: vec![
                VolumeUsage {
                    available: stats.available_bytes,
                    total: stats.total_bytes,
                    used: stats.used_bytes,
                    unit: UsageUnit::Bytes,
                },
                VolumeUsage {
                    available: stats.free_inodes,
                    total: stats.total_inodes,
                    used: stats.used_inodes,
                    unit: UsageUnit::Inodes,
                },
            ],
        })
    }

    pub async fn node_expand_volume(
        &self,
        request: NodeExpandVolumeRequest,
    ) -> Result<NodeExpandVolumeResponse> {
        require(&request.volume_id, "volume id")?;
        let path = Path::new(require(&request.volume_path, "volume path")?);
        let required = request
            .capacity_range
            .as_ref()
            .map(|r| r.required_bytes)
            .unwrap_or(0);

        let device = self
            .mounter
            .device_for_mount(path)
            .await?
            .ok_or_else(|| Error::not_found("mount", path.display().to_string()))?;

        self.devices.rescan(&device).await?;

        let size = self.mounter.block_device_size(&device).await?;
        if size < required {
            return Err(Error::Internal(format!(
                "device {} reports {} bytes after rescan, {} requested",
                device, size, required
            )));
        }

        let is_block = request
            .volume_capability
            .as_ref()
            .is_some_and(VolumeCapability::is_block);
        if !is_block {
            self.mounter.resize_filesystem(&device, path).await?;
        }

        info!("Expanded volume {} to {} bytes", request.volume_id, size);
        Ok(NodeExpandVolumeResponse {
            capacity_bytes: size,
        })
    }

    pub async fn node_get_info(&self) -> Result<NodeGetInfoResponse> {
        let node = self
            .kube
            .get_node(&self.node_id)
            .await?
            .ok_or_else(|| Error::not_found("Node", &self.node_id))?;
        let labels = node.metadata.labels.unwrap_or_default();

        let region = label(&labels, [LABEL_REGION, LABEL_K8S_REGION]).ok_or_else(|| {
            Error::FailedPrecondition(format!("node {} has no region label", self.node_id))
        })?;
        let zone = label(&labels, [LABEL_ZONE, LABEL_K8S_ZONE]).ok_or_else(|| {
            Error::FailedPrecondition(format!("node {} has no zone label", self.node_id))
        })?;

        Ok(NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: max_volumes(&labels),
            accessible_topology: Some(Topology {
                segments: BTreeMap::from([
                    (LABEL_REGION.to_string(), region.to_string()),
                    (LABEL_ZONE.to_string(), zone.to_string()),
                ]),
            }),
        })
    }

    pub fn node_get_capabilities(&self) -> NodeGetCapabilitiesResponse {
        NodeGetCapabilitiesResponse {
            capabilities: vec![
                NodeCapability::StageUnstageVolume,
                NodeCapability::ExpandVolume,
                NodeCapability::GetVolumeStats,
            ],
        }
    }
}
