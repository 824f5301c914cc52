//! Protocol Messages
//!
//! Request and response bodies of the Identity, Controller and Node roles.
//! Field names follow the protocol's camelCase JSON mapping; every field is
//! optional on the wire and defaults when absent.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Well-known Keys
// =============================================================================

/// Publish context key carrying the device path to the node
pub const PUBLISH_DEVICE_PATH: &str = "DevicePath";

/// Volume context key carrying the device path recorded at create time
pub const CONTEXT_SUB_PATH: &str = "subPath";

/// Driver-specific region label
pub const LABEL_REGION: &str = "topology.pve.billyronks.io/region";
/// Driver-specific zone label
pub const LABEL_ZONE: &str = "topology.pve.billyronks.io/zone";
/// Generic orchestrator region label
pub const LABEL_K8S_REGION: &str = "topology.kubernetes.io/region";
/// Generic orchestrator zone label
pub const LABEL_K8S_ZONE: &str = "topology.kubernetes.io/zone";
/// Node the volume is pinned to
pub const LABEL_NODE: &str = "topology.pve.billyronks.io/node";
/// Node label overriding the attachable volume limit
pub const LABEL_MAX_VOLUMES: &str = "csi.pve.billyronks.io/max-volumes";

// =============================================================================
// Capabilities
// =============================================================================

/// Volume access modes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessMode {
    #[default]
    Unknown,
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
    SingleNodeSingleWriter,
    SingleNodeMultiWriter,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VolumeAccessMode {
    pub mode: AccessMode,
}

/// Filesystem access
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MountVolume {
    pub fs_type: String,
    pub mount_flags: Vec<String>,
}

/// Raw block access
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockVolume {}

/// How a volume will be accessed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VolumeCapability {
    pub access_mode: VolumeAccessMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount: Option<MountVolume>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block: Option<BlockVolume>,
}

impl VolumeCapability {
    /// Filesystem volume with the given access mode and type
    pub fn mount(mode: AccessMode, fs_type: &str) -> Self {
        Self {
            access_mode: VolumeAccessMode { mode },
            mount: Some(MountVolume {
                fs_type: fs_type.to_string(),
                mount_flags: Vec::new(),
            }),
            block: None,
        }
    }

    /// Raw block volume with the given access mode
    pub fn block(mode: AccessMode) -> Self {
        Self {
            access_mode: VolumeAccessMode { mode },
            mount: None,
            block: Some(BlockVolume {}),
        }
    }

    pub fn mode(&self) -> AccessMode {
        self.access_mode.mode
    }

    pub fn is_block(&self) -> bool {
        self.block.is_some()
    }

    /// Requested filesystem type, empty when unspecified
    pub fn fs_type(&self) -> &str {
        self.mount.as_ref().map(|m| m.fs_type.as_str()).unwrap_or("")
    }

    pub fn mount_flags(&self) -> &[String] {
        self.mount
            .as_ref()
            .map(|m| m.mount_flags.as_slice())
            .unwrap_or(&[])
    }
}

/// Controller RPCs this driver offers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerCapability {
    CreateDeleteVolume,
    PublishUnpublishVolume,
    GetCapacity,
    ExpandVolume,
    GetVolume,
}

/// Node RPCs this driver offers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeCapability {
    StageUnstageVolume,
    ExpandVolume,
    GetVolumeStats,
}

/// Plugin-wide capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginCapability {
    ControllerService,
    VolumeAccessibilityConstraints,
    ExpandOnline,
}

// =============================================================================
// Volumes and Topology
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CapacityRange {
    pub required_bytes: u64,
    pub limit_bytes: u64,
}

/// Topology segments, e.g. `{"topology.kubernetes.io/region": "region-1"}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Topology {
    pub segments: BTreeMap<String, String>,
}

impl Topology {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.segments
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Region, preferring the driver-specific label
    pub fn region(&self) -> Option<&str> {
        self.get(LABEL_REGION).or_else(|| self.get(LABEL_K8S_REGION))
    }

    /// Zone, preferring the driver-specific label
    pub fn zone(&self) -> Option<&str> {
        self.get(LABEL_ZONE).or_else(|| self.get(LABEL_K8S_ZONE))
    }

    pub fn node(&self) -> Option<&str> {
        self.get(LABEL_NODE)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TopologyRequirement {
    pub requisite: Vec<Topology>,
    pub preferred: Vec<Topology>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Volume {
    pub capacity_bytes: u64,
    pub volume_id: String,
    pub volume_context: BTreeMap<String, String>,
    pub accessible_topology: Vec<Topology>,
}

// =============================================================================
// Identity
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GetPluginInfoResponse {
    pub name: String,
    pub vendor_version: String,
    pub manifest: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GetPluginCapabilitiesResponse {
    pub capabilities: Vec<PluginCapability>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProbeResponse {
    pub ready: bool,
}

/// Body of calls that carry no fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

// =============================================================================
// Controller
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CreateVolumeRequest {
    pub name: String,
    pub capacity_range: Option<CapacityRange>,
    pub volume_capabilities: Vec<VolumeCapability>,
    pub parameters: BTreeMap<String, String>,
    pub accessibility_requirements: Option<TopologyRequirement>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CreateVolumeResponse {
    pub volume: Volume,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeleteVolumeRequest {
    pub volume_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ControllerPublishVolumeRequest {
    pub volume_id: String,
    pub node_id: String,
    pub volume_capability: Option<VolumeCapability>,
    pub readonly: bool,
    pub volume_context: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ControllerPublishVolumeResponse {
    pub publish_context: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ControllerUnpublishVolumeRequest {
    pub volume_id: String,
    pub node_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GetCapacityRequest {
    pub volume_capabilities: Vec<VolumeCapability>,
    pub parameters: BTreeMap<String, String>,
    pub accessible_topology: Option<Topology>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GetCapacityResponse {
    pub available_capacity: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ControllerGetCapabilitiesResponse {
    pub capabilities: Vec<ControllerCapability>,
}

// =============================================================================
// Node
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeStageVolumeRequest {
    pub volume_id: String,
    pub publish_context: BTreeMap<String, String>,
    pub staging_target_path: String,
    pub volume_capability: Option<VolumeCapability>,
    pub volume_context: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeUnstageVolumeRequest {
    pub volume_id: String,
    pub staging_target_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodePublishVolumeRequest {
    pub volume_id: String,
    pub publish_context: BTreeMap<String, String>,
    pub staging_target_path: String,
    pub target_path: String,
    pub volume_capability: Option<VolumeCapability>,
    pub readonly: bool,
    pub volume_context: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeUnpublishVolumeRequest {
    pub volume_id: String,
    pub target_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeGetVolumeStatsRequest {
    pub volume_id: String,
    pub volume_path: String,
    pub staging_target_path: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UsageUnit {
    #[default]
    Unknown,
    Bytes,
    Inodes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VolumeUsage {
    pub available: u64,
    pub total: u64,
    pub used: u64,
    pub unit: UsageUnit,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeGetVolumeStatsResponse {
    pub usage: Vec<VolumeUsage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeExpandVolumeRequest {
    pub volume_id: String,
    pub volume_path: String,
    pub capacity_range: Option<CapacityRange>,
    pub staging_target_path: String,
    pub volume_capability: Option<VolumeCapability>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeExpandVolumeResponse {
    pub capacity_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeGetInfoResponse {
    pub node_id: String,
    pub max_volumes_per_node: u64,
    pub accessible_topology: Option<Topology>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeGetCapabilitiesResponse {
    pub capabilities: Vec<NodeCapability>,
}

// =============================================================================
// Errors
// =============================================================================

/// Error body returned with a non-success status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}
