//! Volume Identifier Codec
//!
//! A volume is addressed by the composite key `region/zone/storage/disk`.
//! The string form is what the container orchestrator stores as the volume
//! handle, so it is the only record tying a logical volume to the physical
//! disk. An empty zone marks a volume on storage shared by every node of
//! the region (`region//storage/disk`).
//!
//! The disk segment may carry a numeric folder (the owning VM id) and a
//! format suffix, e.g. `9999/vm-9999-pvc-1.qcow2`.

use crate::error::{Error, Result};
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

// =============================================================================
// Constants
// =============================================================================

/// VM id that owns every disk created by the driver
pub const PROVISIONING_VM_ID: u32 = 9999;

/// Prefix of the stable device path published to the node
pub const WWN_DEVICE_PREFIX: &str = "/dev/disk/by-id/wwn-0x";

/// Disk filename suffixes recognised as a format
const KNOWN_FORMATS: [&str; 3] = ["raw", "qcow2", "vmdk"];

static VM_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^|-|/)vm-([1-9][0-9]{2,8})(-|$)").expect("static vm id pattern")
});

// =============================================================================
// Volume Identifier
// =============================================================================

/// Composite key locating a volume across regions, nodes and storages
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct VolumeId {
    region: String,
    zone: String,
    storage: String,
    disk: String,
}

impl VolumeId {
    /// Build an identifier from its components
    pub fn new(
        region: impl Into<String>,
        zone: impl Into<String>,
        storage: impl Into<String>,
        disk: impl Into<String>,
    ) -> Self {
        Self {
            region: region.into(),
            zone: zone.into(),
            storage: storage.into(),
            disk: disk.into(),
        }
    }

    /// Build an identifier whose disk follows the on-disk naming convention.
    ///
    /// With a format the disk becomes `<vm-id>/<disk>.<format>`; without one
    /// the disk is kept as given. This is the only place that knows how a
    /// formatted disk is laid out on storage.
    pub fn with_format(
        region: impl Into<String>,
        zone: impl Into<String>,
        storage: impl Into<String>,
        disk: &str,
        format: &str,
    ) -> Self {
        let disk = if format.is_empty() {
            disk.to_string()
        } else {
            let vm_id = derive_vm_id(disk);
            if vm_id.is_empty() {
                format!("{}.{}", disk, format)
            } else {
                format!("{}/{}.{}", vm_id, disk, format)
            }
        };

        Self::new(region, zone, storage, disk)
    }

    /// Decode the canonical 4-segment form
    pub fn parse(id: &str) -> Result<Self> {
        let parts: Vec<&str> = id.splitn(4, '/').collect();
        if parts.len() != 4 {
            return Err(invalid_id(id, "expected region/zone/storage/disk"));
        }

        let volume = Self::new(parts[0], parts[1], parts[2], parts[3]);
        volume.validate(id)?;
        Ok(volume)
    }

    /// Decode either the canonical form or the legacy `region/zone/disk`
    /// form. Legacy identifiers come back with an empty storage name.
    pub fn parse_compat(id: &str) -> Result<Self> {
        let segments = id.split('/').count();
        if segments == 3 {
            let parts: Vec<&str> = id.split('/').collect();
            if parts[0].is_empty() || parts[2].is_empty() {
                return Err(invalid_id(id, "expected region/zone/disk"));
            }
            return Ok(Self::new(parts[0], parts[1], "", parts[2]));
        }

        Self::parse(id)
    }

    fn validate(&self, id: &str) -> Result<()> {
        if self.region.is_empty() {
            return Err(invalid_id(id, "region is empty"));
        }
        if self.storage.is_empty() {
            return Err(invalid_id(id, "storage is empty"));
        }
        if self.disk.is_empty() {
            return Err(invalid_id(id, "disk is empty"));
        }

        if let Some((folder, file)) = self.disk.split_once('/') {
            if folder.is_empty()
                || !folder.chars().all(|c| c.is_ascii_digit())
                || file.is_empty()
                || file.contains('/')
            {
                return Err(invalid_id(id, "disk folder must be a numeric vm id"));
            }
        }

        Ok(())
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Cluster alias, identical to the region
    pub fn cluster(&self) -> &str {
        &self.region
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    /// Node currently holding the disk; empty for shared volumes
    pub fn node(&self) -> &str {
        &self.zone
    }

    /// Re-home the identifier onto another node
    pub fn set_zone(&mut self, zone: impl Into<String>) {
        self.zone = zone.into();
    }

    pub fn storage(&self) -> &str {
        &self.storage
    }

    pub fn set_storage(&mut self, storage: impl Into<String>) {
        self.storage = storage.into();
    }

    pub fn disk(&self) -> &str {
        &self.disk
    }

    pub fn is_shared(&self) -> bool {
        self.zone.is_empty()
    }

    /// Numeric folder prefix of the disk, empty when absent
    pub fn folder(&self) -> &str {
        self.disk.split_once('/').map(|(folder, _)| folder).unwrap_or("")
    }

    /// Disk filename without the folder prefix
    pub fn filename(&self) -> &str {
        self.disk
            .split_once('/')
            .map(|(_, file)| file)
            .unwrap_or(&self.disk)
    }

    /// Format suffix of the disk (`raw`, `qcow2`, `vmdk`), empty if none
    pub fn format(&self) -> &str {
        match self.filename().rsplit_once('.') {
            Some((_, suffix)) if KNOWN_FORMATS.contains(&suffix) => suffix,
            _ => "",
        }
    }

    /// Owning VM id, empty when the disk does not follow the naming scheme
    pub fn vm_id(&self) -> String {
        derive_vm_id(&self.disk)
    }

    /// Orchestrator volume name embedded in the disk, empty when unknown
    pub fn claim_name(&self) -> String {
        derive_claim_name(&self.disk)
    }

    /// Hypervisor-native volume reference (`storage:disk`)
    pub fn volid(&self) -> String {
        format!("{}:{}", self.storage, self.disk)
    }

    /// Stable by-id device path for this disk.
    ///
    /// The WWN is a digest of the disk path, so it survives relocation of
    /// the disk to another node.
    pub fn device_path(&self) -> String {
        format!("{}{:016x}", WWN_DEVICE_PREFIX, fnv1a64(self.disk.as_bytes()))
    }

    /// Sibling identifier for a new disk name, keeping region, zone,
    /// storage, VM folder and format of this one.
    pub fn copy(&self, name: &str) -> Self {
        let format = self.format();
        let file = if format.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", name, format)
        };

        let disk = match self.folder() {
            "" => file,
            folder => format!("{}/{}", folder, file),
        };

        Self::new(&self.region, &self.zone, &self.storage, disk)
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.region, self.zone, self.storage, self.disk
        )
    }
}

impl FromStr for VolumeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// =============================================================================
// Disk Name Helpers
// =============================================================================

/// Extract the VM id from a `vm-<id>-...` disk name; empty when absent
pub fn derive_vm_id(disk: &str) -> String {
    VM_ID_PATTERN
        .captures(disk)
        .and_then(|caps| caps.get(2))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

/// Extract the orchestrator volume name from `vm-<id>-<name>[.<fmt>]`;
/// empty on malformed input
pub fn derive_claim_name(disk: &str) -> String {
    let parts: Vec<&str> = disk.splitn(3, '-').collect();
    if parts.len() != 3 {
        return String::new();
    }

    parts[2].split('.').next().unwrap_or_default().to_string()
}

/// Disk filename the driver uses for an orchestrator volume
pub fn provisioned_disk_name(name: &str) -> String {
    format!("vm-{}-{}", PROVISIONING_VM_ID, name)
}

fn invalid_id(id: &str, reason: &str) -> Error {
    Error::InvalidVolumeId {
        id: id.to_string(),
        reason: reason.to_string(),
    }
}

/// 64-bit FNV-1a digest
fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    bytes.iter().fold(OFFSET, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_and_display() {
        for id in [
            "region-1/pve-1/local-lvm/vm-9999-pvc-1",
            "region-1//ceph/vm-9999-pvc-2",
            "region-1/pve-2/local/9999/vm-9999-pvc-3.qcow2",
        ] {
            let volume = VolumeId::parse(id).unwrap();
            assert_eq!(volume.to_string(), id);
        }
    }

    #[test]
    fn test_parse_components() {
        let volume = VolumeId::parse("region-1/pve-2/local/9999/vm-9999-pvc-3.qcow2").unwrap();
        assert_eq!(volume.region(), "region-1");
        assert_eq!(volume.cluster(), "region-1");
        assert_eq!(volume.zone(), "pve-2");
        assert_eq!(volume.storage(), "local");
        assert_eq!(volume.disk(), "9999/vm-9999-pvc-3.qcow2");
        assert_eq!(volume.folder(), "9999");
        assert_eq!(volume.filename(), "vm-9999-pvc-3.qcow2");
        assert_eq!(volume.format(), "qcow2");
        assert_eq!(volume.vm_id(), "9999");
        assert_eq!(volume.claim_name(), "pvc-3");
        assert_eq!(volume.volid(), "local:9999/vm-9999-pvc-3.qcow2");
        assert!(!volume.is_shared());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_matches!(
            VolumeId::parse("region/storage/disk"),
            Err(Error::InvalidVolumeId { .. })
        );
        assert!(VolumeId::parse("").is_err());
        assert!(VolumeId::parse("region").is_err());
        assert!(VolumeId::parse("/zone/storage/disk").is_err());
        assert!(VolumeId::parse("region/zone//disk").is_err());
        assert!(VolumeId::parse("region/zone/storage/").is_err());
        assert!(VolumeId::parse("region/zone/storage/abc/vm-9999-x.raw").is_err());
        assert!(VolumeId::parse("region/zone/storage/1/2/disk").is_err());
    }

    #[test]
    fn test_parse_compat() {
        let legacy = VolumeId::parse_compat("region-1/pve-1/vm-9999-pvc-1").unwrap();
        assert_eq!(legacy.region(), "region-1");
        assert_eq!(legacy.zone(), "pve-1");
        assert_eq!(legacy.storage(), "");
        assert_eq!(legacy.disk(), "vm-9999-pvc-1");

        let canonical = VolumeId::parse_compat("region-1/pve-1/local-lvm/vm-9999-pvc-1").unwrap();
        assert_eq!(canonical.storage(), "local-lvm");

        assert!(VolumeId::parse_compat("region-1/vm-9999-pvc-1").is_err());
    }

    #[test]
    fn test_derive_vm_id() {
        assert_eq!(derive_vm_id("vm-1000-disk"), "1000");
        assert_eq!(derive_vm_id("9999/vm-9999-pvc-1.raw"), "9999");
        assert_eq!(derive_vm_id("base-100-disk-vm-123"), "123");
        assert_eq!(derive_vm_id("no-vm-marker"), "");
        assert_eq!(derive_vm_id("vm-12-disk"), "");
        assert_eq!(derive_vm_id("vm-0100-disk"), "");
    }

    #[test]
    fn test_derive_claim_name() {
        assert_eq!(derive_claim_name("vm-9999-pvc-123"), "pvc-123");
        assert_eq!(derive_claim_name("vm-9999-pvc-123.raw"), "pvc-123");
        assert_eq!(derive_claim_name("disk"), "");
        assert_eq!(derive_claim_name("vm-9999"), "");
    }

    #[test]
    fn test_with_format() {
        let plain = VolumeId::with_format("r1", "pve-1", "local-lvm", "vm-9999-pvc-1", "");
        assert_eq!(plain.to_string(), "r1/pve-1/local-lvm/vm-9999-pvc-1");

        let qcow = VolumeId::with_format("r1", "pve-1", "local", "vm-9999-pvc-1", "qcow2");
        assert_eq!(qcow.to_string(), "r1/pve-1/local/9999/vm-9999-pvc-1.qcow2");
        assert_eq!(qcow.format(), "qcow2");
    }

    #[test]
    fn test_copy_keeps_folder_and_format() {
        let source = VolumeId::parse("r1/pve-1/local/9999/vm-9999-pvc-1.raw").unwrap();
        let copy = source.copy("vm-9999-pvc-2");
        assert_eq!(copy.to_string(), "r1/pve-1/local/9999/vm-9999-pvc-2.raw");

        let source = VolumeId::parse("r1//ceph/vm-9999-pvc-1").unwrap();
        assert_eq!(source.copy("vm-9999-pvc-9").to_string(), "r1//ceph/vm-9999-pvc-9");
    }

    #[test]
    fn test_device_path_is_stable_across_zones() {
        let mut volume = VolumeId::parse("r1/pve-1/local-lvm/vm-9999-pvc-1").unwrap();
        let before = volume.device_path();
        volume.set_zone("pve-2");

        assert_eq!(before, volume.device_path());
        assert!(before.starts_with(WWN_DEVICE_PREFIX));
        assert_eq!(before.len(), WWN_DEVICE_PREFIX.len() + 16);
    }
}
