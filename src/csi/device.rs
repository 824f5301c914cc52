//! Device Discovery
//!
//! Maps the stable `/dev/disk/by-id/wwn-0x<WWN>` path published by the
//! controller onto the block device the guest kernel created for it, by
//! matching the WWID the hypervisor exposes through sysfs.

use crate::error::{Error, Result};
use crate::volume::WWN_DEVICE_PREFIX;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Vendor string of the hypervisor's virtual SCSI disks
const VIRTUAL_DISK_VENDOR: &str = "QEMU";

/// Prefix the kernel puts in front of NAA-formatted WWIDs
const WWID_PREFIX: &str = "naa.";

/// Resolves published device paths to local block devices
#[derive(Debug, Clone)]
pub struct DeviceResolver {
    sysfs: PathBuf,
    /// Total time to wait for a device path to appear
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for DeviceResolver {
    fn default() -> Self {
        Self::new("/sys")
    }
}

impl DeviceResolver {
    pub fn new(sysfs: impl Into<PathBuf>) -> Self {
        Self {
            sysfs: sysfs.into(),
            wait_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn sysfs(&self) -> &Path {
        &self.sysfs
    }

    /// Resolve a published device path to a local device node
    pub async fn resolve(&self, device_path: &str) -> Result<String> {
        if let Some(wwn) = device_path.strip_prefix(WWN_DEVICE_PREFIX) {
            if let Some(device) = self.find_by_wwn(wwn)? {
                debug!("Resolved {} to {}", device_path, device);
                return Ok(device);
            }
        }

        self.wait_for_path(device_path).await?;
        Ok(device_path.to_string())
    }

    /// Scan SCSI devices for a virtual disk whose WWID matches `wwn`
    pub fn find_by_wwn(&self, wwn: &str) -> Result<Option<String>> {
        let pattern = self.sysfs.join("bus/scsi/devices/*");
        let pattern = pattern.to_string_lossy();
        let entries = glob::glob(&pattern)
            .map_err(|e| Error::Internal(format!("invalid sysfs pattern: {}", e)))?;

        for entry in entries.flatten() {
            let is_address = entry
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit() || c == ':'));
            if !is_address {
                continue;
            }

            let vendor = read_attribute(&entry.join("vendor"));
            if vendor.as_deref() != Some(VIRTUAL_DISK_VENDOR) {
                continue;
            }

            let Some(wwid) = read_attribute(&entry.join("wwid")) else {
                continue;
            };
            let wwid = wwid.strip_prefix(WWID_PREFIX).unwrap_or(&wwid);
            if !wwid.eq_ignore_ascii_case(wwn) {
                continue;
            }

            if let Some(name) = first_block_device(&entry.join("block")) {
                return Ok(Some(format!("/dev/{}", name)));
            }

            warn!("SCSI device {} matches {} but has no block device", entry.display(), wwn);
        }

        Ok(None)
    }

    /// Poll until `path` exists
    async fn wait_for_path(&self, path: &str) -> Result<()> {
        let deadline = Instant::now() + self.wait_timeout;

        while Instant::now() <= deadline {
            if tokio::fs::try_exists(path).await.unwrap_or(false) {
                return Ok(());
            }
            sleep(self.poll_interval).await;
        }

        Err(Error::DeviceNotFound {
            device: path.to_string(),
        })
    }

    /// Ask the kernel to re-read the size of a SCSI disk
    pub async fn rescan(&self, device: &str) -> Result<()> {
        let name = device.trim_start_matches("/dev/");
        let path = self.sysfs.join("block").join(name).join("device/rescan");

        debug!("Rescanning {}", path.display());
        tokio::fs::write(&path, b"1").await.map_err(|e| Error::Mount {
            path: path.display().to_string(),
            reason: format!("rescan failed: {}", e),
        })
    }
}

fn read_attribute(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
}

fn first_block_device(dir: &Path) -> Option<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();
    names.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::fs;

    fn scsi_device(root: &Path, address: &str, vendor: &str, wwid: &str, block: &str) {
        let dir = root.join("bus/scsi/devices").join(address);
        fs::create_dir_all(dir.join("block").join(block)).unwrap();
        fs::write(dir.join("vendor"), format!("{}    \n", vendor)).unwrap();
        fs::write(dir.join("wwid"), format!("{}\n", wwid)).unwrap();
    }

    #[test]
    fn test_find_by_wwn() {
        let sysfs = tempfile::tempdir().unwrap();
        scsi_device(sysfs.path(), "0:0:0:0", "QEMU", "naa.5000c500aaaaaaaa", "sda");
        scsi_device(sysfs.path(), "0:0:0:1", "QEMU", "naa.5000C500BBBBBBBB", "sdb");
        scsi_device(sysfs.path(), "0:0:0:2", "ATA", "naa.5000c500cccccccc", "sdc");
        scsi_device(sysfs.path(), "host0", "QEMU", "naa.5000c500dddddddd", "sdd");

        let resolver = DeviceResolver::new(sysfs.path());
        assert_eq!(
            resolver.find_by_wwn("5000c500bbbbbbbb").unwrap().as_deref(),
            Some("/dev/sdb")
        );
        assert!(resolver.find_by_wwn("5000c500cccccccc").unwrap().is_none());
        assert!(resolver.find_by_wwn("5000c500dddddddd").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolve_by_wwn() {
        let sysfs = tempfile::tempdir().unwrap();
        scsi_device(sysfs.path(), "2:0:0:1", "QEMU", "naa.0123456789abcdef", "sdb");

        let resolver = DeviceResolver::new(sysfs.path());
        let device = resolver
            .resolve("/dev/disk/by-id/wwn-0x0123456789abcdef")
            .await
            .unwrap();
        assert_eq!(device, "/dev/sdb");
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_path() {
        let sysfs = tempfile::tempdir().unwrap();
        let device = sysfs.path().join("vdb");
        fs::write(&device, b"").unwrap();

        let mut resolver = DeviceResolver::new(sysfs.path());
        resolver.wait_timeout = Duration::from_millis(50);
        resolver.poll_interval = Duration::from_millis(5);

        let path = device.to_string_lossy().to_string();
        assert_eq!(resolver.resolve(&path).await.unwrap(), path);

        let result = resolver.resolve("/dev/disk/by-id/wwn-0xffffffffffffffff").await;
        assert_matches!(result, Err(Error::DeviceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_rescan_writes_trigger() {
        let sysfs = tempfile::tempdir().unwrap();
        let dir = sysfs.path().join("block/sdb/device");
        fs::create_dir_all(&dir).unwrap();

        let resolver = DeviceResolver::new(sysfs.path());
        resolver.rescan("/dev/sdb").await.unwrap();
        assert_eq!(fs::read_to_string(dir.join("rescan")).unwrap(), "1");

        assert!(resolver.rescan("/dev/sdz").await.is_err());
    }
}
