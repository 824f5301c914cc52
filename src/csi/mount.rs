//! System Mounter
//!
//! [`Mounter`] backed by the host's util-linux and filesystem tools.

use crate::domain::ports::{FilesystemStats, Mounter};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

/// Mounter shelling out to `mount`, `umount`, `findmnt`, `blkid`, `mkfs`,
/// `resize2fs`, `xfs_growfs` and `blockdev`
#[derive(Debug, Clone, Default)]
pub struct SystemMounter;

struct Output {
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl Output {
    fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl SystemMounter {
    pub fn new() -> Self {
        Self
    }

    async fn exec(program: &str, args: &[&str]) -> Result<Output> {
        debug!("Running {} {}", program, args.join(" "));

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Mount {
                path: args.last().copied().unwrap_or_default().to_string(),
                reason: format!("failed to run {}: {}", program, e),
            })?;

        Ok(Output {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Run a command that must succeed
    async fn run(program: &str, args: &[&str], path: &str) -> Result<String> {
        let output = Self::exec(program, args).await?;
        if !output.success() {
            return Err(Error::Mount {
                path: path.to_string(),
                reason: format!("{} failed: {}", program, output.stderr),
            });
        }
        Ok(output.stdout)
    }

    /// Filesystem type on a device, `None` if unformatted
    async fn probe_filesystem(device: &str) -> Result<Option<String>> {
        let output = Self::exec("blkid", &["-p", "-s", "TYPE", "-o", "value", device]).await?;

        match output.code {
            Some(0) if !output.stdout.is_empty() => Ok(Some(output.stdout)),
            // blkid exits 2 when no filesystem signature is found
            Some(0) | Some(2) => Ok(None),
            _ => Err(Error::Mount {
                path: device.to_string(),
                reason: format!("blkid failed: {}", output.stderr),
            }),
        }
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[async_trait]
impl Mounter for SystemMounter {
    async fn is_mount_point(&self, path: &Path) -> Result<bool> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(false);
        }

        let target = path_str(path);
        let output = Self::exec(
            "findmnt",
            &["--mountpoint", target.as_str(), "--noheadings", "--output", "TARGET"],
        )
        .await?;

        Ok(output.success() && !output.stdout.is_empty())
    }

    async fn format_and_mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
        mkfs_args: &[String],
    ) -> Result<()> {
        match Self::probe_filesystem(source).await? {
            Some(existing) => {
                debug!("{} already carries {}, skipping mkfs", source, existing);
            }
            None => {
                info!("Creating {} filesystem on {}", fs_type, source);

                let mut args: Vec<&str> = Vec::new();
                if fs_type.starts_with("ext") {
                    args.push("-F");
                }
                args.extend(mkfs_args.iter().map(String::as_str));
                args.push(source);

                Self::run(&format!("mkfs.{}", fs_type), &args, source).await?;
            }
        }

        self.mount(source, target, Some(fs_type), options).await
    }

    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: Option<&str>,
        options: &[String],
    ) -> Result<()> {
        let target = path_str(target);
        let joined = options.join(",");

        let mut args: Vec<&str> = Vec::new();
        if let Some(fs_type) = fs_type.filter(|t| !t.is_empty()) {
            args.extend(["-t", fs_type]);
        }
        if !joined.is_empty() {
            args.extend(["-o", joined.as_str()]);
        }
        args.extend([source, target.as_str()]);

        Self::run("mount", &args, &target).await?;
        info!("Mounted {} at {}", source, target);
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        if !self.is_mount_point(target).await? {
            debug!("{} is not mounted", target.display());
            return Ok(());
        }

        let target = path_str(target);
        Self::run("umount", &[target.as_str()], &target).await?;
        info!("Unmounted {}", target);
        Ok(())
    }

    async fn device_for_mount(&self, target: &Path) -> Result<Option<String>> {
        let target = path_str(target);
        let output = Self::exec(
            "findmnt",
            &["--mountpoint", target.as_str(), "--noheadings", "--output", "SOURCE"],
        )
        .await?;

        if !output.success() || output.stdout.is_empty() {
            return Ok(None);
        }
        Ok(output.stdout.lines().next().map(str::to_string))
    }

    async fn resize_filesystem(&self, device: &str, target: &Path) -> Result<()> {
        let fs_type = Self::probe_filesystem(device).await?.unwrap_or_default();

        match fs_type.as_str() {
            "ext2" | "ext3" | "ext4" => {
                Self::run("resize2fs", &[device], device).await?;
            }
            "xfs" => {
                let target = path_str(target);
                Self::run("xfs_growfs", &[target.as_str()], &target).await?;
            }
            other => {
                return Err(Error::Mount {
                    path: device.to_string(),
                    reason: format!("cannot resize filesystem {:?}", other),
                });
            }
        }

        info!("Resized {} filesystem on {}", fs_type, device);
        Ok(())
    }

    async fn filesystem_stats(&self, path: &Path) -> Result<FilesystemStats> {
        let path = path.to_path_buf();
        let stat = tokio::task::spawn_blocking(move || nix::sys::statvfs::statvfs(path.as_path()))
            .await
            .map_err(|e| Error::Internal(format!("statvfs task failed: {}", e)))?
            .map_err(std::io::Error::from)?;

        let block = stat.fragment_size() as u64;
        let total_bytes = stat.blocks() as u64 * block;
        let available_bytes = stat.blocks_available() as u64 * block;
        let used_bytes = (stat.blocks() as u64 - stat.blocks_free() as u64) * block;
        let total_inodes = stat.files() as u64;
        let free_inodes = stat.files_free() as u64;

        Ok(FilesystemStats {
            total_bytes,
            available_bytes,
            used_bytes,
            total_inodes,
            free_inodes,
            used_inodes: total_inodes.saturating_sub(free_inodes),
        })
    }

    async fn block_device_size(&self, device: &str) -> Result<u64> {
        let size = Self::run("blockdev", &["--getsize64", device], device).await?;
        size.parse().map_err(|_| Error::Mount {
            path: device.to_string(),
            reason: format!("unexpected blockdev output {:?}", size),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_path_is_not_a_mount_point() {
        let mounter = SystemMounter::new();
        assert!(!mounter
            .is_mount_point(Path::new("/nonexistent/pve-csi/staging"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_unmount_of_unmounted_path_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("missing");
        SystemMounter::new().unmount(&target).await.unwrap();
    }

    #[tokio::test]
    async fn test_filesystem_stats() {
        let dir = tempfile::tempdir().unwrap();
        let stats = SystemMounter::new()
            .filesystem_stats(dir.path())
            .await
            .unwrap();

        assert!(stats.total_bytes > 0);
        assert!(stats.available_bytes <= stats.total_bytes);
        assert!(stats.used_bytes <= stats.total_bytes);
    }
}
