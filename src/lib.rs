//! PVE CSI Driver
//!
//! Container Storage Interface driver for block volumes on one or more
//! Proxmox VE clusters, plus the out-of-band migration tooling.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                       RPC server (csi::server)                       │
//! │   Identity            Controller                  Node               │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ResourceLock   VolumeId / StorageParameters   DeviceResolver        │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ClusterPool (one REST client per region)    Mounter    KubeApi      │
//! └──────────────────────────────────────────────────────────────────────┘
//!            ▲                                               ▲
//!            └──────────── migration (pvecsictl) ────────────┘
//! ```
//!
//! # Modules
//!
//! - [`volume`]: volume identifier codec and provisioning parameters
//! - [`cluster`]: hypervisor REST client, credentials and the region pool
//! - [`csi`]: Identity, Controller and Node services and their server
//! - [`migration`]: migrate, rename and swap workflows
//! - [`domain`]: ports implemented by the adapters
//! - [`kubernetes`]: orchestrator API adapter
//! - [`error`]: error types and status classes

pub mod cluster;
pub mod csi;
pub mod domain;
pub mod error;
pub mod kubernetes;
pub mod logging;
pub mod metrics;
pub mod migration;
pub mod volume;

#[cfg(test)]
pub(crate) mod testing;

pub use cluster::{ClusterPool, ClustersConfig};
pub use error::{Error, Result};
pub use volume::{StorageParameters, VolumeId};

/// Registered driver name
pub const DRIVER_NAME: &str = "csi.pve.billyronks.io";

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name and version reported by the Identity service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverInfo {
    pub name: String,
    pub version: String,
}

impl Default for DriverInfo {
    fn default() -> Self {
        Self {
            name: DRIVER_NAME.to_string(),
            version: VERSION.to_string(),
        }
    }
}
