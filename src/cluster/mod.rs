//! Multi-cluster access
//!
//! Configuration loading, the REST client for one hypervisor cluster and the
//! pool that addresses clusters by region.

pub mod client;
pub mod config;
pub mod pool;

pub use client::PveClient;
pub use config::{ClusterConfig, ClustersConfig, Credentials};
pub use pool::{wait_for_task, ClusterPool, VmFilter, VmLocation};
