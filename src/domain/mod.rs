//! Domain layer - port definitions
//!
//! The traits the volume lifecycle code is written against: a hypervisor
//! cluster, the host mount table and the orchestrator API.

pub mod ports;

pub use ports::*;
