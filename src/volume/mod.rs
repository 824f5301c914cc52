//! Volume Model
//!
//! Identity and provisioning parameters shared by the controller, the node
//! service and the migration tool.

pub mod identifier;
pub mod parameters;

pub use identifier::*;
pub use parameters::*;
