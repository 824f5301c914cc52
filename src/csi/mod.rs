//! Volume lifecycle protocol
//!
//! Identity, Controller and Node roles, the host-local device and mount
//! helpers they use, and the RPC server exposing them.

pub mod controller;
pub mod device;
pub mod identity;
pub mod lock;
pub mod mount;
pub mod node;
pub mod server;
pub mod types;

pub use controller::ControllerService;
pub use device::DeviceResolver;
pub use identity::IdentityService;
pub use lock::{ResourceGuard, ResourceLock};
pub use mount::SystemMounter;
pub use node::NodeService;
pub use server::{health_router, router, serve, serve_health, CsiState, Endpoint};
