//! HTTP surface and shutdown control.

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod module;
pub mod shutdown;

pub use config::NetworkConfig;
pub use handlers::{ApiError, AppState};
pub use module::{build_router, NetworkModule};
pub use shutdown::{DispatchGuard, HealthState, ShutdownController};
