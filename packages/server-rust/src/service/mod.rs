//! Job lifecycle services.
//!
//! 1. **Configuration** (`config`): server and dispatch parameters
//! 2. **Jobs** (`jobs`): submission, one dispatch task per job, cancellation,
//!    progress, and draining on shutdown

pub mod config;
pub mod jobs;

pub use config::{load_dispatch_overrides, ServerConfig};
pub use jobs::{JobHandle, JobService, JobServiceError};
