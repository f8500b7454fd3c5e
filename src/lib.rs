//! Stevedore - container-execution backend for workflow job runners
//!
//! Given a description of a required software container and a path-mapping
//! table between a host job and its sandbox, Stevedore resolves the container
//! image, decides how host data is exposed inside the sandbox, and assembles
//! the exact container-engine invocation that runs one job to completion:
//!
//! - Image resolution with a shared cache (pull, build, load, import)
//! - Host-path validation for VM-backed engine installations
//! - Read-only / read-write / copy-then-bind / synthetic volume mounting
//! - Ordered runtime argument assembly with container-id tracking

pub mod error;
pub mod image;
pub mod machine;
pub mod mount;
pub mod runtime;

pub use error::{Result, StevedoreError};
pub use image::{Engine, EngineFlavor, ImageCache, ImageRequirement, ImageResolver};
pub use machine::HostMountRegistry;
pub use mount::{MountEntry, MountKind};
pub use runtime::{JobSandbox, RunSpec, RuntimeBuilder, RuntimeConfig};
