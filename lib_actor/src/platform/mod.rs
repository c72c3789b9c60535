//! Platform abstraction: capability contracts plus the per-OS
//! implementations, selected once at startup.

pub mod config;
pub mod ops;

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(windows)]
pub mod windows;

use std::sync::Arc;

use self::config::ConfigStore;
use self::ops::Operations;

/// The platform context threaded through the lifecycle: operations and
/// configuration store, constructed in `main` and read-only afterwards.
pub struct Platform {
    pub operations: Arc<dyn Operations>,
    pub store: Arc<dyn ConfigStore>,
}

impl Platform {
    pub fn new(operations: Arc<dyn Operations>, store: Arc<dyn ConfigStore>) -> Self {
        Platform { operations, store }
    }

    /// The real platform for the OS we are running on.
    #[cfg(target_os = "linux")]
    pub fn system() -> Self {
        Platform::new(
            Arc::new(linux::LinuxOperations::new()),
            Arc::new(config::FileConfigStore::system()),
        )
    }

    #[cfg(windows)]
    pub fn system() -> Self {
        Platform::new(
            Arc::new(windows::WindowsOperations::new()),
            Arc::new(config::FileConfigStore::system()),
        )
    }
}
