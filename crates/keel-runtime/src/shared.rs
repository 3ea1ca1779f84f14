//! Process-wide, initialize-once instances.
//!
//! Services that must exist exactly once per process (the pool, the job
//! queue) are created explicitly at startup and published through a
//! [`SharedInstance`]. Nothing is constructed lazily on first access, so
//! configuration errors surface at startup rather than on first use.
//!
//! ```rust
//! use keel_runtime::SharedInstance;
//!
//! static SETTINGS: SharedInstance<String> = SharedInstance::new("settings");
//!
//! SETTINGS.init("prod".to_string()).unwrap();
//! assert_eq!(SETTINGS.get().unwrap().as_str(), "prod");
//! ```

use std::fmt;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum SharedError {
    #[error("Shared instance '{0}' is already initialized")]
    AlreadyInitialized(&'static str),

    #[error("Shared instance '{0}' has not been initialized")]
    NotInitialized(&'static str),
}

/// A value set once at startup and read from anywhere afterwards.
pub struct SharedInstance<T> {
    name: &'static str,
    cell: OnceLock<Arc<T>>,
}

impl<T> SharedInstance<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            cell: OnceLock::new(),
        }
    }

    /// Publish the instance. Fails if another caller got there first; the
    /// first value stays in place.
    pub fn init(&self, value: T) -> Result<Arc<T>, SharedError> {
        let value = Arc::new(value);
        self.cell
            .set(value.clone())
            .map_err(|_| SharedError::AlreadyInitialized(self.name))?;
        tracing::debug!(instance = self.name, "Shared instance initialized");
        Ok(value)
    }

    pub fn get(&self) -> Result<Arc<T>, SharedError> {
        self.cell
            .get()
            .cloned()
            .ok_or(SharedError::NotInitialized(self.name))
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl<T> fmt::Debug for SharedInstance<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedInstance")
            .field("name", &self.name)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
