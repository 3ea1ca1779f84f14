//! The seam between the pool and whatever it pools.

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by a [`ResourceFactory`].
#[derive(Error, Debug, Clone)]
pub enum ResourceError {
    #[error("Failed to create resource: {0}")]
    Create(String),

    #[error("Failed to close resource: {0}")]
    Close(String),
}

/// Creates, probes and destroys pooled handles.
///
/// The pool never inspects a handle; everything it knows about liveness
/// comes from [`health_check`](Self::health_check).
#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    type Handle: Send + Sync + 'static;

    /// Short label for logs, e.g. `"browser"`.
    fn kind(&self) -> &str {
        "resource"
    }

    async fn create(&self) -> Result<Self::Handle, ResourceError>;

    /// Probe an idle handle before it is handed out again.
    async fn health_check(&self, _handle: &Self::Handle) -> bool {
        true
    }

    /// Tear down a handle. Errors are logged by the pool, never surfaced.
    async fn close(&self, handle: Self::Handle) -> Result<(), ResourceError>;
}
