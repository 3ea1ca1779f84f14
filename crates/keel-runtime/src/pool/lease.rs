use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use super::factory::ResourceFactory;
use super::PoolInner;

/// Exclusive use of one pooled handle.
///
/// Give it back with [`Lease::release`] (or [`ResourcePool::release`]). A
/// lease that is simply dropped is returned as failed, which counts toward
/// the handle's error threshold.
///
/// [`ResourcePool::release`]: super::ResourcePool::release
pub struct Lease<F: ResourceFactory> {
    pool: Arc<PoolInner<F>>,
    id: u64,
    handle: Option<F::Handle>,
}

impl<F: ResourceFactory> Lease<F> {
    pub(super) fn new(pool: Arc<PoolInner<F>>, id: u64, handle: F::Handle) -> Self {
        Self {
            pool,
            id,
            handle: Some(handle),
        }
    }

    /// Pool-assigned identifier of the leased handle.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Return the handle. `failed` bumps its error count.
    pub fn release(mut self, failed: bool) {
        if let Some(handle) = self.handle.take() {
            self.pool.check_in(self.id, handle, failed);
        }
    }

    /// Remove the handle from the pool and close it.
    pub(super) async fn discard(mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.forget(self.id);
            self.pool.close_handle(handle).await;
        }
    }
}

impl<F: ResourceFactory> Deref for Lease<F> {
    type Target = F::Handle;

    fn deref(&self) -> &F::Handle {
        // Only release/discard/drop take the handle, and all consume the lease.
        self.handle.as_ref().expect("lease handle present until release")
    }
}

impl<F: ResourceFactory> fmt::Debug for Lease<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("pool", &self.pool.name)
            .field("id", &self.id)
            .finish()
    }
}

impl<F: ResourceFactory> Drop for Lease<F> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            tracing::warn!(
                pool = %self.pool.name,
                handle_id = self.id,
                "Lease dropped without release, returning handle as failed"
            );
            self.pool.check_in(self.id, handle, true);
        }
    }
}
