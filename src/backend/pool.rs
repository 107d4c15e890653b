//! Pool of deferred contexts
//!
//! Contexts are created on demand and kept for reuse. An acquired context is
//! owned by exactly one worker until its [`PooledContext`] guard drops.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::traits::{DeviceContext, RenderDevice};
use crate::error::RenderResult;

/// Lock-protected stack of deferred contexts
pub struct DeferredContextPool {
    device: Arc<dyn RenderDevice>,
    contexts: Mutex<Vec<Box<dyn DeviceContext>>>,
    created: AtomicUsize,
}

impl DeferredContextPool {
    pub fn new(device: Arc<dyn RenderDevice>) -> Self {
        Self {
            device,
            contexts: Mutex::new(Vec::new()),
            created: AtomicUsize::new(0),
        }
    }

    /// Take a context, creating one when the pool is empty
    pub fn acquire(&self) -> RenderResult<PooledContext<'_>> {
        let pooled = self.contexts.lock().pop();
        let context = match pooled {
            Some(context) => context,
            None => {
                let context = self.device.create_deferred_context()?;
                let total = self.created.fetch_add(1, Ordering::Relaxed) + 1;
                log::trace!("Created deferred context #{}", total);
                context
            }
        };
        Ok(PooledContext {
            pool: self,
            context: Some(context),
        })
    }

    /// Contexts currently idle in the pool
    pub fn available(&self) -> usize {
        self.contexts.lock().len()
    }

    /// Contexts created over the pool's lifetime
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Drop every idle context
    pub fn clear(&self) {
        self.contexts.lock().clear();
    }

    fn release(&self, mut context: Box<dyn DeviceContext>) {
        // Only a failed worker leaves commands behind.
        let discarded = context.discard_pending();
        if discarded > 0 {
            log::debug!("Discarded {} commands left on a released context", discarded);
        }
        self.contexts.lock().push(context);
    }
}

/// Exclusive use of a pooled deferred context
pub struct PooledContext<'a> {
    pool: &'a DeferredContextPool,
    context: Option<Box<dyn DeviceContext>>,
}

impl Deref for PooledContext<'_> {
    type Target = dyn DeviceContext;

    fn deref(&self) -> &Self::Target {
        match &self.context {
            Some(context) => context.as_ref(),
            None => unreachable!("pooled context taken before drop"),
        }
    }
}

impl DerefMut for PooledContext<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.context {
            Some(context) => context.as_mut(),
            None => unreachable!("pooled context taken before drop"),
        }
    }
}

impl Drop for PooledContext<'_> {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            self.pool.release(context);
        }
    }
}
