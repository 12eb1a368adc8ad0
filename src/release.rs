//! Deferred destruction of evicted values.
//!
//! Values held by the memory tier may carry expensive destructors (decoded
//! images, pooled buffers). Eviction hands them to a [`ReleaseExecutor`] so
//! the drop runs outside the cache lock.

use std::sync::Arc;

/// Executor on which evicted-value destructors run.
///
/// Embedders that need destruction on a particular thread (a UI thread,
/// say) supply their own implementation that forwards the job there.
pub trait ReleaseExecutor: Send + Sync {
    /// Run `job` to completion, on whatever thread the executor owns.
    fn execute(&self, job: Box<dyn FnOnce() + Send>);
}

/// Runs destructors on the Tokio blocking pool.
///
/// This is the default. Outside a runtime the job runs inline instead of
/// being dropped on the floor.
#[derive(Debug, Default)]
pub struct BackgroundRelease;

impl ReleaseExecutor for BackgroundRelease {
    fn execute(&self, job: Box<dyn FnOnce() + Send>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(job);
            }
            Err(_) => job(),
        }
    }
}

/// Runs destructors synchronously on the calling thread.
#[derive(Debug, Default)]
pub struct InlineRelease;

impl ReleaseExecutor for InlineRelease {
    fn execute(&self, job: Box<dyn FnOnce() + Send>) {
        job();
    }
}

pub(crate) fn default_release() -> Arc<dyn ReleaseExecutor> {
    Arc::new(BackgroundRelease)
}
