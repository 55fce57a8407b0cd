//! Shared utility functions.

use std::future::Future;

use tokio::task::{spawn_blocking, JoinHandle};

use crate::{mlog_warn, Error, Result};

/// Run synchronous (git2) work on the blocking pool.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Spawn a fallible task without awaiting it. Failures are logged under
/// `label` and otherwise dropped; nothing waits on the handle at shutdown.
pub fn detach<F>(label: &'static str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            mlog_warn!("{} failed: {}", label, e);
        }
    })
}
