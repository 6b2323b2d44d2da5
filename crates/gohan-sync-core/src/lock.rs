use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::SyncError;
use crate::sync::SyncBackend;

/// A lock held by this process.
///
/// The token is shared by every re-entrant acquisition of the same path. It is
/// cancelled when the lock stops being held: after `unlock`, or when the background
/// lease refresh fails and the lease is left to expire.
#[derive(Debug, Clone)]
pub struct LockToken {
    path: String,
    lost: CancellationToken,
}

impl LockToken {
    pub fn new(path: impl Into<String>, lost: CancellationToken) -> Self {
        Self {
            path: path.into(),
            lost,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Resolves once the lock is no longer held.
    pub async fn lost(&self) {
        self.lost.cancelled().await
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }
}

/// Run `body` while holding the lock at `path`, releasing it on every exit path.
///
/// An error from `body` takes precedence over an error from the release.
pub async fn with_lock<T, E, F, Fut>(
    sync: &dyn SyncBackend,
    cancel: &CancellationToken,
    path: &str,
    block: bool,
    body: F,
) -> Result<T, E>
where
    F: FnOnce(LockToken) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<SyncError>,
{
    let token = sync.lock(cancel, path, block).await?;
    let result = body(token).await;
    let released = sync.unlock(path).await;

    match (result, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(err.into()),
        (Err(err), _) => Err(err),
    }
}
