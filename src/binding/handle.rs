use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use super::error::BindError;
use super::request::{Header, HostRequest};

type ReleaseFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type ReleaseFn = Box<dyn FnOnce() -> ReleaseFuture + Send>;

/// Capability that undoes a bind.
///
/// The underlying release runs at most once; later calls to [`close`] are
/// no-ops returning `Ok(())`, so unwind and detach may race safely.
///
/// [`close`]: ReleaseHandle::close
pub struct ReleaseHandle {
    release: Mutex<Option<ReleaseFn>>,
}

impl ReleaseHandle {
    pub fn new<F, Fut>(release: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let release: ReleaseFn = Box::new(move || Box::pin(release()));
        Self { release: Mutex::new(Some(release)) }
    }

    /// A handle with nothing to release.
    pub fn noop() -> Self {
        Self { release: Mutex::new(None) }
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        let release = self.release.lock().unwrap_or_else(|e| e.into_inner()).take();
        match release {
            Some(release) => release().await,
            None => Ok(()),
        }
    }

    pub fn is_released(&self) -> bool {
        self.release.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }
}

impl fmt::Debug for ReleaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseHandle").field("released", &self.is_released()).finish()
    }
}

/// A live bind of a namespace onto a host target.
#[derive(Debug, Clone)]
pub struct Binding {
    pub request: HostRequest,
    pub bound_at: DateTime<Utc>,
    release: Arc<ReleaseHandle>,
}

impl Binding {
    pub fn new(request: HostRequest, release: ReleaseHandle) -> Self {
        Self { request, bound_at: Utc::now(), release: Arc::new(release) }
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        self.release.close().await
    }

    pub fn is_released(&self) -> bool {
        self.release.is_released()
    }
}

/// Per-target outcome reported by a host attacher or the index.
#[derive(Debug)]
pub struct HostResponse {
    /// Absent only for batch-level validation failures.
    pub request: Option<HostRequest>,
    pub result: Result<Binding, BindError>,
}

impl HostResponse {
    pub fn bound(binding: Binding) -> Self {
        Self { request: Some(binding.request.clone()), result: Ok(binding) }
    }

    pub fn failed(request: HostRequest, error: BindError) -> Self {
        Self { request: Some(request), result: Err(error) }
    }

    pub fn batch_error(error: BindError) -> Self {
        Self { request: None, result: Err(error) }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// One partition's worth of results.
#[derive(Debug)]
pub struct Response {
    /// `None` when the whole batch was rejected before dispatch.
    pub header: Option<Header>,
    pub from_host: mpsc::Receiver<HostResponse>,
}

impl Response {
    /// A response stream carrying exactly one batch level error.
    pub fn rejected(error: BindError) -> Self {
        let (tx, rx) = mpsc::channel(1);
        // capacity 1 and a fresh channel, so this cannot fail
        let _ = tx.try_send(HostResponse::batch_error(error));
        Self { header: None, from_host: rx }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::binding::Address;

    #[tokio::test]
    async fn test_release_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handle = ReleaseHandle::new(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("unmount failed"))
        });

        assert!(!handle.is_released());
        assert!(handle.close().await.is_err());
        assert!(handle.is_released());
        assert!(handle.close().await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_binding_clones_share_release() {
        let request = HostRequest::new(Address::host_path("/mnt/a").unwrap());
        let binding = Binding::new(request, ReleaseHandle::new(|| async { Ok(()) }));
        let copy = binding.clone();
        binding.close().await.unwrap();
        assert!(copy.is_released());
    }

    #[tokio::test]
    async fn test_rejected_response() {
        let mut response = Response::rejected(BindError::Cancelled);
        assert!(response.header.is_none());
        let only = response.from_host.recv().await.unwrap();
        assert!(only.request.is_none());
        assert!(matches!(only.result, Err(BindError::Cancelled)));
        assert!(response.from_host.recv().await.is_none());
    }
}
