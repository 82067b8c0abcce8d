// Seams between the manager and the protocol specific host attachers

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::binding::stack::aggregate;
use crate::binding::{
    BindError, Binding, Header, HostApi, HostRequest, HostResponse, Namespace, UnwindStack,
};
use crate::fs::{FsResult, Filesystem};

/// Binds host requests for one header.
///
/// Implementations emit exactly one response per submitted request, in
/// submission order, and close the stream once the batch is finished.
pub trait HostAttacher: Send + Sync {
    fn attach(&self, requests: Vec<HostRequest>) -> mpsc::Receiver<HostResponse>;
}

/// Constructs the attacher serving `header` on top of its filesystem.
pub trait HostBuilder: Send + Sync {
    fn build(
        &self,
        header: Header,
        cancel: CancellationToken,
        fs: Arc<dyn Filesystem>,
    ) -> anyhow::Result<Arc<dyn HostAttacher>>;
}

impl<F> HostBuilder for F
where
    F: Fn(Header, CancellationToken, Arc<dyn Filesystem>) -> anyhow::Result<Arc<dyn HostAttacher>>
        + Send
        + Sync,
{
    fn build(
        &self,
        header: Header,
        cancel: CancellationToken,
        fs: Arc<dyn Filesystem>,
    ) -> anyhow::Result<Arc<dyn HostAttacher>> {
        self(header, cancel, fs)
    }
}

/// One builder per host API. Matching on [`HostApi`] here is exhaustive, so
/// adding an API without a builder does not compile.
pub struct HostTable {
    pub fuse: Box<dyn HostBuilder>,
    pub ninep: Box<dyn HostBuilder>,
}

impl HostTable {
    pub fn builder(&self, api: HostApi) -> &dyn HostBuilder {
        match api {
            HostApi::Fuse => self.fuse.as_ref(),
            HostApi::NineP => self.ninep.as_ref(),
        }
    }
}

/// Produces the virtual filesystem backing a namespace.
#[async_trait]
pub trait FilesystemFactory: Send + Sync {
    async fn create(&self, namespace: Namespace) -> FsResult<Arc<dyn Filesystem>>;
}

#[async_trait]
impl<F> FilesystemFactory for F
where
    F: Fn(Namespace) -> FsResult<Arc<dyn Filesystem>> + Send + Sync,
{
    async fn create(&self, namespace: Namespace) -> FsResult<Arc<dyn Filesystem>> {
        self(namespace)
    }
}

/// Bind `requests` in order with `bind`, stopping at the first failure.
///
/// On failure every binding made so far is released newest first, and the
/// batch reports: earlier targets as [`BindError::Unwound`], the failing one
/// with its own error, later ones as [`BindError::Skipped`]. Cancellation
/// stops the batch without undoing anything: established bindings are
/// reported and the rest come back as [`BindError::Cancelled`].
pub async fn attach_batch<F, Fut>(
    cancel: &CancellationToken,
    requests: Vec<HostRequest>,
    mut bind: F,
) -> Vec<HostResponse>
where
    F: FnMut(HostRequest) -> Fut,
    Fut: Future<Output = Result<Binding, BindError>>,
{
    let mut stack = UnwindStack::new();
    let mut stopped_at = None;
    let mut failure = None;

    for (position, request) in requests.iter().enumerate() {
        if cancel.is_cancelled() {
            stopped_at = Some(position);
            break;
        }
        match bind(request.clone()).await {
            Ok(binding) => stack.push(position, binding),
            Err(err) => {
                failure = Some((position, err));
                break;
            }
        }
    }

    let mut responses = Vec::with_capacity(requests.len());
    match failure {
        None => {
            responses.extend(stack.drain().into_iter().map(|(_, b)| HostResponse::bound(b)));
            if let Some(position) = stopped_at {
                tracing::debug!(remaining = requests.len() - position, "batch cancelled");
                responses.extend(
                    requests[position..]
                        .iter()
                        .map(|r| HostResponse::failed(r.clone(), BindError::Cancelled)),
                );
            }
        }
        Some((position, err)) => {
            tracing::warn!(request = %requests[position], error = %err, "bind failed, unwinding batch");
            let undone = stack.unwind().await;
            if let Some(close_errors) = aggregate(&undone) {
                tracing::warn!(error = %close_errors, "unwind incomplete");
            }
            for unwound in undone.into_iter().rev() {
                let request = requests[unwound.tag].clone();
                let error =
                    BindError::Unwound { target: request.to_string(), close_error: unwound.error };
                responses.push(HostResponse::failed(request, error));
            }
            responses.push(HostResponse::failed(requests[position].clone(), err));
            responses.extend(requests[position + 1..].iter().map(|r| {
                HostResponse::failed(r.clone(), BindError::Skipped { target: r.to_string() })
            }));
        }
    }
    responses
}

/// Run [`attach_batch`] on its own task and stream the results.
pub fn spawn_batch<F, Fut>(
    cancel: CancellationToken,
    requests: Vec<HostRequest>,
    bind: F,
) -> mpsc::Receiver<HostResponse>
where
    F: FnMut(HostRequest) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Binding, BindError>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(requests.len().max(1));
    tokio::spawn(async move {
        for response in attach_batch(&cancel, requests, bind).await {
            if tx.send(response).await.is_err() {
                tracing::warn!("attach stream receiver dropped");
                break;
            }
        }
    });
    rx
}
