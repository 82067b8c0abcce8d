use std::sync::Arc;

use anyhow::Context;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::mount::{mount, unmount, FuseRequest};
use crate::binding::{BindError, Binding, HostRequest, HostResponse, ReleaseHandle};
use crate::fs::Filesystem;
use crate::manager::{spawn_batch, HostAttacher};

/// Host attacher mounting one namespace at host paths through FUSE.
#[derive(Clone)]
pub struct FuseAttacher {
    cancel: CancellationToken,
    fs: Arc<dyn Filesystem>,
    runtime: Handle,
}

impl FuseAttacher {
    /// Must be called from within a tokio runtime; its handle serves the
    /// filesystem callbacks of every mount.
    pub fn new(cancel: CancellationToken, fs: Arc<dyn Filesystem>) -> anyhow::Result<Self> {
        let runtime = Handle::try_current().context("FUSE attacher needs a tokio runtime")?;
        Ok(Self { cancel, fs, runtime })
    }

    async fn bind(&self, host: HostRequest) -> Result<Binding, BindError> {
        let request = FuseRequest::parse(&host)?;
        let fs = self.fs.clone();
        let runtime = self.runtime.clone();
        let mountpoint = request.mountpoint.clone();

        let session = tokio::task::spawn_blocking(move || {
            mount(fs, runtime, &request.mountpoint, &request.options)
        })
        .await
        .map_err(anyhow::Error::from)
        .and_then(|mounted| mounted)
        .map_err(|e| BindError::Host { target: host.to_string(), reason: format!("{e:#}") })?;

        let release = ReleaseHandle::new(move || async move {
            tokio::task::spawn_blocking(move || unmount(session, &mountpoint))
                .await
                .context("unmount task failed")
        });
        Ok(Binding::new(host, release))
    }
}

impl HostAttacher for FuseAttacher {
    fn attach(&self, requests: Vec<HostRequest>) -> mpsc::Receiver<HostResponse> {
        let this = self.clone();
        spawn_batch(self.cancel.clone(), requests, move |request| {
            let this = this.clone();
            async move { this.bind(request).await }
        })
    }
}
