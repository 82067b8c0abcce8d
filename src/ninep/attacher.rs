use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::listener::{ConnectionHandler, ListenerRegistry};
use super::platform::PlatformMount;
use crate::binding::{Address, BindError, Binding, HostRequest, HostResponse, ReleaseHandle};
use crate::fs::Filesystem;
use crate::manager::{spawn_batch, HostAttacher};

/// A 9P bind target decoded from a host request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NineRequest {
    /// Where the protocol server listens.
    pub listen: Address,
    /// Host path the listener gets mounted on; `None` only serves the socket.
    pub host_path: Option<String>,
}

impl NineRequest {
    pub fn parse(request: &HostRequest) -> Result<Self, BindError> {
        let invalid = |reason: String| BindError::InvalidRequest { target: request.to_string(), reason };
        let arguments = request.arguments();

        if request.target.is_listener() {
            if !arguments.is_empty() {
                return Err(invalid(format!(
                    "listener targets take no arguments, got {}",
                    arguments.len()
                )));
            }
            return Ok(Self { listen: request.target.clone(), host_path: None });
        }

        let host_path = request
            .target
            .as_host_path()
            .ok_or_else(|| invalid("9P targets must be host paths or listener addresses".into()))?;
        let [listen] = arguments else {
            return Err(invalid(format!(
                "expected exactly one listener address argument, got {}",
                arguments.len()
            )));
        };
        let listen: Address = listen.parse().map_err(|e| invalid(format!("{e}")))?;
        if !listen.is_listener() {
            return Err(invalid(format!("{listen} is not a listener address")));
        }
        Ok(Self { listen, host_path: Some(host_path.to_string()) })
    }
}

struct Inner {
    cancel: CancellationToken,
    fs: Arc<dyn Filesystem>,
    handler: Arc<dyn ConnectionHandler>,
    platform: Arc<dyn PlatformMount>,
    registry: Mutex<ListenerRegistry>,
}

/// Host attacher serving one namespace over 9P.
///
/// Bindings that share a listen address share one server; it stops when the
/// last of them is released.
#[derive(Clone)]
pub struct NineAttacher {
    inner: Arc<Inner>,
}

impl NineAttacher {
    pub fn new(
        cancel: CancellationToken,
        fs: Arc<dyn Filesystem>,
        handler: Arc<dyn ConnectionHandler>,
        platform: Arc<dyn PlatformMount>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancel,
                fs,
                handler,
                platform,
                registry: Mutex::new(ListenerRegistry::new()),
            }),
        }
    }

    /// Number of live bindings using the server at `listen`.
    pub async fn refs(&self, listen: &Address) -> usize {
        self.inner.registry.lock().await.refs(listen)
    }

    /// Instance id of the server at `listen`, if one is running.
    pub async fn generation(&self, listen: &Address) -> Option<Uuid> {
        self.inner.registry.lock().await.generation(listen)
    }

    /// Stop every server, whether or not bindings still use it.
    pub async fn shutdown(&self) {
        self.inner.registry.lock().await.shutdown().await;
    }

    async fn bind(&self, host: HostRequest) -> Result<Binding, BindError> {
        let request = NineRequest::parse(&host)?;
        let host_error =
            |e: anyhow::Error| BindError::Host { target: host.to_string(), reason: format!("{e:#}") };
        let inner = &self.inner;

        let mut registry = inner.registry.lock().await;
        let server = registry
            .get_or_create(&request.listen, &inner.cancel, inner.fs.clone(), inner.handler.clone())
            .await
            .map_err(host_error)?;
        server.inc_ref();

        if let Some(host_path) = &request.host_path {
            let (source, args) = server.mount_source();
            let platform = inner.platform.clone();
            let target = host_path.clone();
            let mounted = tokio::task::spawn_blocking(move || platform.attach(&source, &target, &args))
                .await
                .context("mount task failed")
                .and_then(|attached| attached);

            if let Err(e) = mounted {
                if let Err(release_err) = registry.release(&request.listen).await {
                    tracing::warn!(listen = %request.listen, error = %release_err, "listener release failed");
                }
                return Err(host_error(e));
            }
        }
        drop(registry);

        tracing::info!(request = %host, listen = %request.listen, "9P binding established");
        let inner = self.inner.clone();
        let release = ReleaseHandle::new(move || release(inner, request));
        Ok(Binding::new(host, release))
    }
}

/// Unmount the host path (if any), then drop the listener reference. The
/// reference is dropped even when the unmount fails.
async fn release(inner: Arc<Inner>, request: NineRequest) -> anyhow::Result<()> {
    let detached = match request.host_path.clone() {
        Some(target) => {
            let platform = inner.platform.clone();
            tokio::task::spawn_blocking(move || platform.detach(&target))
                .await
                .context("unmount task failed")
                .and_then(|detached| detached)
        }
        None => Ok(()),
    };

    let released = inner.registry.lock().await.release(&request.listen).await;
    detached?;
    released
}

impl HostAttacher for NineAttacher {
    fn attach(&self, requests: Vec<HostRequest>) -> mpsc::Receiver<HostResponse> {
        let this = self.clone();
        spawn_batch(self.inner.cancel.clone(), requests, move |request| {
            let this = this.clone();
            async move { this.bind(request).await }
        })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::fs::EmptyFs;
    use crate::ninep::listener::Connection;
    use crate::ninep::platform::MockPlatformMount;

    struct Idle;

    #[async_trait]
    impl ConnectionHandler for Idle {
        async fn serve(&self, _fs: Arc<dyn Filesystem>, _c: Box<dyn Connection>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn host(path: &str, listen: &str) -> HostRequest {
        HostRequest::new(Address::host_path(path).unwrap()).with_arguments([listen])
    }

    fn attacher(platform: MockPlatformMount) -> NineAttacher {
        NineAttacher::new(
            CancellationToken::new(),
            Arc::new(EmptyFs),
            Arc::new(Idle),
            Arc::new(platform),
        )
    }

    #[test]
    fn test_parse_host_path_request() {
        let parsed = NineRequest::parse(&host("/mnt/ipfs", "/unix/run/9p.sock")).unwrap();
        assert_eq!(parsed.host_path.as_deref(), Some("/mnt/ipfs"));
        assert_eq!(parsed.listen.to_string(), "/unix/run/9p.sock");
    }

    #[test]
    fn test_parse_listener_only_request() {
        let listener = HostRequest::new("/ip4/127.0.0.1/tcp/564".parse().unwrap());
        let parsed = NineRequest::parse(&listener).unwrap();
        assert_eq!(parsed.host_path, None);

        let extra = listener.clone().with_arguments(["/unix/x"]);
        assert!(NineRequest::parse(&extra).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_arguments() {
        let bare = HostRequest::new(Address::host_path("/mnt/ipfs").unwrap());
        assert!(matches!(NineRequest::parse(&bare), Err(BindError::InvalidRequest { .. })));
        assert!(NineRequest::parse(&host("/mnt/ipfs", "/host/not/a/listener")).is_err());
        assert!(NineRequest::parse(&host("/mnt/ipfs", "garbage")).is_err());
    }

    #[tokio::test]
    async fn test_failed_mount_releases_listener() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("9p.sock");
        let listen = format!("/unix{}", socket.display());

        let mut platform = MockPlatformMount::new();
        platform.expect_attach().times(1).returning(|_, _, _| anyhow::bail!("permission denied"));
        platform.expect_detach().never();
        let attacher = attacher(platform);

        let mut rx = attacher.attach(vec![host("/mnt/ipfs", &listen)]);
        let response = rx.recv().await.unwrap();
        match response.result {
            Err(BindError::Host { reason, .. }) => assert!(reason.contains("permission denied")),
            other => panic!("unexpected result: {other:?}"),
        }
        let address: Address = listen.parse().unwrap();
        assert_eq!(attacher.refs(&address).await, 0);
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn test_release_decrements_even_if_unmount_fails() {
        let dir = tempfile::tempdir().unwrap();
        let listen = format!("/unix{}", dir.path().join("9p.sock").display());
        let address: Address = listen.parse().unwrap();

        let mut platform = MockPlatformMount::new();
        platform.expect_attach().returning(|_, _, _| Ok(()));
        platform.expect_detach().times(1).returning(|_| anyhow::bail!("device busy"));
        let attacher = attacher(platform);

        let mut rx = attacher.attach(vec![host("/mnt/ipfs", &listen)]);
        let binding = rx.recv().await.unwrap().result.unwrap();
        assert_eq!(attacher.refs(&address).await, 1);

        let err = binding.close().await.unwrap_err();
        assert!(err.to_string().contains("device busy"));
        assert_eq!(attacher.refs(&address).await, 0);
        assert_eq!(attacher.generation(&address).await, None);
    }
}
