// 9P listener registry
//
// One protocol server per listen address, shared by every binding that
// points at it. The registry lives inside an attacher and is only touched
// while the attacher's lock is held.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::binding::{Address, ListenAddr};
use crate::fs::Filesystem;

/// A byte stream accepted by a listener.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Connection for T {}

/// Speaks the file protocol on one accepted connection.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    async fn serve(&self, fs: Arc<dyn Filesystem>, connection: Box<dyn Connection>) -> Result<()>;
}

type Incoming = Pin<Box<dyn Stream<Item = io::Result<Box<dyn Connection>>> + Send>>;

/// Bind `listen`, returning the accepted-connection stream and the address
/// actually bound (differs from the request for TCP port 0).
async fn bind(listen: &ListenAddr) -> Result<(Incoming, ListenAddr)> {
    match listen {
        ListenAddr::Tcp(addr) => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {addr}"))?;
            let bound = ListenAddr::Tcp(listener.local_addr()?);
            let incoming = TcpListenerStream::new(listener)
                .map(|accepted| accepted.map(|s| Box::new(s) as Box<dyn Connection>));
            Ok((Box::pin(incoming), bound))
        }
        ListenAddr::Unix(path) => {
            // Remove existing socket if it exists
            if path.exists() {
                std::fs::remove_file(path).context("Failed to remove existing socket")?;
            }

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
            }

            let listener = tokio::net::UnixListener::bind(path)
                .with_context(|| format!("Failed to bind Unix socket {}", path.display()))?;
            let incoming = UnixListenerStream::new(listener)
                .map(|accepted| accepted.map(|s| Box::new(s) as Box<dyn Connection>));
            Ok((Box::pin(incoming), listen.clone()))
        }
    }
}

/// Accept until `stop` fires. An accept error after `stop` is the expected
/// result of closing the listener; before that it is a real failure.
async fn accept_loop(
    mut incoming: Incoming,
    stop: CancellationToken,
    fs: Arc<dyn Filesystem>,
    handler: Arc<dyn ConnectionHandler>,
) -> io::Result<()> {
    let mut connections = JoinSet::new();
    let result = loop {
        tokio::select! {
            _ = stop.cancelled() => break Ok(()),
            accepted = incoming.next() => match accepted {
                Some(Ok(connection)) => {
                    let fs = fs.clone();
                    let handler = handler.clone();
                    connections.spawn(async move {
                        if let Err(e) = handler.serve(fs, connection).await {
                            tracing::debug!(error = %e, "9P connection ended with error");
                        }
                    });
                }
                Some(Err(e)) if stop.is_cancelled() => {
                    tracing::debug!(error = %e, "accept interrupted by shutdown");
                    break Ok(());
                }
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            },
        }
        // reap finished connections
        while connections.try_join_next().is_some() {}
    };
    connections.shutdown().await;
    result
}

/// A running server and the number of bindings using it.
pub struct ServerRef {
    id: Uuid,
    bound: ListenAddr,
    refs: usize,
    stop: CancellationToken,
    task: Option<JoinHandle<io::Result<()>>>,
}

impl ServerRef {
    async fn start(
        listen: &ListenAddr,
        cancel: &CancellationToken,
        fs: Arc<dyn Filesystem>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<Self> {
        let (incoming, bound) = bind(listen).await?;
        let stop = cancel.child_token();
        let task = tokio::spawn(accept_loop(incoming, stop.clone(), fs, handler));
        let id = Uuid::new_v4();
        tracing::info!(server = %id, listen = ?bound, "9P server listening");
        Ok(Self { id, bound, refs: 0, stop, task: Some(task) })
    }

    /// Identity of this server instance; a restarted listener gets a new one.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn refs(&self) -> usize {
        self.refs
    }

    pub fn bound(&self) -> &ListenAddr {
        &self.bound
    }

    pub fn inc_ref(&mut self) {
        self.refs += 1;
    }

    /// Drop one reference. Reaching zero stops the server and waits for its
    /// accept loop to exit; the returned flag tells whether that happened.
    pub async fn dec_ref(&mut self) -> Result<bool> {
        self.refs = self.refs.saturating_sub(1);
        if self.refs > 0 {
            return Ok(false);
        }
        self.shutdown().await?;
        Ok(true)
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.stop.cancel();
        let outcome = match self.task.take() {
            Some(task) => task.await.context("9P server task failed")?,
            None => Ok(()),
        };
        if let ListenAddr::Unix(path) = &self.bound {
            remove_socket(path);
        }
        tracing::info!(server = %self.id, listen = ?self.bound, "9P server stopped");
        outcome.context("9P server accept loop failed")
    }

    /// Mount source and options that make a host kernel dial this server.
    pub fn mount_source(&self) -> (String, String) {
        match &self.bound {
            ListenAddr::Unix(path) => (path.display().to_string(), "trans=unix".to_string()),
            ListenAddr::Tcp(addr) => (addr.ip().to_string(), format!("trans=tcp,port={}", addr.port())),
        }
    }
}

fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove socket");
        }
    }
}

/// Servers keyed by canonical listen address.
#[derive(Default)]
pub struct ListenerRegistry {
    servers: HashMap<String, ServerRef>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The server for `address`, started if none is running.
    pub async fn get_or_create(
        &mut self,
        address: &Address,
        cancel: &CancellationToken,
        fs: Arc<dyn Filesystem>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<&mut ServerRef> {
        let key = address.to_string();
        if !self.servers.contains_key(&key) {
            let listen = address.to_listen_addr()?;
            let server = ServerRef::start(&listen, cancel, fs, handler).await?;
            self.servers.insert(key.clone(), server);
        }
        self.servers.get_mut(&key).context("listener registry entry vanished")
    }

    /// Drop one reference to the server for `address`, forgetting it once
    /// it has stopped.
    pub async fn release(&mut self, address: &Address) -> Result<()> {
        let key = address.to_string();
        let Some(server) = self.servers.get_mut(&key) else {
            anyhow::bail!("no listener registered for {key}");
        };
        let stopped = server.dec_ref().await;
        if !matches!(stopped, Ok(false)) {
            self.servers.remove(&key);
        }
        stopped.map(|_| ())
    }

    pub fn refs(&self, address: &Address) -> usize {
        self.servers.get(&address.to_string()).map_or(0, ServerRef::refs)
    }

    pub fn generation(&self, address: &Address) -> Option<Uuid> {
        self.servers.get(&address.to_string()).map(ServerRef::id)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Stop every server regardless of references.
    pub async fn shutdown(&mut self) {
        for (key, mut server) in self.servers.drain() {
            if let Err(e) = server.shutdown().await {
                tracing::warn!(listen = %key, error = %e, "9P server shutdown failed");
            }
        }
    }
}
