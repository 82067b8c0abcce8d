use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::hosts::{FilesystemFactory, HostAttacher, HostTable};
use super::index::NameIndex;
use super::metrics::BindingMetrics;
use super::router;
use crate::binding::{BindError, Header, HostRequest, HostResponse, Namespace, Request, Response};
use crate::fs::Filesystem;

/// Filesystems and attachers built so far. Failures are kept as their
/// message and replayed instead of retrying construction.
#[derive(Default)]
struct Instances {
    filesystems: HashMap<Namespace, Result<Arc<dyn Filesystem>, String>>,
    attachers: HashMap<Header, Result<Arc<dyn HostAttacher>, String>>,
}

struct Inner {
    cancel: CancellationToken,
    index: NameIndex,
    filesystems: Arc<dyn FilesystemFactory>,
    hosts: HostTable,
    instances: Mutex<Instances>,
    metrics: Option<BindingMetrics>,
    /// Cloned by every batch in flight; taken when the manager closes.
    in_flight: StdMutex<Option<mpsc::Sender<()>>>,
    /// Yields `None` once every in-flight sender is gone.
    settled: Mutex<mpsc::Receiver<()>>,
}

/// Binding manager
///
/// Validates and partitions bind requests, drives the host attachers,
/// and records what ended up bound. Cloning shares the same state.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

impl Manager {
    pub fn new(
        cancel: CancellationToken,
        filesystems: Arc<dyn FilesystemFactory>,
        hosts: HostTable,
    ) -> Self {
        Self::build(cancel, filesystems, hosts, None)
    }

    pub fn with_metrics(
        cancel: CancellationToken,
        filesystems: Arc<dyn FilesystemFactory>,
        hosts: HostTable,
        metrics: BindingMetrics,
    ) -> Self {
        Self::build(cancel, filesystems, hosts, Some(metrics))
    }

    fn build(
        cancel: CancellationToken,
        filesystems: Arc<dyn FilesystemFactory>,
        hosts: HostTable,
        metrics: Option<BindingMetrics>,
    ) -> Self {
        let index = match &metrics {
            Some(metrics) => NameIndex::with_metrics(metrics.clone()),
            None => NameIndex::new(),
        };
        let (in_flight, settled) = mpsc::channel(1);
        let inner = Inner {
            cancel,
            index,
            filesystems,
            hosts,
            instances: Mutex::new(Instances::default()),
            metrics,
            in_flight: StdMutex::new(Some(in_flight)),
            settled: Mutex::new(settled),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Bind every request.
    ///
    /// A batch naming the same target twice, or a target that is already
    /// bound, is rejected as a whole before anything is dispatched: the
    /// stream then carries a single response with no header. Otherwise one
    /// response stream per header follows, with one result per target.
    /// Each header's successes are committed before its stream closes.
    pub fn attach(&self, requests: Vec<Request>) -> mpsc::Receiver<Response> {
        // taken before the claim so that `close` either waits for this batch
        // or this batch sees the manager closed
        let Some(in_flight) = self.inner.enter() else {
            return rejected(BindError::Cancelled);
        };
        if self.inner.cancel.is_cancelled() {
            return rejected(BindError::Cancelled);
        }
        if let Err(err) = router::check(&self.inner.index, &requests) {
            tracing::warn!(error = %err, "attach batch rejected");
            return rejected(err);
        }

        let inner = self.inner.clone();
        router::dispatch(self.inner.cancel.clone(), requests, move |header, batch, tx| {
            let guard = PartitionGuard {
                inner: inner.clone(),
                batch: batch.clone(),
                _in_flight: in_flight.clone(),
            };
            attach_partition(inner.clone(), header, batch, tx, guard)
        })
    }

    /// Release the bindings for `requests` and remove them from the index.
    pub fn detach(&self, requests: Vec<Request>) -> mpsc::Receiver<Response> {
        self.inner.index.detach(requests)
    }

    pub fn list(&self) -> mpsc::Receiver<Response> {
        self.inner.index.list()
    }

    pub fn exists(&self, request: &Request) -> bool {
        self.inner.index.exists(request)
    }

    /// Refuse new batches, wait for the ones in flight to commit, detach
    /// everything, close the filesystems, then stop the attachers.
    pub async fn close(&self) -> Vec<(Option<Header>, HostResponse)> {
        let in_flight = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner()).take();
        drop(in_flight);
        if self.inner.settled.lock().await.recv().await.is_some() {
            tracing::error!("unexpected message on the in-flight channel");
        }

        let requests = self.inner.index.requests();
        tracing::info!(count = requests.len(), "closing binding manager");
        let outcomes = drain(self.detach(requests)).await;

        let filesystems: Vec<Arc<dyn Filesystem>> = {
            let mut instances = self.inner.instances.lock().await;
            instances.attachers.clear();
            instances.filesystems.drain().filter_map(|(_, fs)| fs.ok()).collect()
        };
        for fs in filesystems {
            if let Err(err) = fs.close().await {
                tracing::warn!(error = %err, "filesystem close failed");
            }
        }

        self.inner.cancel.cancel();
        outcomes
    }
}

fn rejected(error: BindError) -> mpsc::Receiver<Response> {
    let (tx, rx) = mpsc::channel(1);
    let _ = tx.try_send(Response::rejected(error));
    rx
}

impl Inner {
    /// A token marking one batch in flight, or `None` once closing began.
    fn enter(&self) -> Option<mpsc::Sender<()>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Resolve the attacher for `header`, constructing it (and the namespace
    /// filesystem) on first use.
    async fn attacher(&self, header: Header) -> Result<Arc<dyn HostAttacher>, BindError> {
        let mut instances = self.instances.lock().await;
        if let Some(cached) = instances.attachers.get(&header) {
            return cached.clone().map_err(|reason| BindError::Construction { header, reason });
        }

        let fs = match instances.filesystems.get(&header.namespace) {
            Some(cached) => cached.clone(),
            None => {
                let created = self.filesystems.create(header.namespace).await.map_err(|e| {
                    tracing::error!(namespace = %header.namespace, error = %e, "filesystem construction failed");
                    e.to_string()
                });
                instances.filesystems.insert(header.namespace, created.clone());
                created
            }
        };

        let attacher = fs.and_then(|fs| {
            self.hosts
                .builder(header.api)
                .build(header, self.cancel.child_token(), fs)
                .map_err(|e| {
                    tracing::error!(header = %header, error = %e, "attacher construction failed");
                    format!("{e:#}")
                })
        });
        if attacher.is_ok() {
            tracing::debug!(header = %header, "attacher constructed");
        }
        instances.attachers.insert(header, attacher.clone());
        attacher.map_err(|reason| BindError::Construction { header, reason })
    }

    fn record(&self, header: &Header, result: Result<(), &BindError>) {
        if let Some(metrics) = &self.metrics {
            metrics.record("attach", header, result);
        }
    }
}

/// Commits what a partition bound and drops its claims when the partition
/// ends, including by panic.
struct PartitionGuard {
    inner: Arc<Inner>,
    batch: Vec<Request>,
    _in_flight: mpsc::Sender<()>,
}

impl Drop for PartitionGuard {
    fn drop(&mut self) {
        self.inner.index.commit();
        self.inner.index.release_claims(&self.batch);
    }
}

async fn attach_partition(
    inner: Arc<Inner>,
    header: Header,
    batch: Vec<Request>,
    tx: mpsc::Sender<HostResponse>,
    _guard: PartitionGuard,
) {
    let host_requests: Vec<HostRequest> = batch.iter().map(|r| r.host.clone()).collect();

    match inner.attacher(header).await {
        Err(err) => {
            for request in host_requests {
                inner.record(&header, Err(&err));
                forward(&inner.cancel, &tx, HostResponse::failed(request, err.clone())).await;
            }
        }
        Ok(attacher) => {
            let mut pending: HashSet<HostRequest> = host_requests.iter().cloned().collect();
            let mut stream = attacher.attach(host_requests.clone());

            // Drained to the end even when cancelled, so nothing the
            // attacher did bind is left out of the index.
            while let Some(response) = stream.recv().await {
                if let Some(request) = &response.request {
                    pending.remove(request);
                }
                match &response.result {
                    Ok(binding) => {
                        tracing::info!(header = %header, request = %binding.request, "bound");
                        inner.index.push(header, binding.clone());
                        inner.record(&header, Ok(()));
                    }
                    Err(err) => inner.record(&header, Err(err)),
                }
                forward(&inner.cancel, &tx, response).await;
            }

            for request in host_requests.into_iter().filter(|r| pending.contains(r)) {
                let err = if inner.cancel.is_cancelled() {
                    BindError::Cancelled
                } else {
                    BindError::Host {
                        target: request.to_string(),
                        reason: "attacher returned no response".to_string(),
                    }
                };
                inner.record(&header, Err(&err));
                forward(&inner.cancel, &tx, HostResponse::failed(request, err)).await;
            }
        }
    }
}

async fn forward(cancel: &CancellationToken, tx: &mpsc::Sender<HostResponse>, response: HostResponse) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        sent = tx.send(response) => {
            if sent.is_err() {
                tracing::debug!("attach response dropped by caller");
            }
        }
    }
}

/// Collect a response stream, pairing every result with its header.
pub async fn drain(mut rx: mpsc::Receiver<Response>) -> Vec<(Option<Header>, HostResponse)> {
    let mut out = Vec::new();
    while let Some(mut response) = rx.recv().await {
        while let Some(host) = response.from_host.recv().await {
            out.push((response.header, host));
        }
    }
    out
}
