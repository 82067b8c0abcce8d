// Index of live bindings
//
// Committed entries form a three level map: host API, then namespace, then
// target identity. Successful binds are first pushed to a stage and only
// become visible on commit. Targets that passed validation but have not been
// committed yet are held as claims so a concurrent batch cannot dispatch them
// a second time.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::metrics::BindingMetrics;
use super::router;
use crate::binding::{
    BindError, Binding, Header, HostApi, HostRequest, HostResponse, Namespace, Request, Response,
    UnwindStack,
};

type Committed = BTreeMap<HostApi, BTreeMap<Namespace, BTreeMap<String, Binding>>>;

#[derive(Default)]
struct IndexState {
    committed: Committed,
    stage: UnwindStack<Header>,
    claims: HashSet<(Header, String)>,
}

impl IndexState {
    fn get(&self, header: &Header, target: &str) -> Option<&Binding> {
        self.committed.get(&header.api)?.get(&header.namespace)?.get(target)
    }

    fn insert(&mut self, header: Header, binding: Binding) -> Option<Binding> {
        let target = binding.request.target.to_string();
        self.committed
            .entry(header.api)
            .or_default()
            .entry(header.namespace)
            .or_default()
            .insert(target, binding)
    }

    fn remove(&mut self, header: &Header, target: &str) -> Option<Binding> {
        let namespaces = self.committed.get_mut(&header.api)?;
        let targets = namespaces.get_mut(&header.namespace)?;
        let removed = targets.remove(target);
        if targets.is_empty() {
            namespaces.remove(&header.namespace);
        }
        if namespaces.is_empty() {
            self.committed.remove(&header.api);
        }
        removed
    }

    fn snapshot(&self) -> Vec<(Header, Vec<Binding>)> {
        let mut groups = Vec::new();
        for (api, namespaces) in &self.committed {
            for (namespace, targets) in namespaces {
                groups.push((Header::new(*api, *namespace), targets.values().cloned().collect()));
            }
        }
        groups
    }
}

/// Authoritative record of what is currently bound.
#[derive(Default)]
pub struct NameIndex {
    state: Mutex<IndexState>,
    metrics: Option<BindingMetrics>,
}

impl NameIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(metrics: BindingMetrics) -> Self {
        Self { state: Mutex::default(), metrics: Some(metrics) }
    }

    fn lock(&self) -> MutexGuard<'_, IndexState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a binding for this header and target is committed.
    pub fn exists(&self, request: &Request) -> bool {
        self.lock().get(&request.header, &request.target_identity()).is_some()
    }

    /// Whether the target is committed or claimed by a batch in flight.
    pub fn is_claimed(&self, request: &Request) -> bool {
        let state = self.lock();
        let target = request.target_identity();
        state.get(&request.header, &target).is_some()
            || state.claims.contains(&(request.header, target))
    }

    /// Reserve every target for dispatch, or none of them.
    ///
    /// Requests are checked in the order given; the first target that is
    /// already bound (or reserved by another batch) rejects the whole set.
    /// Callers wanting an order-independent error pass a sorted batch.
    pub fn claim(&self, requests: &[Request]) -> Result<(), BindError> {
        let mut state = self.lock();
        for request in requests {
            let target = request.target_identity();
            if state.get(&request.header, &target).is_some()
                || state.claims.contains(&(request.header, target))
            {
                return Err(BindError::AlreadyBound(request.identity()));
            }
        }
        for request in requests {
            state.claims.insert((request.header, request.target_identity()));
        }
        Ok(())
    }

    /// Drop the reservations held for `requests`.
    pub fn release_claims(&self, requests: &[Request]) {
        let mut state = self.lock();
        for request in requests {
            state.claims.remove(&(request.header, request.target_identity()));
        }
    }

    /// Stage a successful bind. It stays invisible until [`commit`].
    ///
    /// [`commit`]: NameIndex::commit
    pub fn push(&self, header: Header, binding: Binding) {
        self.lock().stage.push(header, binding);
    }

    /// Move everything staged into the committed map. Returns the number of
    /// entries committed.
    pub fn commit(&self) -> usize {
        let mut state = self.lock();
        let staged = state.stage.drain();
        let count = staged.len();
        for (header, binding) in staged {
            let target = binding.request.target.to_string();
            state.claims.remove(&(header, target.clone()));
            if let Some(metrics) = &self.metrics {
                metrics.bound(&header, 1);
            }
            if state.insert(header, binding).is_some() {
                tracing::error!(header = %header, request = %target, "replaced a live binding");
            }
        }
        if count > 0 {
            tracing::debug!(count, "committed bindings");
        }
        count
    }

    /// Number of committed bindings.
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.committed.values().flat_map(|n| n.values()).map(|t| t.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().committed.is_empty()
    }

    /// Every committed binding, as requests that would detach it.
    pub fn requests(&self) -> Vec<Request> {
        self.lock()
            .snapshot()
            .into_iter()
            .flat_map(|(header, bindings)| {
                bindings.into_iter().map(move |b| Request::new(header, b.request))
            })
            .collect()
    }

    /// All committed bindings grouped by header, ordered by API, namespace
    /// and target.
    pub fn list(&self) -> mpsc::Receiver<Response> {
        let groups = self.lock().snapshot();
        let (tx, rx) = mpsc::channel(groups.len().max(1));
        for (header, bindings) in groups {
            let (host_tx, host_rx) = mpsc::channel(bindings.len().max(1));
            for binding in bindings {
                // sized to fit
                let _ = host_tx.try_send(HostResponse::bound(binding));
            }
            let _ = tx.try_send(Response { header: Some(header), from_host: host_rx });
        }
        rx
    }

    /// Release and forget the bindings matching `requests`.
    ///
    /// Entries are removed up front, so they are gone from the index whether
    /// or not their release succeeds. Requests with no live binding answer
    /// [`BindError::NotBound`].
    pub fn detach(&self, requests: Vec<Request>) -> mpsc::Receiver<Response> {
        let removals: Vec<(Request, Option<Binding>)> = {
            let mut state = self.lock();
            requests
                .into_iter()
                .map(|request| {
                    let binding = state.remove(&request.header, &request.target_identity());
                    (request, binding)
                })
                .collect()
        };

        let metrics = self.metrics.clone();
        let partitions = router::partition(removals, |(request, _)| request.header);
        router::fan_out(CancellationToken::new(), partitions, move |header, batch, tx| {
            let metrics = metrics.clone();
            release_all(header, batch, tx, metrics)
        })
    }
}

async fn release_all(
    header: Header,
    batch: Vec<(Request, Option<Binding>)>,
    tx: mpsc::Sender<HostResponse>,
    metrics: Option<BindingMetrics>,
) {
    for (request, binding) in batch {
        let response = match binding {
            None => {
                let identity = request.identity();
                HostResponse::failed(request.host, BindError::NotBound(identity))
            }
            Some(binding) => {
                if let Some(metrics) = &metrics {
                    metrics.released(&header, 1);
                }
                release_one(&header, request.host, binding).await
            }
        };
        if let Some(metrics) = &metrics {
            metrics.record("detach", &header, response.result.as_ref().map(|_| ()));
        }
        if tx.send(response).await.is_err() {
            tracing::debug!(header = %header, "detach response dropped by caller");
        }
    }
}

async fn release_one(header: &Header, request: HostRequest, binding: Binding) -> HostResponse {
    match binding.close().await {
        Ok(()) => {
            tracing::info!(header = %header, request = %request, "released");
            HostResponse::bound(binding)
        }
        Err(err) => {
            tracing::warn!(header = %header, request = %request, error = %err, "release failed");
            let error = BindError::Release { target: request.to_string(), reason: format!("{err:#}") };
            HostResponse::failed(request, error)
        }
    }
}
