// Validation, partitioning and concurrent fan-out of request batches

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::index::NameIndex;
use crate::binding::{BindError, Header, HostResponse, Request, Response};

/// Reject a batch that names a target twice or touches a bound target.
///
/// Both checks walk a copy sorted by identity, so the reported target is
/// the same for any input order while `requests` keeps the submission
/// order. On success every target is claimed in `index`; the caller must
/// release the claims once the batch has been committed.
pub fn check(index: &NameIndex, requests: &[Request]) -> Result<(), BindError> {
    let mut sorted: Vec<(String, &Request)> =
        requests.iter().map(|request| (request.identity(), request)).collect();
    sorted.sort_unstable_by(|a, b| a.0.cmp(&b.0));

    if let Some(pair) = sorted.windows(2).find(|pair| pair[0].0 == pair[1].0) {
        return Err(BindError::DuplicateTarget(pair[0].0.clone()));
    }

    let sorted: Vec<Request> = sorted.into_iter().map(|(_, request)| request.clone()).collect();
    index.claim(&sorted)
}

/// Split `items` into contiguous runs sharing a header, ordered by header.
/// The order of items within a run is preserved.
pub fn partition<T>(mut items: Vec<T>, header_of: impl Fn(&T) -> Header) -> Vec<(Header, Vec<T>)> {
    items.sort_by_key(|item| header_of(item));

    let mut partitions: Vec<(Header, Vec<T>)> = Vec::new();
    for item in items {
        let header = header_of(&item);
        match partitions.last_mut() {
            Some((current, batch)) if *current == header => batch.push(item),
            _ => partitions.push((header, vec![item])),
        }
    }
    partitions
}

/// Run `method` once per partition, concurrently.
///
/// Every partition gets its own response stream, announced on the returned
/// channel. The returned channel closes only after every partition task has
/// finished, not merely started.
pub fn fan_out<T, F, Fut>(
    cancel: CancellationToken,
    partitions: Vec<(Header, Vec<T>)>,
    method: F,
) -> mpsc::Receiver<Response>
where
    T: Send + 'static,
    F: Fn(Header, Vec<T>, mpsc::Sender<HostResponse>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(partitions.len().max(1));
    let method = Arc::new(method);
    let mut tasks = JoinSet::new();

    for (header, batch) in partitions {
        let tx = tx.clone();
        let cancel = cancel.clone();
        let method = method.clone();
        tasks.spawn(async move {
            let (host_tx, host_rx) = mpsc::channel(batch.len().max(1));
            let response = Response { header: Some(header), from_host: host_rx };
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(header = %header, "dispatch cancelled before announce");
                }
                sent = tx.send(response) => {
                    if sent.is_err() {
                        tracing::debug!(header = %header, "response stream dropped by caller");
                    }
                }
            }
            drop(tx);
            tracing::debug!(header = %header, count = batch.len(), "dispatching partition");
            method(header, batch, host_tx).await;
        });
    }

    tokio::spawn(async move {
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "partition task failed");
            }
        }
        // every partition is done; dropping the last sender closes the stream
        drop(tx);
    });

    rx
}

/// Partition `requests` by header and hand each run to `method`.
pub fn dispatch<F, Fut>(
    cancel: CancellationToken,
    requests: Vec<Request>,
    method: F,
) -> mpsc::Receiver<Response>
where
    F: Fn(Header, Vec<Request>, mpsc::Sender<HostResponse>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fan_out(cancel, partition(requests, |r| r.header), method)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::binding::{Address, HostApi, HostRequest, Namespace};

    fn request(api: HostApi, ns: Namespace, path: &str) -> Request {
        Request::new(Header::new(api, ns), HostRequest::new(Address::host_path(path).unwrap()))
    }

    #[test]
    fn test_check_rejects_duplicates_in_any_order() {
        let a = request(HostApi::Fuse, Namespace::Ipfs, "/mnt/a");
        let b = request(HostApi::Fuse, Namespace::Ipfs, "/mnt/b");
        let a_again = request(HostApi::Fuse, Namespace::Ipfs, "/mnt/./a/");

        for batch in [
            vec![a.clone(), b.clone(), a_again.clone()],
            vec![a_again.clone(), a.clone(), b.clone()],
        ] {
            let index = NameIndex::new();
            let err = check(&index, &batch).unwrap_err();
            assert_eq!(err, BindError::DuplicateTarget("/fuse/ipfs/host/mnt/a".into()));
            assert!(!index.is_claimed(&b));
        }
    }

    #[test]
    fn test_check_claims_on_success() {
        let index = NameIndex::new();
        let batch = vec![
            request(HostApi::NineP, Namespace::Ipns, "/n/x"),
            request(HostApi::Fuse, Namespace::Ipfs, "/mnt/b"),
            request(HostApi::Fuse, Namespace::Ipfs, "/mnt/a"),
        ];
        check(&index, &batch).unwrap();
        assert!(batch.iter().all(|r| index.is_claimed(r)));

        let again = vec![request(HostApi::Fuse, Namespace::Ipfs, "/mnt/a")];
        assert!(matches!(check(&index, &again), Err(BindError::AlreadyBound(_))));
    }

    #[test]
    fn test_partition_groups_by_header() {
        let requests = vec![
            request(HostApi::NineP, Namespace::Ipfs, "/n/a"),
            request(HostApi::Fuse, Namespace::Ipns, "/mnt/b"),
            request(HostApi::Fuse, Namespace::Ipfs, "/mnt/z"),
            request(HostApi::Fuse, Namespace::Ipfs, "/mnt/a"),
        ];
        let partitions = partition(requests, |r| r.header);
        let headers: Vec<String> = partitions.iter().map(|(h, _)| h.to_string()).collect();
        assert_eq!(headers, vec!["/fuse/ipfs", "/fuse/ipns", "/9p/ipfs"]);
        // stable within a run
        assert_eq!(partitions[0].1[0].target_identity(), "/host/mnt/z");
        assert_eq!(partitions[0].1.len(), 2);
    }

    #[tokio::test]
    async fn test_fan_out_closes_after_all_partitions_finish() {
        let requests = vec![
            request(HostApi::Fuse, Namespace::Ipfs, "/mnt/a"),
            request(HostApi::NineP, Namespace::Ipfs, "/n/a"),
        ];
        let finished = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = finished.clone();

        let mut rx = dispatch(CancellationToken::new(), requests, move |header, _batch, _tx| {
            let counter = counter.clone();
            async move {
                if header.api == HostApi::NineP {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        });

        let mut announced = 0;
        while rx.recv().await.is_some() {
            announced += 1;
        }
        assert_eq!(announced, 2);
        assert_eq!(finished.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fan_out_still_runs_method_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = ran.clone();

        let requests = vec![request(HostApi::Fuse, Namespace::Ipfs, "/mnt/a")];
        let mut rx = dispatch(cancel, requests, move |_header, _batch, _tx| {
            let flag = flag.clone();
            async move { flag.store(true, std::sync::atomic::Ordering::SeqCst) }
        });
        while rx.recv().await.is_some() {}
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
    }
}
