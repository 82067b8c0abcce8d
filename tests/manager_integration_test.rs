//! Integration tests for the binding manager
//!
//! Tests cover batch validation, per-header partitioning, commit visibility
//! and detach behavior using in-process attachers.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hostbind::binding::{
    Address, BindError, Binding, Header, HostApi, HostRequest, HostResponse, Namespace,
    ReleaseHandle, Request,
};
use hostbind::config::Config;
use hostbind::fs::{EmptyFs, Filesystem, FsResult};
use hostbind::manager::{drain, spawn_batch, BindingMetrics, HostAttacher, HostTable, Manager};
use hostbind::parse::{parse_requests, MountArgs};
use proptest::prelude::*;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Binds everything except the targets in `fail`, taking `delay` per bind.
/// Releases are recorded and fail for targets in `close_fails`.
#[derive(Clone, Default)]
struct Scripted {
    fail: HashSet<String>,
    close_fails: HashSet<String>,
    delay: Option<Duration>,
    released: Arc<Mutex<Vec<String>>>,
}

impl Scripted {
    fn failing(targets: &[&str]) -> Self {
        Self { fail: targets.iter().map(|t| t.to_string()).collect(), ..Default::default() }
    }

    fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }
}

impl HostAttacher for Scripted {
    fn attach(&self, requests: Vec<HostRequest>) -> mpsc::Receiver<HostResponse> {
        let this = self.clone();
        spawn_batch(CancellationToken::new(), requests, move |request| {
            let this = this.clone();
            async move {
                if let Some(delay) = this.delay {
                    tokio::time::sleep(delay).await;
                }
                let target = request.to_string();
                if this.fail.contains(&target) {
                    return Err(BindError::Host { target, reason: "mount refused".into() });
                }
                let fails = this.close_fails.contains(&target);
                let released = this.released.clone();
                Ok(Binding::new(
                    request,
                    ReleaseHandle::new(move || async move {
                        released.lock().unwrap().push(target.clone());
                        if fails {
                            anyhow::bail!("device busy: {target}");
                        }
                        Ok(())
                    }),
                ))
            }
        })
    }
}

fn empty_fs(_namespace: Namespace) -> FsResult<Arc<dyn Filesystem>> {
    Ok(Arc::new(EmptyFs))
}

fn builder(
    attacher: Scripted,
) -> impl Fn(Header, CancellationToken, Arc<dyn Filesystem>) -> anyhow::Result<Arc<dyn HostAttacher>>
+ Send
+ Sync {
    move |_, _, _| Ok(Arc::new(attacher.clone()) as Arc<dyn HostAttacher>)
}

fn manager_with(fuse: Scripted, ninep: Scripted) -> Manager {
    Manager::new(
        CancellationToken::new(),
        Arc::new(empty_fs),
        HostTable { fuse: Box::new(builder(fuse)), ninep: Box::new(builder(ninep)) },
    )
}

fn fuse(namespace: Namespace, path: &str) -> Request {
    Request::new(
        Header::new(HostApi::Fuse, namespace),
        HostRequest::new(Address::host_path(path).unwrap()),
    )
}

fn ninep(namespace: Namespace, path: &str) -> Request {
    Request::new(
        Header::new(HostApi::NineP, namespace),
        HostRequest::new(Address::host_path(path).unwrap()),
    )
}

async fn list(manager: &Manager) -> Vec<String> {
    drain(manager.list())
        .await
        .into_iter()
        .map(|(header, response)| {
            format!("{}{}", header.unwrap(), response.request.unwrap())
        })
        .collect()
}

#[tokio::test]
async fn test_duplicate_rejection_is_symmetric() {
    let a = fuse(Namespace::Ipfs, "/mnt/a");
    let b = fuse(Namespace::Ipfs, "/mnt/a/");

    for batch in [vec![a.clone(), b.clone()], vec![b.clone(), a.clone()]] {
        let manager = manager_with(Scripted::default(), Scripted::default());
        let outcomes = drain(manager.attach(batch)).await;

        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].0.is_none());
        assert!(matches!(outcomes[0].1.result, Err(BindError::DuplicateTarget(_))));
        assert!(!manager.exists(&a));
        assert!(list(&manager).await.is_empty());
    }
}

#[tokio::test]
async fn test_same_path_under_different_headers_is_not_duplicate() {
    let manager = manager_with(Scripted::default(), Scripted::default());
    let outcomes = drain(manager.attach(vec![
        fuse(Namespace::Ipfs, "/mnt/a"),
        ninep(Namespace::Ipfs, "/mnt/a"),
    ]))
    .await;
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|(_, r)| r.is_ok()));
}

#[tokio::test]
async fn test_already_bound_rejection_leaves_index_unchanged() {
    let manager = manager_with(Scripted::default(), Scripted::default());
    let a = fuse(Namespace::Ipfs, "/mnt/a");
    drain(manager.attach(vec![a.clone()])).await;

    let outcomes =
        drain(manager.attach(vec![fuse(Namespace::Ipfs, "/mnt/b"), a.clone()])).await;
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0].1.result, Err(BindError::AlreadyBound(_))));

    assert_eq!(list(&manager).await, vec!["/fuse/ipfs/host/mnt/a"]);
    assert!(!manager.exists(&fuse(Namespace::Ipfs, "/mnt/b")));
}

#[tokio::test]
async fn test_already_bound_error_ignores_submission_order() {
    let manager = manager_with(Scripted::default(), Scripted::default());
    let a = fuse(Namespace::Ipfs, "/mnt/a");
    let b = fuse(Namespace::Ipfs, "/mnt/b");
    drain(manager.attach(vec![a.clone(), b.clone()])).await;

    let mut reported = Vec::new();
    for batch in [vec![a.clone(), b.clone()], vec![b.clone(), a.clone()]] {
        let outcomes = drain(manager.attach(batch)).await;
        assert_eq!(outcomes.len(), 1);
        reported.push(outcomes[0].1.result.as_ref().unwrap_err().clone());
    }
    assert_eq!(reported[0], BindError::AlreadyBound("/fuse/ipfs/host/mnt/a".into()));
    assert_eq!(reported[0], reported[1]);
}

#[tokio::test]
async fn test_in_flight_target_is_claimed() {
    let manager = manager_with(Scripted::default(), Scripted::default());
    let a = fuse(Namespace::Ipfs, "/mnt/a");

    let first = manager.attach(vec![a.clone()]);
    let second = drain(manager.attach(vec![a.clone()])).await;
    assert!(matches!(second[0].1.result, Err(BindError::AlreadyBound(_))));

    let first = drain(first).await;
    assert!(first[0].1.is_ok());
    assert!(manager.exists(&a));
}

#[tokio::test]
async fn test_partitions_are_independent() {
    let ninep_attacher = Scripted::failing(&["/host/listen/x"]);
    let fuse_attacher = Scripted::default();
    let manager = manager_with(fuse_attacher.clone(), ninep_attacher);

    let a = fuse(Namespace::Ipfs, "/mnt/a");
    let x = ninep(Namespace::Ipns, "/listen/x");
    let outcomes = drain(manager.attach(vec![x.clone(), a.clone()])).await;

    assert_eq!(outcomes.len(), 2);
    let errors: Vec<_> = outcomes.iter().filter(|(_, r)| !r.is_ok()).collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, Some(x.header));
    assert!(matches!(errors[0].1.result, Err(BindError::Host { .. })));

    assert!(manager.exists(&a));
    assert!(!manager.exists(&x));
    assert!(fuse_attacher.released().is_empty());
    assert_eq!(list(&manager).await, vec!["/fuse/ipfs/host/mnt/a"]);
}

#[tokio::test]
async fn test_failed_batch_unwinds_within_partition() {
    let attacher = Scripted::failing(&["/host/mnt/b"]);
    let manager = manager_with(attacher.clone(), Scripted::default());

    let batch = vec![
        fuse(Namespace::Ipfs, "/mnt/a"),
        fuse(Namespace::Ipfs, "/mnt/b"),
        fuse(Namespace::Ipfs, "/mnt/c"),
    ];
    let outcomes = drain(manager.attach(batch.clone())).await;

    let kinds: Vec<_> = outcomes.iter().map(|(_, r)| r.result.as_ref().unwrap_err().kind()).collect();
    assert_eq!(kinds, vec!["unwound", "host", "skipped"]);
    assert_eq!(attacher.released(), vec!["/host/mnt/a"]);
    assert!(batch.iter().all(|r| !manager.exists(r)));
}

#[tokio::test]
async fn test_partition_keeps_submission_order() {
    let attacher = Scripted::failing(&["/host/mnt/z"]);
    let manager = manager_with(attacher.clone(), Scripted::default());

    let outcomes = drain(manager.attach(vec![
        fuse(Namespace::Ipfs, "/mnt/z"),
        fuse(Namespace::Ipfs, "/mnt/a"),
    ]))
    .await;

    let kinds: Vec<_> = outcomes.iter().map(|(_, r)| r.result.as_ref().unwrap_err().kind()).collect();
    assert_eq!(kinds, vec!["host", "skipped"]);
    assert!(attacher.released().is_empty());
}

#[tokio::test]
async fn test_commit_visible_after_stream_closes() {
    let manager = manager_with(Scripted::default(), Scripted::default());
    let a = fuse(Namespace::Files, "/mnt/files");

    let mut rx = manager.attach(vec![a.clone()]);
    while let Some(mut response) = rx.recv().await {
        while response.from_host.recv().await.is_some() {}
    }
    assert!(manager.exists(&a));
}

#[tokio::test]
async fn test_detach_removes_entry_even_if_release_fails() {
    let attacher = Scripted {
        close_fails: ["/host/mnt/a".to_string()].into_iter().collect(),
        ..Default::default()
    };
    let manager = manager_with(attacher.clone(), Scripted::default());
    let a = fuse(Namespace::Ipfs, "/mnt/a");
    drain(manager.attach(vec![a.clone()])).await;

    let outcomes = drain(manager.detach(vec![a.clone()])).await;
    assert_eq!(outcomes.len(), 1);
    match &outcomes[0].1.result {
        Err(BindError::Release { reason, .. }) => assert!(reason.contains("device busy")),
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(!manager.exists(&a));
    assert_eq!(attacher.released(), vec!["/host/mnt/a"]);

    let again = drain(manager.detach(vec![a])).await;
    assert!(matches!(again[0].1.result, Err(BindError::NotBound(_))));
}

#[tokio::test]
async fn test_list_is_ordered() {
    let manager = manager_with(Scripted::default(), Scripted::default());
    drain(manager.attach(vec![
        ninep(Namespace::Ipfs, "/n/z"),
        fuse(Namespace::Ipns, "/m/b"),
        fuse(Namespace::Ipfs, "/m/c"),
        fuse(Namespace::Ipfs, "/m/a"),
    ]))
    .await;

    assert_eq!(
        list(&manager).await,
        vec![
            "/fuse/ipfs/host/m/a",
            "/fuse/ipfs/host/m/c",
            "/fuse/ipns/host/m/b",
            "/9p/ipfs/host/n/z",
        ]
    );
}

#[tokio::test]
async fn test_metrics_track_active_bindings() {
    let registry = prometheus::Registry::new();
    let metrics = BindingMetrics::new(&registry).unwrap();
    let manager = Manager::with_metrics(
        CancellationToken::new(),
        Arc::new(empty_fs),
        HostTable {
            fuse: Box::new(builder(Scripted::default())),
            ninep: Box::new(builder(Scripted::default())),
        },
        metrics.clone(),
    );
    let header = Header::new(HostApi::Fuse, Namespace::Ipfs);
    let active = || metrics.active_bindings.with_label_values(&["fuse", "ipfs"]).get();

    drain(manager.attach(vec![fuse(Namespace::Ipfs, "/m/a"), fuse(Namespace::Ipfs, "/m/b")])).await;
    assert_eq!(active(), 2.0);

    drain(manager.detach(vec![Request::new(header, HostRequest::new(Address::host_path("/m/a").unwrap()))]))
        .await;
    assert_eq!(active(), 1.0);
}

#[test]
fn test_arg_parsed_and_config_filled_identities_match() {
    let config = Config::default();
    let filled = parse_requests(&MountArgs::default(), &config).unwrap();
    let explicit = parse_requests(
        &MountArgs {
            api: Some("fuse".into()),
            namespaces: Some("ipfs,ipns".into()),
            targets: Some("/ipfs/,//ipns".into()),
        },
        &config,
    )
    .unwrap();

    let ids = |requests: &[Request]| requests.iter().map(Request::identity).collect::<Vec<_>>();
    assert_eq!(ids(&filled), ids(&explicit));
}

proptest! {
    #[test]
    fn prop_identity_is_stable_and_round_trips(
        segments in prop::collection::vec("[a-z0-9_-]{1,8}", 1..5),
        api in prop::sample::select(HostApi::ALL.to_vec()),
        namespace in prop::sample::select(Namespace::ALL.to_vec()),
    ) {
        let path = format!("/{}", segments.join("/"));
        let request = Request::new(
            Header::new(api, namespace),
            HostRequest::new(Address::host_path(&path).unwrap()),
        );

        let identity = request.identity();
        prop_assert_eq!(&identity, &request.identity());

        let reparsed: Request = identity.parse().unwrap();
        prop_assert_eq!(reparsed.identity(), identity);
        prop_assert_eq!(reparsed.header, request.header);
    }
}

#[tokio::test]
async fn test_close_waits_for_batches_in_flight() {
    let slow = Scripted { delay: Some(Duration::from_millis(100)), ..Default::default() };
    let manager = manager_with(slow.clone(), Scripted::default());
    let a = fuse(Namespace::Ipfs, "/mnt/a");

    let pending = manager.attach(vec![a.clone()]);
    tokio::time::sleep(Duration::from_millis(20)).await;
    let closed = manager.close().await;

    assert_eq!(closed.len(), 1);
    assert!(closed[0].1.is_ok());
    assert!(!manager.exists(&a));
    assert_eq!(slow.released(), vec!["/host/mnt/a"]);

    let attached = drain(pending).await;
    assert_eq!(attached.len(), 1);
    assert!(attached[0].1.is_ok());

    let after = drain(manager.attach(vec![fuse(Namespace::Ipfs, "/mnt/b")])).await;
    assert!(matches!(after[0].1.result, Err(BindError::Cancelled)));
    assert!(manager.close().await.is_empty());
}
