//! Integration tests for the download coordinator

mod common;

use async_trait::async_trait;
use bridge_traits::error::BridgeError;
use bridge_traits::{ByteStream, HttpClient, HttpRequest, HttpResponse, NetworkType};
use bytes::Bytes;
use common::{eventually, open_store, url, GatedHttpClient, ManualClock, MemoryFileSystem};
use core_runtime::events::{CoreEvent, DownloadEvent, EventBus};
use core_streaming::{
    DownloadCoordinator, DownloadPriority, DownloadSettings, DownloadState, NetworkObserver,
    NetworkState, QualityTier, StreamingError, TrackCacheStore, TrackIdentity,
};
use futures::future::join_all;
use futures::StreamExt;
use mockall::mock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

mock! {
    pub Http {}

    #[async_trait]
    impl HttpClient for Http {
        async fn download_stream(
            &self,
            request: HttpRequest,
        ) -> bridge_traits::error::Result<(HttpResponse, ByteStream)>;
    }
}

struct Harness {
    store: Arc<TrackCacheStore>,
    network: NetworkObserver,
    coordinator: DownloadCoordinator,
    events: tokio::sync::broadcast::Receiver<CoreEvent>,
}

async fn harness(http: Arc<dyn HttpClient>, settings: DownloadSettings, capacity: u64) -> Harness {
    let fs = MemoryFileSystem::new();
    let clock = ManualClock::new();
    let store = open_store(&fs, &clock, capacity).await;
    let network = NetworkObserver::fixed(NetworkState::online(NetworkType::WiFi));
    let bus = EventBus::new(64);
    let events = bus.subscribe();
    let coordinator =
        DownloadCoordinator::new(store.clone(), http, network.clone(), settings, Some(bus));
    Harness {
        store,
        network,
        coordinator,
        events,
    }
}

fn id(track_id: &str) -> TrackIdentity {
    TrackIdentity::new(track_id, QualityTier::Kbps128)
}

fn url_of(identity: &TrackIdentity) -> String {
    url(&identity.track_id, identity.quality)
}

fn fast_settings() -> DownloadSettings {
    DownloadSettings {
        max_concurrent_downloads: 2,
        download_timeout: Duration::from_secs(5),
        max_attempts: 2,
        retry_backoff: Duration::from_millis(10),
    }
}

fn ok_body(data: &'static [u8]) -> bridge_traits::error::Result<(HttpResponse, ByteStream)> {
    let response = HttpResponse {
        status: 200,
        headers: HashMap::new(),
        content_length: Some(data.len() as u64),
    };
    let stream = futures::stream::iter(vec![Ok::<_, BridgeError>(Bytes::from_static(data))]).boxed();
    Ok((response, stream))
}

fn drain(events: &mut tokio::sync::broadcast::Receiver<CoreEvent>) -> Vec<DownloadEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let CoreEvent::Download(event) = event {
            out.push(event);
        }
    }
    out
}

#[tokio::test]
async fn test_concurrent_requests_share_one_download() {
    let http = GatedHttpClient::closed();
    let identity = id("t1");
    http.serve(url_of(&identity), b"0123456789");
    let h = harness(http.clone(), fast_settings(), 1_000).await;

    let handles: Vec<_> = (0..5)
        .map(|_| {
            h.coordinator
                .request(identity.clone(), &url_of(&identity), DownloadPriority::Immediate)
                .unwrap()
        })
        .collect();
    assert_eq!(h.coordinator.active_count(), 1);

    http.open();
    let results = join_all(handles.into_iter().map(|handle| handle.wait())).await;

    let paths: Vec<_> = results
        .into_iter()
        .map(|r| r.unwrap().local_path)
        .collect();
    assert!(paths.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(http.requests_for(&url_of(&identity)), 1);
    assert_eq!(h.store.stats().entry_count, 1);
    assert!(eventually(|| h.coordinator.active_count() == 0).await);
}

#[tokio::test]
async fn test_cached_identity_resolves_without_fetch() {
    let http = GatedHttpClient::new();
    let h = harness(http.clone(), fast_settings(), 1_000).await;
    let identity = id("t1");
    h.store
        .put(&identity, Bytes::from_static(b"cached"))
        .await
        .unwrap();

    let handle = h
        .coordinator
        .request(identity.clone(), &url_of(&identity), DownloadPriority::Immediate)
        .unwrap();

    assert!(matches!(handle.try_result(), Some(Ok(_))));
    assert_eq!(handle.wait().await.unwrap().size_bytes, 6);
    assert_eq!(http.request_count(), 0);
}

#[tokio::test]
async fn test_offline_refuses_new_fetches() {
    let http = GatedHttpClient::new();
    let h = harness(http.clone(), fast_settings(), 1_000).await;
    let cached = id("cached");
    h.store
        .put(&cached, Bytes::from_static(b"x"))
        .await
        .unwrap();
    h.network.update(NetworkState::offline());

    let err = h
        .coordinator
        .request(id("t1"), &url_of(&id("t1")), DownloadPriority::Immediate)
        .unwrap_err();
    assert_eq!(
        err,
        StreamingError::Offline {
            track_id: "t1".to_string()
        }
    );

    let handle = h
        .coordinator
        .request(cached.clone(), &url_of(&cached), DownloadPriority::Immediate)
        .unwrap();
    assert!(handle.wait().await.is_ok());
    assert_eq!(http.request_count(), 0);
}

#[tokio::test]
async fn test_cancel_resolves_waiters_and_stores_nothing() {
    let http = GatedHttpClient::closed();
    let identity = id("t1");
    http.serve(url_of(&identity), b"0123456789");
    let mut h = harness(http.clone(), fast_settings(), 1_000).await;

    let first = h
        .coordinator
        .request(identity.clone(), &url_of(&identity), DownloadPriority::Immediate)
        .unwrap();
    let second = h
        .coordinator
        .request(identity.clone(), &url_of(&identity), DownloadPriority::Immediate)
        .unwrap();
    assert!(eventually(|| http.request_count() == 1).await);

    assert!(h.coordinator.cancel(&identity));
    assert!(!h.coordinator.cancel(&identity));

    assert!(first.wait().await.unwrap_err().is_cancelled());
    assert!(second.wait().await.unwrap_err().is_cancelled());

    http.open();
    assert!(eventually(|| h.coordinator.running_count() == 0).await);
    assert!(!h.store.contains(&identity));
    assert_eq!(h.store.stats().entry_count, 0);

    let events = drain(&mut h.events);
    let cancelled = events
        .iter()
        .filter(|e| matches!(e, DownloadEvent::Cancelled { .. }))
        .count();
    assert_eq!(cancelled, 1);
    assert!(!events
        .iter()
        .any(|e| matches!(e, DownloadEvent::Completed { .. })));
}

#[tokio::test]
async fn test_immediate_requests_jump_the_queue() {
    let http = GatedHttpClient::closed();
    for track in ["p1", "p2", "i1"] {
        http.serve(url_of(&id(track)), b"abcd");
    }
    let settings = DownloadSettings {
        max_concurrent_downloads: 1,
        ..fast_settings()
    };
    let h = harness(http.clone(), settings, 1_000).await;

    let p1 = h
        .coordinator
        .request(id("p1"), &url_of(&id("p1")), DownloadPriority::Preload)
        .unwrap();
    let p2 = h
        .coordinator
        .request(id("p2"), &url_of(&id("p2")), DownloadPriority::Preload)
        .unwrap();
    let i1 = h
        .coordinator
        .request(id("i1"), &url_of(&id("i1")), DownloadPriority::Immediate)
        .unwrap();

    let tasks = h.coordinator.active_tasks();
    assert_eq!(tasks.len(), 3);
    assert_eq!(tasks[0].state, DownloadState::Running);
    assert_eq!(tasks[1].state, DownloadState::Queued);
    assert_eq!(tasks[2].state, DownloadState::Queued);

    http.open();
    for handle in [p1, p2, i1] {
        handle.wait().await.unwrap();
    }

    assert_eq!(
        http.requested_urls(),
        vec![url_of(&id("p1")), url_of(&id("i1")), url_of(&id("p2"))]
    );
}

#[tokio::test]
async fn test_preloads_leave_a_slot_for_immediate_requests() {
    let http = GatedHttpClient::closed();
    for track in ["p1", "p2", "i1"] {
        http.serve(url_of(&id(track)), b"abcd");
    }
    let h = harness(http.clone(), fast_settings(), 1_000).await;

    let _p1 = h
        .coordinator
        .request(id("p1"), &url_of(&id("p1")), DownloadPriority::Preload)
        .unwrap();
    let _p2 = h
        .coordinator
        .request(id("p2"), &url_of(&id("p2")), DownloadPriority::Preload)
        .unwrap();
    assert_eq!(h.coordinator.running_count(), 1);

    let i1 = h
        .coordinator
        .request(id("i1"), &url_of(&id("i1")), DownloadPriority::Immediate)
        .unwrap();
    assert_eq!(h.coordinator.running_count(), 2);

    let states: HashMap<_, _> = h
        .coordinator
        .active_tasks()
        .into_iter()
        .map(|t| (t.identity.track_id, t.state))
        .collect();
    assert_eq!(states["p1"], DownloadState::Running);
    assert_eq!(states["p2"], DownloadState::Queued);
    assert_eq!(states["i1"], DownloadState::Running);

    http.open();
    i1.wait().await.unwrap();
    assert!(eventually(|| h.coordinator.active_count() == 0).await);
    assert_eq!(h.store.stats().entry_count, 3);
}

#[tokio::test]
async fn test_immediate_request_upgrades_queued_preload() {
    let http = GatedHttpClient::closed();
    for track in ["p1", "p2"] {
        http.serve(url_of(&id(track)), b"abcd");
    }
    let h = harness(http.clone(), fast_settings(), 1_000).await;

    let _p1 = h
        .coordinator
        .request(id("p1"), &url_of(&id("p1")), DownloadPriority::Preload)
        .unwrap();
    let _p2 = h
        .coordinator
        .request(id("p2"), &url_of(&id("p2")), DownloadPriority::Preload)
        .unwrap();
    assert_eq!(h.coordinator.running_count(), 1);

    let upgraded = h
        .coordinator
        .request(id("p2"), &url_of(&id("p2")), DownloadPriority::Immediate)
        .unwrap();
    assert_eq!(h.coordinator.running_count(), 2);

    let p2 = h
        .coordinator
        .active_tasks()
        .into_iter()
        .find(|t| t.identity.track_id == "p2")
        .unwrap();
    assert_eq!(p2.priority, DownloadPriority::Immediate);
    assert_eq!(p2.state, DownloadState::Running);

    http.open();
    upgraded.wait().await.unwrap();
    assert_eq!(http.requests_for(&url_of(&id("p2"))), 1);
}

#[tokio::test]
async fn test_transient_failure_is_retried_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut http = MockHttp::new();
    let counter = calls.clone();
    http.expect_download_stream().times(2).returning(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(BridgeError::OperationFailed("connection reset".to_string()))
        } else {
            ok_body(b"payload")
        }
    });
    let mut h = harness(Arc::new(http), fast_settings(), 1_000).await;

    let entry = h
        .coordinator
        .request(id("t1"), &url_of(&id("t1")), DownloadPriority::Immediate)
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(entry.size_bytes, 7);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    assert!(eventually(|| h.coordinator.active_count() == 0).await);
    let events = drain(&mut h.events);
    assert!(events.iter().any(|e| matches!(
        e,
        DownloadEvent::Retrying { attempt: 1, .. }
    )));
    assert!(matches!(events.last(), Some(DownloadEvent::Completed { .. })));
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let mut http = MockHttp::new();
    http.expect_download_stream().times(1).returning(|request| {
        Err(BridgeError::HttpStatus {
            status: 404,
            url: request.url,
        })
    });
    let h = harness(Arc::new(http), fast_settings(), 1_000).await;

    let err = h
        .coordinator
        .request(id("t1"), &url_of(&id("t1")), DownloadPriority::Immediate)
        .unwrap()
        .wait()
        .await
        .unwrap_err();

    match err {
        StreamingError::DownloadFailed { track_id, cause, .. } => {
            assert_eq!(track_id, "t1");
            assert!(cause.contains("404"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_persistent_failure_gives_up_after_two_attempts() {
    let mut http = MockHttp::new();
    http.expect_download_stream()
        .times(2)
        .returning(|_| Err(BridgeError::OperationFailed("unreachable".to_string())));
    let h = harness(Arc::new(http), fast_settings(), 1_000).await;

    let err = h
        .coordinator
        .request(id("t1"), &url_of(&id("t1")), DownloadPriority::Immediate)
        .unwrap()
        .wait()
        .await
        .unwrap_err();

    assert!(matches!(err, StreamingError::DownloadFailed { .. }));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_stalled_download_times_out() {
    let http = GatedHttpClient::closed();
    let identity = id("t1");
    http.serve(url_of(&identity), b"never arrives");
    let settings = DownloadSettings {
        download_timeout: Duration::from_millis(50),
        max_attempts: 2,
        ..fast_settings()
    };
    let h = harness(http.clone(), settings, 1_000).await;

    let err = h
        .coordinator
        .request(identity.clone(), &url_of(&identity), DownloadPriority::Immediate)
        .unwrap()
        .wait()
        .await
        .unwrap_err();

    assert_eq!(
        err,
        StreamingError::DownloadTimeout {
            track_id: "t1".to_string(),
            quality: QualityTier::Kbps128,
            timeout: Duration::from_millis(50),
        }
    );
    assert_eq!(http.requests_for(&url_of(&identity)), 2);
    assert!(!h.store.contains(&identity));
}

#[tokio::test]
async fn test_body_larger_than_cache_fails_as_download_failure() {
    let http = GatedHttpClient::new();
    let identity = id("t1");
    http.serve(url_of(&identity), &[0u8; 64]);
    let h = harness(http.clone(), fast_settings(), 32).await;

    let err = h
        .coordinator
        .request(identity.clone(), &url_of(&identity), DownloadPriority::Immediate)
        .unwrap()
        .wait()
        .await
        .unwrap_err();

    match err {
        StreamingError::DownloadFailed {
            track_id,
            quality,
            cause,
        } => {
            assert_eq!(track_id, identity.track_id);
            assert_eq!(quality, identity.quality);
            assert!(cause.contains("Cache storage full"), "cause: {cause}");
            assert!(cause.contains("64"), "cause: {cause}");
        }
        other => panic!("expected DownloadFailed, got {other:?}"),
    }
    assert_eq!(http.requests_for(&url_of(&identity)), 1);
}

#[test]
fn test_request_without_runtime_stays_queued_until_one_is_available() {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let http = GatedHttpClient::new();
    let identity = id("t1");
    http.serve(url_of(&identity), b"payload");
    let fs = MemoryFileSystem::new();
    let clock = ManualClock::new();
    let store = rt.block_on(open_store(&fs, &clock, 1_000));
    let network = NetworkObserver::fixed(NetworkState::online(NetworkType::WiFi));

    // Built and called with no runtime in scope.
    let coordinator = DownloadCoordinator::new(store.clone(), http.clone(), network, fast_settings(), None);
    let first = coordinator
        .request(identity.clone(), &url_of(&identity), DownloadPriority::Preload)
        .unwrap();

    assert_eq!(coordinator.running_count(), 0);
    let tasks = coordinator.active_tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].state, DownloadState::Queued);
    assert_eq!(http.request_count(), 0);

    let entry = rt.block_on(async {
        let second = coordinator
            .request(identity.clone(), &url_of(&identity), DownloadPriority::Immediate)
            .unwrap();
        second.wait().await.unwrap();
        first.wait().await.unwrap()
    });
    assert_eq!(entry.size_bytes, 7);
    assert!(store.contains(&identity));
    assert_eq!(http.requests_for(&url_of(&identity)), 1);
}

#[test]
fn test_explicit_runtime_drives_requests_from_plain_threads() {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .unwrap();
    let http = GatedHttpClient::new();
    let identity = id("t1");
    http.serve(url_of(&identity), b"payload");
    let fs = MemoryFileSystem::new();
    let clock = ManualClock::new();
    let store = rt.block_on(open_store(&fs, &clock, 1_000));
    let network = NetworkObserver::fixed(NetworkState::online(NetworkType::WiFi));

    let coordinator = DownloadCoordinator::new(store.clone(), http.clone(), network, fast_settings(), None)
        .with_runtime(rt.handle().clone());
    let handle = coordinator
        .request(identity.clone(), &url_of(&identity), DownloadPriority::Immediate)
        .unwrap();

    let entry = rt.block_on(handle.wait()).unwrap();
    assert_eq!(entry.size_bytes, 7);
    assert_eq!(coordinator.running_count(), 0);
}

#[tokio::test]
async fn test_cancel_preloads_and_tracks() {
    let http = GatedHttpClient::closed();
    let settings = DownloadSettings {
        max_concurrent_downloads: 4,
        ..fast_settings()
    };
    let h = harness(http.clone(), settings, 1_000).await;
    let low = TrackIdentity::new("a", QualityTier::Kbps48);
    let high = TrackIdentity::new("a", QualityTier::Kbps320);
    for identity in [&low, &high, &id("b"), &id("c"), &id("d")] {
        http.serve(url_of(identity), b"abcd");
    }

    let _a_low = h
        .coordinator
        .request(low.clone(), &url_of(&low), DownloadPriority::Immediate)
        .unwrap();
    let _a_high = h
        .coordinator
        .request(high.clone(), &url_of(&high), DownloadPriority::Immediate)
        .unwrap();
    let b = h
        .coordinator
        .request(id("b"), &url_of(&id("b")), DownloadPriority::Preload)
        .unwrap();
    let c = h
        .coordinator
        .request(id("c"), &url_of(&id("c")), DownloadPriority::Immediate)
        .unwrap();

    assert_eq!(h.coordinator.cancel_preloads(), 1);
    assert!(b.wait().await.unwrap_err().is_cancelled());

    assert_eq!(h.coordinator.cancel_track("a"), 2);
    assert_eq!(h.coordinator.active_count(), 1);

    h.coordinator.shutdown();
    assert!(c.wait().await.unwrap_err().is_cancelled());

    let err = h
        .coordinator
        .request(id("d"), &url_of(&id("d")), DownloadPriority::Immediate)
        .unwrap_err();
    assert!(err.is_cancelled());
}
