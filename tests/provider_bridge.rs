//! End-to-end tests of sources driven by an async tile provider.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::runtime::Handle;

use custom_tile_source::provider::{ProviderBridge, TileProvider};
use custom_tile_source::{
    Error, Filter, Geometry, LatLngBounds, SourceOptions, TileAddress, TileObserver, TileSource, TileState,
};

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// One point per tile, named after the tile and placed at its centre.
struct Points {
    delay: Duration,
    running: AtomicUsize,
    peak: Arc<AtomicUsize>,
    bounds: Arc<Mutex<Vec<(TileAddress, Option<LatLngBounds>)>>>,
}

impl Points {
    fn new(delay: Duration) -> Self {
        Points {
            delay,
            running: AtomicUsize::new(0),
            peak: Arc::new(AtomicUsize::new(0)),
            bounds: Arc::default(),
        }
    }
}

#[async_trait]
impl TileProvider for Points {
    async fn features_for_tile(
        &self,
        addr: TileAddress,
        bounds: Option<LatLngBounds>,
    ) -> Result<Value, Error> {
        self.bounds.lock().unwrap().push((addr, bounds));
        let centre = bounds.map_or([0.0, 0.0], |b| {
            [(b.west + b.east) / 2.0, (b.north + b.south) / 2.0]
        });

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        Ok(json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "geometry": { "type": "Point", "coordinates": centre },
                "properties": { "tile": addr.to_string() }
            }]
        }))
    }
}

/// Never finishes; records when its future is dropped.
struct Stalled {
    dropped: Arc<AtomicBool>,
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl TileProvider for Stalled {
    async fn features_for_tile(
        &self,
        _addr: TileAddress,
        _bounds: Option<LatLngBounds>,
    ) -> Result<Value, Error> {
        let _flag = DropFlag(Arc::clone(&self.dropped));
        futures::future::pending().await
    }
}

struct Failing;

#[async_trait]
impl TileProvider for Failing {
    async fn features_for_tile(
        &self,
        _addr: TileAddress,
        _bounds: Option<LatLngBounds>,
    ) -> Result<Value, Error> {
        Err(Error::Provider("backend unavailable".to_string()))
    }
}

/// Fails the first request, then answers like [`Points`].
struct FlakyOnce {
    calls: Arc<AtomicUsize>,
    points: Points,
}

#[async_trait]
impl TileProvider for FlakyOnce {
    async fn features_for_tile(
        &self,
        addr: TileAddress,
        bounds: Option<LatLngBounds>,
    ) -> Result<Value, Error> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(Error::Provider("backend warming up".to_string()));
        }
        self.points.features_for_tile(addr, bounds).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_provider_data_reaches_queries() {
    let changed = Arc::new(Mutex::new(Vec::new()));
    let observer: Arc<dyn TileObserver> = {
        let changed = Arc::clone(&changed);
        Arc::new(move |addr: TileAddress| changed.lock().unwrap().push(addr))
    };
    let provider = Points::new(Duration::from_millis(5));
    let seen = Arc::clone(&provider.bounds);
    let source = ProviderBridge::attach(
        "points",
        SourceOptions::default(),
        provider,
        Handle::current(),
        Some(observer),
    )
    .unwrap();

    let tile = TileAddress::new(2, 1, 1);
    source.fetch_tile(tile);
    wait_for(|| source.tile_state(tile) == TileState::Loaded).await;

    // Tile 2/1/1 spans lon -90..0, lat 0..66.5.
    let (asked, bounds) = seen.lock().unwrap()[0];
    assert_eq!(tile, asked);
    let bounds = bounds.unwrap();
    assert!(bounds.contains(-45.0, 33.0));
    assert!(!bounds.contains(45.0, 33.0));

    let found = source.query_features(&Filter::equals("tile", "2/1/1"));
    assert_eq!(1, found.len());
    match &found[0].geometry {
        Geometry::Point(position) => assert!(bounds.contains(position[0], position[1])),
        other => panic!("unexpected geometry {:?}", other),
    }
    assert!(source
        .query_features(&Filter::equals("tile", "2/0/0"))
        .is_empty());
    assert_eq!(vec![tile], *changed.lock().unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrency_is_bounded() {
    let provider = Points::new(Duration::from_millis(20));
    let peak = Arc::clone(&provider.peak);
    let options = SourceOptions {
        max_concurrent_requests: 2,
        ..SourceOptions::default()
    };
    let source =
        ProviderBridge::attach("bounded", options, provider, Handle::current(), None).unwrap();

    for x in 0..8 {
        source.fetch_tile(TileAddress::new(3, x, 0));
    }
    wait_for(|| source.loaded_tiles().len() == 8).await;

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(8, source.query_features(&Filter::everything()).len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_aborts_provider_future() {
    let dropped = Arc::new(AtomicBool::new(false));
    let source = ProviderBridge::attach(
        "stalled",
        SourceOptions::default(),
        Stalled {
            dropped: Arc::clone(&dropped),
        },
        Handle::current(),
        None,
    )
    .unwrap();

    let tile = TileAddress::new(5, 3, 3);
    source.fetch_tile(tile);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!dropped.load(Ordering::SeqCst));

    source.cancel_tile(tile);
    wait_for(|| dropped.load(Ordering::SeqCst)).await;
    assert_eq!(TileState::Pending, source.tile_state(tile));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropping_source_aborts_provider_futures() {
    let dropped = Arc::new(AtomicBool::new(false));
    let source = ProviderBridge::attach(
        "stalled",
        SourceOptions::default(),
        Stalled {
            dropped: Arc::clone(&dropped),
        },
        Handle::current(),
        None,
    )
    .unwrap();
    let handle = source.handle();

    source.fetch_tile(TileAddress::new(5, 3, 3));
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(source);

    wait_for(|| dropped.load(Ordering::SeqCst)).await;
    assert!(!handle.is_alive());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_provider_failure_leaves_tile_pending() {
    let source = ProviderBridge::attach(
        "failing",
        SourceOptions::default(),
        Failing,
        Handle::current(),
        None,
    )
    .unwrap();

    let tile = TileAddress::new(1, 0, 0);
    source.fetch_tile(tile);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(TileState::Pending, source.tile_state(tile));
    assert!(source.query_features(&Filter::everything()).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_refetch_after_provider_failure() {
    let calls = Arc::new(AtomicUsize::new(0));
    let source = ProviderBridge::attach(
        "flaky",
        SourceOptions::default(),
        FlakyOnce {
            calls: Arc::clone(&calls),
            points: Points::new(Duration::from_millis(1)),
        },
        Handle::current(),
        None,
    )
    .unwrap();

    let tile = TileAddress::new(2, 1, 1);
    source.fetch_tile(tile);
    wait_for(|| calls.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(TileState::Pending, source.tile_state(tile));

    // The renderer asks again while the tile is still blank.
    source.fetch_tile(tile);
    wait_for(|| source.tile_state(tile) == TileState::Loaded).await;
    assert_eq!(2, calls.load(Ordering::SeqCst));
    assert_eq!(1, source.query_features(&Filter::everything()).len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_repeated_fetch_runs_provider_once() {
    let provider = Points::new(Duration::from_millis(50));
    let seen = Arc::clone(&provider.bounds);
    let source = ProviderBridge::attach(
        "points",
        SourceOptions::default(),
        provider,
        Handle::current(),
        None,
    )
    .unwrap();

    let tile = TileAddress::new(4, 2, 2);
    source.fetch_tile(tile);
    source.fetch_tile(tile);
    source.fetch_tile(tile);
    wait_for(|| source.tile_state(tile) == TileState::Loaded).await;

    assert_eq!(1, seen.lock().unwrap().len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_refetch_after_cancel() {
    let provider = Points::new(Duration::from_millis(50));
    let seen = Arc::clone(&provider.bounds);
    let source = ProviderBridge::attach(
        "points",
        SourceOptions::default(),
        provider,
        Handle::current(),
        None,
    )
    .unwrap();

    let tile = TileAddress::new(4, 2, 2);
    source.fetch_tile(tile);
    wait_for(|| seen.lock().unwrap().len() == 1).await;
    source.cancel_tile(tile);
    source.fetch_tile(tile);

    wait_for(|| source.tile_state(tile) == TileState::Loaded).await;
    assert_eq!(2, seen.lock().unwrap().len());
}

#[tokio::test]
async fn test_attach_rejects_invalid_options() {
    for max_concurrent_requests in [0, usize::MAX] {
        let options = SourceOptions {
            max_concurrent_requests,
            ..SourceOptions::default()
        };
        let attached = ProviderBridge::attach(
            "invalid",
            options,
            Failing,
            Handle::current(),
            None,
        );
        assert!(matches!(attached, Err(Error::InvalidOptions(_))));
    }
}
