//! The custom tile source: per-tile lifecycle between the renderer's tile
//! scheduler and the application's data supplier.
//!
//! Each tracked tile is Pending, Loaded or Invalidated; tiles with no record
//! are Unrequested. All records live in one ordered map behind a single lock.
//! Payload parsing and every outward call (supplier callbacks, renderer
//! notifications) happen with the lock released.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;

use crate::address::{LatLngBounds, TileAddress};
use crate::dispatch::FetchDispatcher;
use crate::error::Error;
use crate::feature::{parse_features, validate_features, Feature, FeatureStore};
use crate::filter::FeatureFilter;
use crate::options::SourceOptions;
use crate::{TileObserver, TileSource};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TileState {
    Unrequested,
    Pending,
    Loaded,
    Invalidated,
}

enum TileRecord {
    /// Requested from the supplier, no data yet.
    Pending,
    Loaded(FeatureStore),
    Invalidated,
}

impl TileRecord {
    fn state(&self) -> TileState {
        match self {
            TileRecord::Pending => TileState::Pending,
            TileRecord::Loaded(_) => TileState::Loaded,
            TileRecord::Invalidated => TileState::Invalidated,
        }
    }
}

enum FetchAction {
    Request,
    Rerequest,
    Cached,
}

/// A tile source whose data is pushed in by the application.
///
/// Share it behind an [`Arc`]; hand suppliers a [`SourceHandle`] from
/// [`CustomTileSource::handle`] rather than a strong reference.
pub struct CustomTileSource {
    id: String,
    options: SourceOptions,
    dispatcher: FetchDispatcher,
    observer: Option<Arc<dyn TileObserver>>,
    tiles: Mutex<BTreeMap<TileAddress, TileRecord>>,
}

impl CustomTileSource {
    pub fn new(id: impl Into<String>, options: SourceOptions, dispatcher: FetchDispatcher) -> Self {
        CustomTileSource {
            id: id.into(),
            options,
            dispatcher,
            observer: None,
            tiles: Mutex::new(BTreeMap::new()),
        }
    }

    /// Registers the renderer's "tile changed" hook.
    pub fn with_observer(mut self, observer: Arc<dyn TileObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn options(&self) -> &SourceOptions {
        &self.options
    }

    pub fn handle(self: &Arc<Self>) -> SourceHandle {
        SourceHandle {
            source: Arc::downgrade(self),
        }
    }

    /// Like [`TileSource::set_tile_data`], for features that are already parsed.
    pub fn set_tile_features(&self, addr: TileAddress, features: Vec<Feature>) -> Result<(), Error> {
        if let Err(e) = validate_features(&features) {
            tracing::warn!(source = %self.id, tile = %addr, error = %e, "Rejected tile features");
            return Err(e.into());
        }
        self.apply_features(addr, features);
        Ok(())
    }

    /// The surrounding tile cache dropped `addr`; forget it entirely.
    pub fn evict_tile(&self, addr: TileAddress) -> bool {
        let addr = self.options.canonical(addr);
        let removed = self.tiles.lock().remove(&addr).is_some();
        if removed {
            tracing::debug!(source = %self.id, tile = %addr, "Evicted tile");
        }
        removed
    }

    pub fn tile_state(&self, addr: TileAddress) -> TileState {
        let addr = self.options.canonical(addr);
        self.tiles
            .lock()
            .get(&addr)
            .map_or(TileState::Unrequested, TileRecord::state)
    }

    /// Loaded tiles in address order.
    pub fn loaded_tiles(&self) -> Vec<TileAddress> {
        self.tiles
            .lock()
            .iter()
            .filter(|(_, record)| matches!(record, TileRecord::Loaded(_)))
            .map(|(addr, _)| *addr)
            .collect()
    }

    /// Unbinds the supplier callbacks, waiting for any that are running.
    /// Must not be called from inside a fetch or cancel callback.
    pub fn detach_callbacks(&self) {
        self.dispatcher.detach();
        tracing::debug!(source = %self.id, "Detached supplier callbacks");
    }

    fn apply_features(&self, addr: TileAddress, features: Vec<Feature>) {
        let addr = self.options.canonical(addr);
        let count = features.len();
        {
            let mut tiles = self.tiles.lock();
            if let Some(TileRecord::Loaded(store)) = tiles.get_mut(&addr) {
                store.replace(features);
            } else {
                tiles.insert(addr, TileRecord::Loaded(FeatureStore::new(features)));
            }
        }
        tracing::debug!(source = %self.id, tile = %addr, features = count, "Loaded tile");
        self.notify(addr);
    }

    fn notify(&self, addr: TileAddress) {
        if let Some(observer) = &self.observer {
            observer.tile_changed(addr);
        }
    }
}

impl TileSource for CustomTileSource {
    fn fetch_tile(&self, addr: TileAddress) {
        if !self.options.covers_zoom(addr.zoom) {
            tracing::trace!(source = %self.id, tile = %addr, "Zoom not covered, ignoring fetch");
            return;
        }
        let addr = self.options.canonical(addr);

        let action = {
            let mut tiles = self.tiles.lock();
            match tiles.get(&addr) {
                Some(TileRecord::Loaded(_)) => FetchAction::Cached,
                // The supplier may have failed or dropped the request; only it
                // knows whether one is still outstanding.
                Some(TileRecord::Pending) => FetchAction::Rerequest,
                _ => {
                    tiles.insert(addr, TileRecord::Pending);
                    FetchAction::Request
                }
            }
        };

        match action {
            FetchAction::Request => {
                tracing::debug!(source = %self.id, tile = %addr, "Requesting tile");
                self.dispatcher.request_tile(addr);
            }
            FetchAction::Rerequest => {
                tracing::trace!(source = %self.id, tile = %addr, "Requesting pending tile again");
                self.dispatcher.request_tile(addr);
            }
            FetchAction::Cached => {
                tracing::trace!(source = %self.id, tile = %addr, "Serving cached tile");
                self.notify(addr);
            }
        }
    }

    fn cancel_tile(&self, addr: TileAddress) {
        let addr = self.options.canonical(addr);
        if !self.tiles.lock().contains_key(&addr) {
            tracing::trace!(source = %self.id, tile = %addr, "Tile not tracked, ignoring cancel");
            return;
        }
        tracing::debug!(source = %self.id, tile = %addr, "Cancelling tile");
        self.dispatcher.abandon_tile(addr);
    }

    fn set_tile_data(&self, addr: TileAddress, payload: &Value) -> Result<(), Error> {
        let features = match parse_features(payload) {
            Ok(features) => features,
            Err(e) => {
                tracing::warn!(source = %self.id, tile = %addr, error = %e, "Rejected tile data");
                return Err(e.into());
            }
        };
        self.apply_features(addr, features);
        Ok(())
    }

    fn invalidate_tile(&self, addr: TileAddress) {
        let addr = self.options.canonical(addr);
        let tracked = match self.tiles.lock().get_mut(&addr) {
            Some(record) => {
                *record = TileRecord::Invalidated;
                true
            }
            None => false,
        };

        if tracked {
            tracing::debug!(source = %self.id, tile = %addr, "Invalidated tile");
            self.notify(addr);
        } else {
            tracing::trace!(source = %self.id, tile = %addr, "Invalidate for untracked tile");
        }
    }

    fn invalidate_region(&self, bounds: &LatLngBounds) -> Vec<TileAddress> {
        let invalidated: Vec<TileAddress> = {
            let mut tiles = self.tiles.lock();
            let mut hits = Vec::new();
            for (addr, record) in tiles.iter_mut() {
                if addr.extent().map_or(false, |extent| extent.intersects(bounds)) {
                    *record = TileRecord::Invalidated;
                    hits.push(*addr);
                }
            }
            hits
        };

        tracing::debug!(source = %self.id, tiles = invalidated.len(), "Invalidated region");
        for addr in &invalidated {
            self.notify(*addr);
        }
        invalidated
    }

    fn query_features(&self, filter: &dyn FeatureFilter) -> Vec<Feature> {
        // Snapshot the stores so filtering runs without the lock held.
        let stores: Vec<FeatureStore> = self
            .tiles
            .lock()
            .values()
            .filter_map(|record| match record {
                TileRecord::Loaded(store) => Some(store.clone()),
                _ => None,
            })
            .collect();

        stores
            .iter()
            .flat_map(|store| store.query(filter))
            .cloned()
            .collect()
    }
}

impl fmt::Debug for CustomTileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomTileSource")
            .field("id", &self.id)
            .field("options", &self.options)
            .field("dispatcher", &self.dispatcher)
            .field("tiles", &self.tiles.lock().len())
            .finish()
    }
}

/// A weak reference to a [`CustomTileSource`] for suppliers to call back on.
///
/// Once the source is dropped every call becomes a no-op, so a late delivery
/// from a supplier thread can never touch a torn-down source.
#[derive(Clone, Debug)]
pub struct SourceHandle {
    source: Weak<CustomTileSource>,
}

impl SourceHandle {
    pub(crate) fn from_weak(source: Weak<CustomTileSource>) -> Self {
        SourceHandle { source }
    }

    pub fn is_alive(&self) -> bool {
        self.source.strong_count() > 0
    }

    pub fn set_tile_data(&self, addr: TileAddress, payload: &Value) -> Result<(), Error> {
        match self.source.upgrade() {
            Some(source) => source.set_tile_data(addr, payload),
            None => {
                tracing::debug!(tile = %addr, "Source gone, dropping tile data");
                Ok(())
            }
        }
    }

    pub fn set_tile_features(&self, addr: TileAddress, features: Vec<Feature>) -> Result<(), Error> {
        match self.source.upgrade() {
            Some(source) => source.set_tile_features(addr, features),
            None => {
                tracing::debug!(tile = %addr, "Source gone, dropping tile features");
                Ok(())
            }
        }
    }

    pub fn invalidate_tile(&self, addr: TileAddress) {
        if let Some(source) = self.source.upgrade() {
            source.invalidate_tile(addr);
        }
    }

    pub fn invalidate_region(&self, bounds: &LatLngBounds) -> Vec<TileAddress> {
        self.source
            .upgrade()
            .map(|source| source.invalidate_region(bounds))
            .unwrap_or_default()
    }
}
