//! # Custom Tile Source
//!
//! Vector tile sources whose content is supplied by the application at its
//! own pace, rather than fetched from a tile server.
//!
//! ## How it fits together
//!
//! The renderer's tile scheduler calls [`TileSource::fetch_tile`] and
//! [`TileSource::cancel_tile`] as tiles come into and out of view. Those are
//! forwarded to the application through a [`FetchDispatcher`] as
//! fire-and-forget callbacks. Whenever the application has data (on whatever
//! thread it likes) it calls back with [`TileSource::set_tile_data`], or
//! drops stale content with [`TileSource::invalidate_tile`] /
//! [`TileSource::invalidate_region`]. Each of those signals the renderer
//! through a [`TileObserver`] so the tile is redrawn.
//!
//! Suppliers that would rather implement a single async function can use
//! [`provider::ProviderBridge`], which turns fetch/cancel callbacks into
//! spawned, abortable futures on a tokio runtime.
//!
//! ## Known Limitations
//!
//! Delivery is last-write-wins per tile. There is no request token, so data
//! computed for an older request that arrives after a newer invalidation is
//! still accepted and shown.
//!
//! Region invalidation uses plain Web Mercator tile extents; tiles on rows
//! outside the grid never match a region.

#![deny(warnings)]

use serde_json::Value;

pub mod address;
pub mod dispatch;
pub mod error;
pub mod feature;
pub mod filter;
pub mod options;
pub mod provider;
pub mod source;

pub use address::{LatLngBounds, TileAddress};
pub use dispatch::{FetchDispatcher, TileFunction};
pub use error::{DataFormatError, Error};
pub use feature::{Feature, FeatureStore, Geometry, GeometryType};
pub use filter::{FeatureFilter, Filter};
pub use options::SourceOptions;
pub use source::{CustomTileSource, SourceHandle, TileState};

/// The operations a renderer and a data supplier use on a custom source.
///
/// None of these block on the supplier. Apart from rejected payloads, nothing
/// here fails: unknown tiles and missing callbacks are quietly ignored so the
/// renderer keeps going with a broken or absent supplier.
///
/// `fetch_tile` and `cancel_tile` are meant to be driven by one scheduling
/// thread. They may be called from several, but then the order in which the
/// supplier sees a fetch and a cancel for the same tile is whatever order
/// the calls happen to reach it in. A tile left pending by a lost request is
/// asked for again on the next fetch.
pub trait TileSource: Send + Sync {
    /// The renderer wants `addr`. Asks the supplier for it unless the data
    /// is cached; a tile that is still pending is asked for again, and the
    /// supplier decides whether that duplicates a request it is working on.
    fn fetch_tile(&self, addr: TileAddress);

    /// The renderer no longer needs `addr`. The supplier is told if the tile
    /// is tracked, but data that still arrives for it is accepted.
    fn cancel_tile(&self, addr: TileAddress);

    /// Replaces the features of `addr` with the given GeoJSON and marks the
    /// tile loaded. A malformed payload leaves the previous data untouched.
    fn set_tile_data(&self, addr: TileAddress, payload: &Value) -> Result<(), Error>;

    /// Drops the data for `addr` so the renderer requests it again.
    fn invalidate_tile(&self, addr: TileAddress);

    /// Invalidates every tracked tile whose extent intersects `bounds` and
    /// returns those tiles in address order.
    fn invalidate_region(&self, bounds: &LatLngBounds) -> Vec<TileAddress>;

    /// Features of every loaded tile that pass `filter`, in tile address
    /// order and insertion order within a tile.
    fn query_features(&self, filter: &dyn FeatureFilter) -> Vec<Feature>;
}

/// Renderer-side hook, told whenever a tile's content changes.
pub trait TileObserver: Send + Sync {
    fn tile_changed(&self, addr: TileAddress);
}

impl<F> TileObserver for F
where
    F: Fn(TileAddress) + Send + Sync,
{
    fn tile_changed(&self, addr: TileAddress) {
        self(addr)
    }
}
