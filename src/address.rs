//! Canonical tile addressing and geographic extents.

use std::fmt;

/// Tiles deeper than this have no representable extent.
const MAX_EXTENT_ZOOM: u8 = 31;

/// A canonical (zoom, x, y) slippy map tile id.
///
/// Field order matters: the derived ordering is (zoom, x, y), which is the
/// order features are reported in by [`crate::TileSource::query_features`].
/// No range validation is done here; that is up to whoever hands us the tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TileAddress {
    pub zoom: u8,
    pub x: i32,
    pub y: i32,
}

impl TileAddress {
    pub fn new(zoom: u8, x: i32, y: i32) -> Self {
        TileAddress { zoom, x, y }
    }

    /// Wraps x into `[0, 2^zoom)`, folding every world copy onto the canonical one.
    pub fn wrapped(&self) -> Self {
        match tiles_per_axis(self.zoom) {
            Some(n) => TileAddress {
                x: (i64::from(self.x).rem_euclid(n)) as i32,
                ..*self
            },
            None => *self,
        }
    }

    /// The geographic extent of this tile in WGS84 degrees.
    ///
    /// Tiles left or right of the canonical world map to longitudes shifted by
    /// whole multiples of 360. Returns `None` for rows outside the grid and for
    /// zoom levels too deep to compute.
    pub fn extent(&self) -> Option<LatLngBounds> {
        let n = tiles_per_axis(self.zoom)?;
        let y = i64::from(self.y);
        if y < 0 || y >= n {
            return None;
        }

        let x = i64::from(self.x);
        let world_offset = x.div_euclid(n) as f64 * 360.0;
        let x = x.rem_euclid(n) as u32;
        let y = y as u32;

        let (west, north) = slippy_map_tilenames::tile2lonlat(x, y, self.zoom);
        let (east, south) = slippy_map_tilenames::tile2lonlat(x + 1, y + 1, self.zoom);

        Some(LatLngBounds {
            north,
            south,
            east: east + world_offset,
            west: west + world_offset,
        })
    }
}

impl fmt::Display for TileAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.x, self.y)
    }
}

fn tiles_per_axis(zoom: u8) -> Option<i64> {
    if zoom > MAX_EXTENT_ZOOM {
        None
    } else {
        Some(1i64 << zoom)
    }
}

/// A latitude/longitude bounding box in degrees.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LatLngBounds {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl LatLngBounds {
    pub fn new(north: f64, south: f64, east: f64, west: f64) -> Self {
        LatLngBounds {
            north,
            south,
            east,
            west,
        }
    }

    /// The whole Web Mercator world.
    pub fn world() -> Self {
        let (_, north) = slippy_map_tilenames::tile2lonlat(0, 0, 0);
        let (_, south) = slippy_map_tilenames::tile2lonlat(1, 1, 0);
        LatLngBounds::new(north, south, 180.0, -180.0)
    }

    /// Closed-interval overlap test: boxes that only share an edge intersect.
    pub fn intersects(&self, other: &LatLngBounds) -> bool {
        self.west <= other.east
            && self.east >= other.west
            && self.south <= other.north
            && self.north >= other.south
    }

    pub fn contains(&self, lng: f64, lat: f64) -> bool {
        lng >= self.west && lng <= self.east && lat >= self.south && lat <= self.north
    }
}
