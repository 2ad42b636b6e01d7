//! Custom source options, usually kept in a small YAML file next to the
//! style that uses the source.
//!
//! ```yaml
//! minzoom: 4
//! maxzoom: 14
//! wrap: true
//! max-concurrent-requests: 4
//! ```
use serde::Deserialize;
use tokio::sync::Semaphore;

use crate::address::TileAddress;
use crate::error::Error;

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct SourceOptions {
    /// Lowest zoom level the provider has data for.
    #[serde(rename = "minzoom")]
    pub min_zoom: u8,
    /// Highest zoom level the provider has data for.
    #[serde(rename = "maxzoom")]
    pub max_zoom: u8,
    /// Fold world copies onto the canonical tile column.
    pub wrap: bool,
    /// Upper bound on provider requests running at once (see [`crate::provider`]).
    #[serde(rename = "max-concurrent-requests")]
    pub max_concurrent_requests: usize,
}

impl Default for SourceOptions {
    fn default() -> Self {
        SourceOptions {
            min_zoom: 0,
            max_zoom: 18,
            wrap: false,
            max_concurrent_requests: 10,
        }
    }
}

impl SourceOptions {
    /// Constructs source options from a YAML string. Missing keys take their defaults.
    pub fn from_yaml(data: &str) -> Result<SourceOptions, Error> {
        let options: SourceOptions = serde_yaml::from_str(data)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.min_zoom > self.max_zoom {
            return Err(Error::InvalidOptions(format!(
                "minzoom {} is above maxzoom {}",
                self.min_zoom, self.max_zoom
            )));
        }
        if self.max_concurrent_requests == 0 {
            return Err(Error::InvalidOptions(
                "max-concurrent-requests must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_requests > Semaphore::MAX_PERMITS {
            return Err(Error::InvalidOptions(format!(
                "max-concurrent-requests {} is above {}",
                self.max_concurrent_requests,
                Semaphore::MAX_PERMITS
            )));
        }
        Ok(())
    }

    pub fn covers_zoom(&self, zoom: u8) -> bool {
        (self.min_zoom..=self.max_zoom).contains(&zoom)
    }

    /// The address this source tracks `addr` under.
    pub fn canonical(&self, addr: TileAddress) -> TileAddress {
        if self.wrap {
            addr.wrapped()
        } else {
            addr
        }
    }
}
