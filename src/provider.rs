//! Async tile providers.
//!
//! Most suppliers just want to answer "what features are in this tile?".
//! [`ProviderBridge`] wires such a [`TileProvider`] to a [`CustomTileSource`]:
//! each fetch spawns the provider future on a tokio runtime, each cancel
//! aborts it, and finished results are delivered through a weak
//! [`SourceHandle`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};

// TODO: remove once async fn in traits can be boxed as trait objects
use async_trait::async_trait;
use futures::future::{AbortHandle, Abortable};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

use crate::address::{LatLngBounds, TileAddress};
use crate::dispatch::FetchDispatcher;
use crate::error::Error;
use crate::options::SourceOptions;
use crate::source::{CustomTileSource, SourceHandle};
use crate::TileObserver;

/// Produces the GeoJSON payload for one tile.
///
/// `bounds` is the tile's geographic extent, or `None` for rows outside the
/// Web Mercator grid.
#[async_trait]
pub trait TileProvider: Send + Sync + 'static {
    async fn features_for_tile(
        &self,
        addr: TileAddress,
        bounds: Option<LatLngBounds>,
    ) -> Result<Value, Error>;
}

#[derive(Default)]
struct InFlight {
    next_ticket: u64,
    requests: HashMap<TileAddress, (u64, AbortHandle)>,
}

/// Runs a [`TileProvider`] on behalf of a source.
///
/// The bridge is owned by the source's fetch/cancel callbacks, so it lives
/// exactly as long as the source does. Dropping it aborts every request
/// still in flight.
pub struct ProviderBridge {
    provider: Arc<dyn TileProvider>,
    runtime: Handle,
    permits: Arc<Semaphore>,
    in_flight: Mutex<InFlight>,
}

impl ProviderBridge {
    /// Builds a source whose tiles come from `provider`, spawned on `runtime`.
    ///
    /// Fails if `options` do not validate.
    pub fn attach<P>(
        id: impl Into<String>,
        options: SourceOptions,
        provider: P,
        runtime: Handle,
        observer: Option<Arc<dyn TileObserver>>,
    ) -> Result<Arc<CustomTileSource>, Error>
    where
        P: TileProvider,
    {
        options.validate()?;
        let bridge = Arc::new(ProviderBridge {
            provider: Arc::new(provider),
            runtime,
            permits: Arc::new(Semaphore::new(options.max_concurrent_requests)),
            in_flight: Mutex::new(InFlight::default()),
        });
        let id = id.into();

        Ok(Arc::new_cyclic(|weak: &Weak<CustomTileSource>| {
            let handle = SourceHandle::from_weak(weak.clone());
            let fetch_bridge = Arc::clone(&bridge);
            let dispatcher = FetchDispatcher::new(
                move |addr| fetch_bridge.spawn_fetch(addr, handle.clone()),
                move |addr| bridge.abort(addr),
            );

            let source = CustomTileSource::new(id, options, dispatcher);
            match observer {
                Some(observer) => source.with_observer(observer),
                None => source,
            }
        }))
    }

    /// Starts a provider request for `addr` unless one is already running.
    fn spawn_fetch(self: &Arc<Self>, addr: TileAddress, source: SourceHandle) {
        let (abort, registration) = AbortHandle::new_pair();
        let ticket = {
            let mut in_flight = self.in_flight.lock();
            if in_flight.requests.contains_key(&addr) {
                tracing::trace!(tile = %addr, "Tile provider request already running");
                return;
            }
            in_flight.next_ticket += 1;
            let ticket = in_flight.next_ticket;
            in_flight.requests.insert(addr, (ticket, abort));
            ticket
        };

        let provider = Arc::clone(&self.provider);
        let permits = Arc::clone(&self.permits);
        let work = async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|e| Error::Provider(e.to_string()))?;
            provider.features_for_tile(addr, addr.extent()).await
        };

        let bridge = Arc::downgrade(self);
        self.runtime.spawn(async move {
            let outcome = Abortable::new(work, registration).await;
            if let Some(bridge) = bridge.upgrade() {
                bridge.finish(addr, ticket);
            }

            match outcome {
                Ok(Ok(payload)) => {
                    // Rejections are logged by the source itself.
                    let _ = source.set_tile_data(addr, &payload);
                }
                Ok(Err(e)) => {
                    tracing::warn!(tile = %addr, error = %e, "Tile provider failed");
                }
                Err(_) => {
                    tracing::debug!(tile = %addr, "Tile provider request aborted");
                }
            }
        });
    }

    fn abort(&self, addr: TileAddress) {
        if let Some((_, request)) = self.in_flight.lock().requests.remove(&addr) {
            request.abort();
            tracing::debug!(tile = %addr, "Aborting tile provider request");
        }
    }

    /// Forgets a finished request, unless it was aborted and replaced by a
    /// newer one.
    fn finish(&self, addr: TileAddress, ticket: u64) {
        let mut in_flight = self.in_flight.lock();
        if matches!(in_flight.requests.get(&addr), Some((current, _)) if *current == ticket) {
            in_flight.requests.remove(&addr);
        }
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.in_flight.lock().requests.len()
    }
}

impl Drop for ProviderBridge {
    fn drop(&mut self) {
        let requests = std::mem::take(&mut self.in_flight.get_mut().requests);
        if !requests.is_empty() {
            tracing::debug!(requests = requests.len(), "Aborting in-flight tile provider requests");
        }
        for (_, (_, request)) in requests {
            request.abort();
        }
    }
}
