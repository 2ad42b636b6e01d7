//! Fetch/cancel notification to the external data supplier.

use std::fmt;

use parking_lot::RwLock;

use crate::address::TileAddress;

/// A fire-and-forget notification about one tile. Implementations must return
/// promptly; any real work belongs on the supplier's own threads.
pub type TileFunction = Box<dyn Fn(TileAddress) + Send + Sync>;

struct Callbacks {
    fetch: Option<TileFunction>,
    cancel: Option<TileFunction>,
}

/// Holds the supplier's fetch/cancel callbacks.
///
/// Invocations run under a shared lock and [`FetchDispatcher::detach`] takes
/// it exclusively, so once `detach` returns no callback is running and none
/// will run again. A callback must not call `detach` on its own dispatcher.
pub struct FetchDispatcher {
    callbacks: RwLock<Callbacks>,
}

impl FetchDispatcher {
    /// A dispatcher with no supplier attached; every notification is a no-op.
    pub fn unbound() -> Self {
        FetchDispatcher {
            callbacks: RwLock::new(Callbacks {
                fetch: None,
                cancel: None,
            }),
        }
    }

    pub fn new<F, C>(fetch: F, cancel: C) -> Self
    where
        F: Fn(TileAddress) + Send + Sync + 'static,
        C: Fn(TileAddress) + Send + Sync + 'static,
    {
        FetchDispatcher {
            callbacks: RwLock::new(Callbacks {
                fetch: Some(Box::new(fetch)),
                cancel: Some(Box::new(cancel)),
            }),
        }
    }

    pub fn with_fetch<F>(self, fetch: F) -> Self
    where
        F: Fn(TileAddress) + Send + Sync + 'static,
    {
        self.callbacks.write().fetch = Some(Box::new(fetch));
        self
    }

    pub fn with_cancel<C>(self, cancel: C) -> Self
    where
        C: Fn(TileAddress) + Send + Sync + 'static,
    {
        self.callbacks.write().cancel = Some(Box::new(cancel));
        self
    }

    /// Tells the supplier `addr` is wanted. Returns whether a callback ran.
    pub fn request_tile(&self, addr: TileAddress) -> bool {
        // Recursive read so a callback that re-enters the source cannot
        // deadlock against a queued detach.
        let callbacks = self.callbacks.read_recursive();
        match callbacks.fetch {
            Some(ref fetch) => {
                fetch(addr);
                true
            }
            None => {
                tracing::trace!(tile = %addr, "No fetch callback bound");
                false
            }
        }
    }

    /// Tells the supplier `addr` is no longer wanted. Advisory only.
    pub fn abandon_tile(&self, addr: TileAddress) -> bool {
        let callbacks = self.callbacks.read_recursive();
        match callbacks.cancel {
            Some(ref cancel) => {
                cancel(addr);
                true
            }
            None => {
                tracing::trace!(tile = %addr, "No cancel callback bound");
                false
            }
        }
    }

    pub fn is_bound(&self) -> bool {
        let callbacks = self.callbacks.read();
        callbacks.fetch.is_some() || callbacks.cancel.is_some()
    }

    /// Waits for running callbacks to finish, then drops both of them.
    pub fn detach(&self) {
        let mut callbacks = self.callbacks.write();
        callbacks.fetch = None;
        callbacks.cancel = None;
    }
}

impl Default for FetchDispatcher {
    fn default() -> Self {
        FetchDispatcher::unbound()
    }
}

impl fmt::Debug for FetchDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let callbacks = self.callbacks.read();
        f.debug_struct("FetchDispatcher")
            .field("fetch", &callbacks.fetch.is_some())
            .field("cancel", &callbacks.cancel.is_some())
            .finish()
    }
}
