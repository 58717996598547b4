//! Deduplication of concurrent acquisitions for the same media identifier.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;

use crate::error::FetchError;
use crate::identifier::MediaId;
use crate::utils::futures::CallOnDrop;

/// The outcome of one acquisition, shared by every request that waited for it.
pub type FetchResult = Result<Bytes, FetchError>;

/// A handle to a running acquisition. Every clone resolves to the same [`FetchResult`].
pub type FetchFuture = Shared<BoxFuture<'static, FetchResult>>;

struct InFlightFetch {
    /// Distinguishes this fetch from a later one for the same identifier.
    generation: u64,
    /// Only a weak handle, so that the acquisition is dropped once nobody waits for it anymore.
    future: WeakShared<BoxFuture<'static, FetchResult>>,
}

#[derive(Default)]
struct Inner {
    fetches: Mutex<HashMap<MediaId, InFlightFetch>>,
    next_generation: AtomicU64,
}

/// How a request was attached to an acquisition.
pub enum Registration {
    /// An acquisition for the identifier was already running.
    Joined(FetchFuture),
    /// A new acquisition was registered for the identifier.
    Started(FetchFuture),
}

impl Registration {
    pub fn into_future(self) -> FetchFuture {
        match self {
            Registration::Joined(future) | Registration::Started(future) => future,
        }
    }
}

/// Registry of running acquisitions, keyed by media identifier.
///
/// At most one acquisition per identifier is registered at any time. An acquisition deregisters
/// itself when it completes, or when the last request waiting for it goes away.
///
/// The lock is only held to look up, insert or remove a single entry and never across an
/// acquisition, so acquisitions for different identifiers run fully in parallel.
#[derive(Clone, Default)]
pub struct InFlightRegistry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for InFlightRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let running = self.inner.fetches.try_lock().map(|fetches| fetches.len());
        f.debug_struct("InFlightRegistry")
            .field("running", &running)
            .finish()
    }
}

impl InFlightRegistry {
    /// Joins the running acquisition for `id`, or registers a new one created by `start`.
    ///
    /// `start` receives the token that deregisters the new acquisition when dropped. It has to be
    /// moved into the returned future and dropped once the result is final.
    ///
    /// `start` only constructs the future, nothing runs until it is polled. If another caller
    /// registered an acquisition for `id` in the meantime, the constructed future is discarded
    /// unpolled and the caller joins the other one instead.
    pub fn join_or_start<S, F>(&self, id: &MediaId, start: S) -> Registration
    where
        S: FnOnce(CallOnDrop) -> F,
        F: Future<Output = FetchResult> + Send + 'static,
    {
        if let Some(future) = self.running(id) {
            return Registration::Joined(future);
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = {
            let inner = Arc::clone(&self.inner);
            let id = id.clone();
            CallOnDrop::new(move || {
                let mut fetches = inner.fetches.lock();
                // a newer fetch may already have replaced ours
                if fetches
                    .get(&id)
                    .is_some_and(|fetch| fetch.generation == generation)
                {
                    fetches.remove(&id);
                }
            })
        };
        let future = start(token).boxed().shared();

        let mut fetches = self.inner.fetches.lock();
        if let Some(existing) = fetches.get(id).and_then(|fetch| fetch.future.upgrade()) {
            // dropping our future runs its token, which needs the lock
            drop(fetches);
            drop(future);
            return Registration::Joined(existing);
        }

        // `downgrade` only fails for futures that already completed, and ours was never polled
        if let Some(weak) = future.downgrade() {
            fetches.insert(
                id.clone(),
                InFlightFetch {
                    generation,
                    future: weak,
                },
            );
        }
        drop(fetches);

        Registration::Started(future)
    }

    fn running(&self, id: &MediaId) -> Option<FetchFuture> {
        self.inner
            .fetches
            .lock()
            .get(id)
            .and_then(|fetch| fetch.future.upgrade())
    }

    /// Runs `f` unless an acquisition for `id` is registered.
    ///
    /// No acquisition for `id` can be registered while `f` runs. Returns `None` if `f` was skipped.
    pub fn with_idle<Q, R>(&self, id: &Q, f: impl FnOnce() -> R) -> Option<R>
    where
        MediaId: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let fetches = self.inner.fetches.lock();
        if fetches.contains_key(id) {
            return None;
        }
        let result = f();
        drop(fetches);
        Some(result)
    }

    /// Whether an acquisition for `id` is currently registered.
    pub fn is_in_flight(&self, id: &MediaId) -> bool {
        self.inner.fetches.lock().contains_key(id)
    }

    /// The number of registered acquisitions.
    pub fn len(&self) -> usize {
        self.inner.fetches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
