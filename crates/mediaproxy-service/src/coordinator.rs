//! The request pipeline: access check, identifier extraction, cache lookup and acquisition.

use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::time::MissedTickBehavior;

use crate::access::{AccessDecision, AccessGate};
use crate::acquire::Acquirer;
use crate::config::Config;
use crate::error::FetchError;
use crate::identifier::{self, MediaId};
use crate::inflight::{InFlightRegistry, Registration};
use crate::store::{ContentStore, SweepStats};

/// The terminal state of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    /// The content for the requested identifier.
    Found { id: MediaId, contents: Bytes },
    /// No identifier in the request, or the content could not be acquired.
    NotFound,
    /// The source address was rejected.
    Denied,
}

/// Serves media content from the cache, acquiring it on a miss.
///
/// At most one acquisition per identifier runs at any time. Requests that miss the cache while an
/// acquisition for the same identifier is running wait for its outcome instead of starting another
/// one. An acquisition runs as part of the requests waiting for it and is cancelled, killing the
/// downloader, once all of them went away.
#[derive(Debug)]
pub struct FetchCoordinator {
    gate: AccessGate,
    store: Arc<ContentStore>,
    acquirer: Arc<Acquirer>,
    in_flight: InFlightRegistry,
    /// Byte ceiling for a single acquisition, `0` for no limit.
    download_limit: u64,
}

impl FetchCoordinator {
    pub fn new(
        gate: AccessGate,
        store: ContentStore,
        acquirer: Acquirer,
        download_limit: u64,
    ) -> Self {
        Self {
            gate,
            store: Arc::new(store),
            acquirer: Arc::new(acquirer),
            in_flight: InFlightRegistry::default(),
            download_limit,
        }
    }

    /// Creates the coordinator and eagerly loads the access lists.
    pub async fn from_config(config: &Config) -> io::Result<Self> {
        let store = ContentStore::from_config(config)?;
        let gate = AccessGate::load(&config.access).await;
        let acquirer = Acquirer::from_config(&config.downloader);

        Ok(Self::new(
            gate,
            store,
            acquirer,
            config.downloader.max_download_size,
        ))
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn in_flight(&self) -> &InFlightRegistry {
        &self.in_flight
    }

    /// Handles a request from `addr` for the raw request target `target`.
    ///
    /// Every failure is logged and collapses into [`Fetched::NotFound`] or [`Fetched::Denied`].
    pub async fn get(&self, addr: IpAddr, method: &str, target: &str) -> Fetched {
        let result = self.try_get(addr, method, target).await;
        match result {
            Ok((id, contents)) => {
                metric!(counter("requests.found") += 1);
                Fetched::Found { id, contents }
            }
            Err(FetchError::Denied) => Fetched::Denied,
            Err(e) => {
                metric!(counter("requests.not_found") += 1, "reason" => e.kind());
                Fetched::NotFound
            }
        }
    }

    /// Like [`get`](Self::get), but reports why a request failed.
    pub async fn try_get(
        &self,
        addr: IpAddr,
        method: &str,
        target: &str,
    ) -> Result<(MediaId, Bytes), FetchError> {
        match self.gate.check(addr).await {
            AccessDecision::Allowed => {}
            decision => {
                tracing::info!(%addr, ?decision, "Blocked connection");
                metric!(counter("access.denied") += 1);
                return Err(FetchError::Denied);
            }
        }

        let Some(id) = identifier::extract(method, target) else {
            tracing::info!(%addr, method, path = target, "Malformed request");
            return Err(FetchError::BadIdentifier);
        };

        let contents = self.fetch(&id).await?;
        Ok((id, contents))
    }

    /// Returns the content for `id` from the cache, or acquires and caches it.
    pub async fn fetch(&self, id: &MediaId) -> Result<Bytes, FetchError> {
        metric!(counter("caches.access") += 1);
        if let Some(contents) = self.lookup(id).await? {
            metric!(counter("caches.file.hit") += 1);
            return Ok(contents);
        }
        metric!(counter("caches.file.miss") += 1);

        let registration = self.in_flight.join_or_start(id, |token| {
            let store = Arc::clone(&self.store);
            let acquirer = Arc::clone(&self.acquirer);
            let id = id.clone();
            let limit = self.download_limit;

            async move {
                let result = acquire_and_store(&store, &acquirer, &id, limit).await;
                drop(token);
                result
            }
        });

        if let Registration::Joined(_) = registration {
            tracing::debug!(%id, "Waiting for running download");
            metric!(counter("caches.inflight.hit") += 1);
        }

        registration.into_future().await
    }

    async fn lookup(&self, id: &MediaId) -> Result<Option<Bytes>, FetchError> {
        let store = Arc::clone(&self.store);
        let id = id.clone();
        run_blocking(move || store.lookup(&id))
            .await
            .map_err(|e| {
                tracing::error!(error = &e as &dyn std::error::Error, "Failed to read cache file");
                FetchError::StorageFailed(e.to_string())
            })
    }

    /// Removes expired items from the cache, skipping the ones that are being acquired.
    pub async fn sweep(&self, dry_run: bool) -> io::Result<SweepStats> {
        let store = Arc::clone(&self.store);
        let in_flight = self.in_flight.clone();
        run_blocking(move || store.sweep(&in_flight, dry_run)).await
    }
}

/// Runs one acquisition for `id` and stores its result.
async fn acquire_and_store(
    store: &Arc<ContentStore>,
    acquirer: &Acquirer,
    id: &MediaId,
    limit: u64,
) -> Result<Bytes, FetchError> {
    // an acquisition that finished just before we registered might already have stored it
    let cached = {
        let store = Arc::clone(store);
        let id = id.clone();
        run_blocking(move || store.lookup(&id)).await
    };
    if let Ok(Some(contents)) = cached {
        return Ok(contents);
    }

    tracing::info!(%id, "Fetching");
    let start = Instant::now();
    let result = async {
        let contents = acquirer.fetch(id, limit).await?;

        let store = Arc::clone(store);
        let stored_id = id.clone();
        let stored = contents.clone();
        run_blocking(move || store.put(&stored_id, &stored))
            .await
            .map_err(|e| FetchError::StorageFailed(e.to_string()))?;

        Ok::<_, FetchError>(contents)
    }
    .await;

    if let Err(ref e) = result {
        tracing::warn!(
            %id,
            error = e as &dyn std::error::Error,
            "Fetch failed after {:.2}s",
            start.elapsed().as_secs_f64(),
        );
        metric!(counter("downloads.failed") += 1, "kind" => e.kind());
    }
    result
}

/// Runs blocking filesystem work outside of the async executor.
async fn run_blocking<F, R>(f: F) -> io::Result<R>
where
    F: FnOnce() -> io::Result<R> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(io::Error::other)?
}

/// Sweeps the cache of `coordinator` every `interval`, forever.
///
/// The first sweep happens one `interval` after this is called.
pub async fn run_sweeper(coordinator: Arc<FetchCoordinator>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if let Err(e) = coordinator.sweep(false).await {
            tracing::error!(error = &e as &dyn std::error::Error, "Failed to sweep cache");
        }
    }
}
