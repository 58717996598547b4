//! Source address filtering based on periodically reloaded allow and deny lists.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::config::AccessConfig;

mod address_set;

pub use address_set::AddressSet;

/// The outcome of checking a source address against both lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Allowed,
    /// The address is on the blacklist. This wins over the whitelist.
    Blacklisted,
    /// The whitelist is non-empty and does not contain the address.
    NotWhitelisted,
}

impl AccessDecision {
    pub fn is_allowed(self) -> bool {
        self == AccessDecision::Allowed
    }
}

/// Decides whether `addr` may proceed.
///
/// `allow = (whitelist is empty OR addr in whitelist) AND addr not in blacklist`
pub fn decide(addr: &IpAddr, blacklist: &AddressSet, whitelist: &AddressSet) -> AccessDecision {
    if blacklist.contains(addr) {
        AccessDecision::Blacklisted
    } else if !whitelist.is_empty() && !whitelist.contains(addr) {
        AccessDecision::NotWhitelisted
    } else {
        AccessDecision::Allowed
    }
}

/// One address list file together with its current snapshot.
#[derive(Debug)]
struct AccessList {
    name: &'static str,
    path: Option<PathBuf>,
    refresh_interval: Duration,
    current: RwLock<Arc<AddressSet>>,
    /// Held while the file is being read, so only one caller reloads at a time.
    reloading: tokio::sync::Mutex<()>,
}

impl AccessList {
    fn new(name: &'static str, path: Option<PathBuf>, refresh_interval: Duration) -> Self {
        Self {
            name,
            path,
            refresh_interval,
            current: RwLock::new(Arc::new(AddressSet::default())),
            reloading: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns the current snapshot, reloading it first if it is too old.
    ///
    /// While one caller reloads, concurrent callers keep using the previous snapshot. Only callers
    /// that find a list that was never loaded wait for the reload to finish.
    async fn snapshot(&self) -> Arc<AddressSet> {
        let current = self.current.read().clone();
        if !current.is_stale(self.refresh_interval) {
            return current;
        }

        let _guard = if current.is_loaded() {
            match self.reloading.try_lock() {
                Ok(guard) => guard,
                Err(_) => return current,
            }
        } else {
            self.reloading.lock().await
        };

        // someone else might have refreshed while we were waiting for the lock
        let current = self.current.read().clone();
        if !current.is_stale(self.refresh_interval) {
            return current;
        }

        let fresh = Arc::new(self.load(&current).await);
        *self.current.write() = Arc::clone(&fresh);
        fresh
    }

    async fn load(&self, previous: &AddressSet) -> AddressSet {
        let Some(ref path) = self.path else {
            return AddressSet::empty();
        };

        match AddressSet::load(path).await {
            Ok(set) => {
                tracing::debug!(
                    list = self.name,
                    path = %path.display(),
                    entries = set.len(),
                    "Loaded address list"
                );
                set
            }
            Err(e) => {
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    list = self.name,
                    path = %path.display(),
                    "Failed to load address list, keeping previous entries",
                );
                // retry after the next refresh interval, not on every request
                previous.renewed()
            }
        }
    }
}

/// Decides whether a source address may use the proxy.
///
/// Both lists are re-read when they are older than the configured refresh interval. A missing
/// list file counts as an empty list, so with neither file present every address is allowed.
#[derive(Debug)]
pub struct AccessGate {
    blacklist: AccessList,
    whitelist: AccessList,
}

impl AccessGate {
    /// Creates a gate that has not read its lists yet.
    pub fn new(config: &AccessConfig) -> Self {
        Self {
            blacklist: AccessList::new(
                "blacklist",
                config.blacklist.clone(),
                config.refresh_interval,
            ),
            whitelist: AccessList::new(
                "whitelist",
                config.whitelist.clone(),
                config.refresh_interval,
            ),
        }
    }

    /// Creates a gate and eagerly reads both lists.
    pub async fn load(config: &AccessConfig) -> Self {
        let gate = Self::new(config);
        gate.blacklist.snapshot().await;
        gate.whitelist.snapshot().await;
        gate
    }

    /// Checks `addr` against the current lists.
    pub async fn check(&self, addr: IpAddr) -> AccessDecision {
        let blacklist = self.blacklist.snapshot().await;
        let whitelist = self.whitelist.snapshot().await;
        decide(&addr, &blacklist, &whitelist)
    }

    /// Whether `addr` may proceed.
    pub async fn allow(&self, addr: IpAddr) -> bool {
        self.check(addr).await.is_allowed()
    }
}
