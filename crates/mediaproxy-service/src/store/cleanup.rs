use std::fs::{read_dir, remove_file};
use std::io;
use std::path::Path;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::inflight::InFlightRegistry;

use super::{ContentStore, catch_not_found};

/// Entry function for the cleanup command.
///
/// Sweeps the content cache once. If `dry_run` is `true`, no files will actually be deleted.
pub fn cleanup(config: &Config, dry_run: bool) -> Result<SweepStats> {
    let store = ContentStore::from_config(config).context("failed to open the content cache")?;
    tracing::info!("Cleaning up `{}`", store.media_dir().display());

    // nothing is being fetched by this process
    let stats = store.sweep(&InFlightRegistry::default(), dry_run)?;
    tracing::info!("Cleaning up complete");

    Ok(stats)
}

/// Statistics about a single sweep of the content store.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_files: usize,
    pub retained_bytes: u64,

    /// Items skipped because they are currently being acquired.
    pub skipped_in_flight: usize,
    /// Items that could not be checked or removed.
    pub failed: usize,
}

enum Swept {
    Removed(u64),
    Retained(u64),
    /// Expired, but an acquisition for it is registered.
    InFlight,
    /// The file disappeared or is not a regular file.
    Ignored,
}

impl ContentStore {
    /// Removes every item that was last accessed longer than the TTL ago.
    ///
    /// Items whose identifier is registered in `in_flight` are left alone, they are about to be
    /// replaced. Failures on individual items are reported and the sweep continues with the
    /// remaining ones. If `dry_run` is `true`, no files will actually be deleted.
    pub fn sweep(&self, in_flight: &InFlightRegistry, dry_run: bool) -> io::Result<SweepStats> {
        let mut stats = SweepStats::default();

        let entries = match catch_not_found(|| read_dir(&self.media_dir))? {
            Some(entries) => entries,
            None => {
                tracing::warn!("Directory not found: `{}`", self.media_dir.display());
                return Ok(stats);
            }
        };
        tracing::debug!("Sweeping directory `{}`", self.media_dir.display());

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::error!("Failed to read cache directory entry: {:?}", e);
                    stats.failed += 1;
                    continue;
                }
            };
            let path = entry.path();
            let file_name = entry.file_name();

            match self.try_sweep_path(&path, file_name.to_str(), in_flight, dry_run) {
                Ok(Swept::InFlight) => {
                    tracing::debug!("Skipping `{}`, it is being fetched", path.display());
                    stats.skipped_in_flight += 1;
                }
                Ok(Swept::Removed(size)) => {
                    tracing::info!("Expired `{}`", path.display());
                    stats.removed_files += 1;
                    stats.removed_bytes += size;
                }
                Ok(Swept::Retained(size)) => {
                    stats.retained_files += 1;
                    stats.retained_bytes += size;
                }
                Ok(Swept::Ignored) => {}
                Err(e) => {
                    sentry::with_scope(
                        |scope| scope.set_extra("path", path.display().to_string().into()),
                        || tracing::error!("Failed to clean cache file: {:?}", e),
                    );
                    stats.failed += 1;
                }
            }
        }

        tracing::info!(
            "Retained {} files, totaling {} bytes",
            stats.retained_files,
            stats.retained_bytes,
        );
        tracing::info!(
            "Removed {} files, totaling {} bytes",
            stats.removed_files,
            stats.removed_bytes,
        );

        metric!(gauge("caches.sweep.retained_files") = stats.retained_files as u64);
        metric!(gauge("caches.sweep.retained_bytes") = stats.retained_bytes);
        metric!(counter("caches.sweep.removed_files") += stats.removed_files as i64);
        metric!(counter("caches.sweep.removed_bytes") += stats.removed_bytes as i64);
        metric!(counter("caches.sweep.failed") += stats.failed as i64);

        Ok(stats)
    }

    /// Checks the item at `path` and removes it if it expired.
    ///
    /// The registry lock is only taken for items that look expired. Under it the expiry is checked
    /// again before removal, as the item may have been refreshed or replaced in the meantime.
    fn try_sweep_path(
        &self,
        path: &Path,
        name: Option<&str>,
        in_flight: &InFlightRegistry,
        dry_run: bool,
    ) -> io::Result<Swept> {
        tracing::trace!("Checking file `{}`", path.display());
        let Some(metadata) = catch_not_found(|| path.metadata())? else {
            return Ok(Swept::Ignored);
        };
        if !metadata.is_file() {
            tracing::debug!("Ignoring `{}`, not a file", path.display());
            return Ok(Swept::Ignored);
        }
        let size = metadata.len();

        match catch_not_found(|| self.is_expired(path))? {
            None => return Ok(Swept::Ignored),
            Some(false) => return Ok(Swept::Retained(size)),
            Some(true) => {}
        }

        // no acquisition for the item can start while it is removed
        let removed = match name {
            Some(name) => in_flight.with_idle(name, || self.remove_expired(path, size, dry_run)),
            None => Some(self.remove_expired(path, size, dry_run)),
        };
        removed.unwrap_or(Ok(Swept::InFlight))
    }

    fn remove_expired(&self, path: &Path, size: u64, dry_run: bool) -> io::Result<Swept> {
        match catch_not_found(|| self.is_expired(path))? {
            None => Ok(Swept::Ignored),
            Some(false) => Ok(Swept::Retained(size)),
            Some(true) => {
                tracing::debug!("Removing file `{}`", path.display());
                if !dry_run && catch_not_found(|| remove_file(path))?.is_none() {
                    return Ok(Swept::Ignored);
                }
                Ok(Swept::Removed(size))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::{Duration, SystemTime};

    use bytes::Bytes;
    use filetime::FileTime;

    use crate::identifier::MediaId;
    use crate::inflight::FetchResult;

    use super::*;

    fn id(s: &str) -> MediaId {
        MediaId::new(s).unwrap()
    }

    fn store(dir: &Path) -> ContentStore {
        ContentStore::new(
            dir.join("media"),
            dir.join("tmp"),
            Duration::from_secs(1200),
        )
        .unwrap()
    }

    fn put_aged(store: &ContentStore, media: &MediaId, contents: &[u8], age: Duration) {
        store.put(media, contents).unwrap();
        let then = FileTime::from_system_time(SystemTime::now() - age);
        filetime::set_file_times(store.path_for(media), then, then).unwrap();
    }

    #[test]
    fn test_sweep_respects_ttl_boundary() {
        mediaproxy_test::setup();
        let dir = mediaproxy_test::tempdir();
        let store = store(dir.path());
        let registry = InFlightRegistry::default();

        let old = id("oldoldoldol");
        let young = id("youngyoungy");
        put_aged(&store, &old, &[0; 100], Duration::from_secs(1201));
        put_aged(&store, &young, &[0; 30], Duration::from_secs(1199));

        let stats = store.sweep(&registry, false).unwrap();
        assert_eq!(
            stats,
            SweepStats {
                removed_files: 1,
                removed_bytes: 100,
                retained_files: 1,
                retained_bytes: 30,
                skipped_in_flight: 0,
                failed: 0,
            }
        );
        assert_eq!(store.lookup(&old).unwrap(), None);
        assert!(store.lookup(&young).unwrap().is_some());
    }

    #[test]
    fn test_sweep_is_idempotent() {
        let dir = mediaproxy_test::tempdir();
        let store = store(dir.path());
        let registry = InFlightRegistry::default();

        put_aged(&store, &id("aaaaaaaaaaa"), b"a", Duration::from_secs(5000));
        put_aged(&store, &id("bbbbbbbbbbb"), b"b", Duration::from_secs(10));

        let first = store.sweep(&registry, false).unwrap();
        assert_eq!(first.removed_files, 1);
        assert_eq!(first.retained_files, 1);

        let second = store.sweep(&registry, false).unwrap();
        assert_eq!(second.removed_files, 0);
        assert_eq!(second.retained_files, 1);

        let remaining: Vec<_> = fs::read_dir(store.media_dir())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(remaining, ["bbbbbbbbbbb"]);
    }

    #[test]
    fn test_sweep_dry_run_keeps_files() {
        let dir = mediaproxy_test::tempdir();
        let store = store(dir.path());
        let media = id("aaaaaaaaaaa");
        put_aged(&store, &media, b"a", Duration::from_secs(5000));

        let stats = store.sweep(&InFlightRegistry::default(), true).unwrap();
        assert_eq!(stats.removed_files, 1);
        assert!(store.path_for(&media).exists());
    }

    #[test]
    fn test_sweep_skips_in_flight() {
        let dir = mediaproxy_test::tempdir();
        let store = store(dir.path());
        let registry = InFlightRegistry::default();
        let media = id("aaaaaaaaaaa");
        put_aged(&store, &media, b"a", Duration::from_secs(5000));

        let _pending = registry
            .join_or_start(&media, |token| async move {
                let _token = token;
                futures::future::pending::<FetchResult>().await
            })
            .into_future();

        let stats = store.sweep(&registry, false).unwrap();
        assert_eq!(stats.skipped_in_flight, 1);
        assert_eq!(stats.removed_files, 0);
        assert_eq!(
            store.lookup(&media).unwrap(),
            Some(Bytes::from_static(b"a"))
        );
    }

    #[test]
    fn test_sweep_keeps_fresh_in_flight_items() {
        let dir = mediaproxy_test::tempdir();
        let store = store(dir.path());
        let registry = InFlightRegistry::default();
        let media = id("aaaaaaaaaaa");
        put_aged(&store, &media, b"a", Duration::from_secs(10));

        let _pending = registry
            .join_or_start(&media, |token| async move {
                let _token = token;
                futures::future::pending::<FetchResult>().await
            })
            .into_future();

        let stats = store.sweep(&registry, false).unwrap();
        assert_eq!(stats.retained_files, 1);
        assert_eq!(stats.skipped_in_flight, 0);
        assert!(registry.is_in_flight(&media));
    }

    #[cfg(unix)]
    #[test]
    fn test_sweep_continues_after_failure() {
        mediaproxy_test::setup();
        let dir = mediaproxy_test::tempdir();
        let store = store(dir.path());
        let expired = id("aaaaaaaaaaa");
        put_aged(&store, &expired, b"a", Duration::from_secs(5000));

        // resolving a symlink to itself fails with ELOOP
        let looping = store.media_dir().join("loopxxxxxxx");
        std::os::unix::fs::symlink(&looping, &looping).unwrap();

        let stats = store.sweep(&InFlightRegistry::default(), false).unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.removed_files, 1);
        assert!(!store.path_for(&expired).exists());
        assert!(looping.symlink_metadata().is_ok());
    }

    #[test]
    fn test_sweep_ignores_directories() {
        let dir = mediaproxy_test::tempdir();
        let store = store(dir.path());
        fs::create_dir(store.media_dir().join("nested")).unwrap();

        let stats = store.sweep(&InFlightRegistry::default(), false).unwrap();
        assert_eq!(stats, SweepStats::default());
        assert!(store.media_dir().join("nested").is_dir());
    }

    #[test]
    fn test_cleanup_command() {
        let dir = mediaproxy_test::tempdir();
        let config = Config {
            cache_dir: dir.path().to_owned(),
            ..Config::default()
        };
        let store = ContentStore::from_config(&config).unwrap();
        put_aged(&store, &id("aaaaaaaaaaa"), b"a", Duration::from_secs(1201));
        put_aged(&store, &id("bbbbbbbbbbb"), b"b", Duration::from_secs(0));

        let stats = cleanup(&config, false).unwrap();
        assert_eq!(stats.removed_files, 1);
        assert_eq!(stats.retained_files, 1);
        assert!(dir.path().join("media/bbbbbbbbbbb").exists());
        assert!(!dir.path().join("media/aaaaaaaaaaa").exists());
    }

    #[test]
    fn test_sweep_missing_directory() {
        let dir = mediaproxy_test::tempdir();
        let store = store(dir.path());
        fs::remove_dir_all(store.media_dir()).unwrap();

        let stats = store.sweep(&InFlightRegistry::default(), false).unwrap();
        assert_eq!(stats, SweepStats::default());
    }
}
