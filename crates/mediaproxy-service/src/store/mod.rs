//! The disk-backed content cache.
//!
//! Every cached item is a single file in the media directory, named after its identifier and
//! containing exactly the bytes that are served. Files are written to a sibling temporary
//! directory first and then renamed into place, so a file in the media directory is always
//! complete.
//!
//! We use `mtime` to keep track of the last access of an item, because `atime` is unreliable as
//! most filesystems are mounted with `noatime`. A hit touches both.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use filetime::FileTime;
use tempfile::NamedTempFile;

use crate::config::Config;
use crate::identifier::MediaId;

mod cleanup;

pub use cleanup::{SweepStats, cleanup};

#[derive(Debug, Clone)]
pub struct ContentStore {
    /// Directory holding one file per cached identifier. Created if it does not exist.
    media_dir: PathBuf,

    /// Directory for files that are still being written.
    ///
    /// It has to be on the same filesystem as `media_dir`, so that moving a finished file into
    /// place is an atomic rename.
    tmp_dir: PathBuf,

    /// Maximum time since the last access before an item is swept.
    ttl: Duration,
}

impl ContentStore {
    pub fn from_config(config: &Config) -> io::Result<Self> {
        Self::new(
            config.cache_dir("media"),
            config.cache_dir("tmp"),
            config.caches.ttl,
        )
    }

    pub fn new(media_dir: PathBuf, tmp_dir: PathBuf, ttl: Duration) -> io::Result<Self> {
        fs::create_dir_all(&media_dir)?;
        fs::create_dir_all(&tmp_dir)?;

        Ok(Self {
            media_dir,
            tmp_dir,
            ttl,
        })
    }

    pub fn media_dir(&self) -> &Path {
        &self.media_dir
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The location of the cache file for `id`.
    pub fn path_for(&self, id: &MediaId) -> PathBuf {
        self.media_dir.join(id.as_str())
    }

    /// Reads the cached content for `id`, or `None` on a miss.
    ///
    /// A hit refreshes the last access time of the item.
    pub fn lookup(&self, id: &MediaId) -> io::Result<Option<Bytes>> {
        let path = self.path_for(id);
        let Some(contents) = catch_not_found(|| fs::read(&path))? else {
            return Ok(None);
        };

        // the contents are complete at this point, a failed touch only shortens the item's life
        let now = FileTime::now();
        if let Err(e) = filetime::set_file_times(&path, now, now) {
            tracing::warn!(
                error = &e as &dyn std::error::Error,
                path = %path.display(),
                "Failed to refresh access time of cache file",
            );
        }

        Ok(Some(Bytes::from(contents)))
    }

    /// Stores `contents` as the complete content for `id`, replacing any previous item.
    ///
    /// Readers either see the previous item or the new one, never a partially written file.
    pub fn put(&self, id: &MediaId, contents: &[u8]) -> io::Result<()> {
        let mut file = self.tempfile()?;
        file.write_all(contents)?;
        file.as_file().sync_data()?;

        let path = self.path_for(id);
        file.persist(&path).map_err(|e| e.error)?;
        tracing::trace!("Stored {} bytes at `{}`", contents.len(), path.display());

        Ok(())
    }

    /// Removes leftover temporary files.
    ///
    /// This needs to happen on startup to avoid accidentally leaving temporary files which
    /// survive a hard crash.
    pub fn clear_tmp(&self) -> io::Result<()> {
        if self.tmp_dir.exists() {
            fs::remove_dir_all(&self.tmp_dir)?;
        }
        fs::create_dir_all(&self.tmp_dir)
    }

    /// Whether the item at `path` was last accessed longer than the TTL ago.
    fn is_expired(&self, path: &Path) -> io::Result<bool> {
        let mtime = path.metadata()?.modified()?;
        Ok(elapsed_since(mtime) > self.ttl)
    }

    /// Create a new temporary file next to the media directory.
    fn tempfile(&self) -> io::Result<NamedTempFile> {
        // The temporary directory may have been cleared underneath us, so retry the fs operations.
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = fs::create_dir_all(&self.tmp_dir) {
                sentry::with_scope(
                    |scope| scope.set_extra("path", self.tmp_dir.display().to_string().into()),
                    || tracing::error!("Failed to create temporary directory: {:?}", e),
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match tempfile::Builder::new()
                .prefix("tmp")
                .tempfile_in(&self.tmp_dir)
            {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    sentry::with_scope(
                        |scope| scope.set_extra("path", self.tmp_dir.display().to_string().into()),
                        || tracing::error!("Failed to create temporary file: {:?}", e),
                    );
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                }
            }
        }
    }
}

fn elapsed_since(time: SystemTime) -> Duration {
    // timestamps in the future count as fresh
    time.elapsed().unwrap_or_default()
}

/// Turns a `NotFound` error into `Ok(None)`.
pub(crate) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}

#[cfg(test)]
mod tests {
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

    fn set_age(path: &Path, age: Duration) {
        let then = FileTime::from_system_time(SystemTime::now() - age);
        filetime::set_file_times(path, then, then).unwrap();
    }

    #[test]
    fn test_put_then_lookup() {
        let dir = mediaproxy_test::tempdir();
        let store = store(dir.path());
        let media = id("abcdefghijk");

        assert_eq!(store.lookup(&media).unwrap(), None);

        store.put(&media, b"some audio bytes").unwrap();
        assert_eq!(
            store.lookup(&media).unwrap(),
            Some(Bytes::from_static(b"some audio bytes"))
        );
        assert_eq!(
            fs::read(dir.path().join("media/abcdefghijk")).unwrap(),
            b"some audio bytes"
        );
    }

    #[test]
    fn test_put_replaces_previous_content() {
        let dir = mediaproxy_test::tempdir();
        let store = store(dir.path());
        let media = id("abcdefghijk");

        store.put(&media, &[1; 4096]).unwrap();
        store.put(&media, &[2; 10]).unwrap();
        assert_eq!(store.lookup(&media).unwrap().unwrap().as_ref(), &[2; 10]);
    }

    #[test]
    fn test_put_leaves_no_temporary_files() {
        let dir = mediaproxy_test::tempdir();
        let store = store(dir.path());

        store.put(&id("abcdefghijk"), b"x").unwrap();
        assert_eq!(fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    }

    #[test]
    fn test_put_recreates_tmp_dir() {
        let dir = mediaproxy_test::tempdir();
        let store = store(dir.path());
        fs::remove_dir_all(dir.path().join("tmp")).unwrap();

        store.put(&id("abcdefghijk"), b"x").unwrap();
        assert!(store.lookup(&id("abcdefghijk")).unwrap().is_some());
    }

    #[test]
    fn test_lookup_refreshes_access_time() {
        let dir = mediaproxy_test::tempdir();
        let store = store(dir.path());
        let media = id("abcdefghijk");
        store.put(&media, b"x").unwrap();

        let path = store.path_for(&media);
        set_age(&path, Duration::from_secs(1000));
        assert!(store.lookup(&media).unwrap().is_some());

        let mtime = path.metadata().unwrap().modified().unwrap();
        assert!(elapsed_since(mtime) < Duration::from_secs(60));
    }

    #[test]
    fn test_clear_tmp() {
        let dir = mediaproxy_test::tempdir();
        let store = store(dir.path());
        fs::write(dir.path().join("tmp/tmpleftover"), b"partial").unwrap();

        store.clear_tmp().unwrap();
        assert!(dir.path().join("tmp").is_dir());
        assert_eq!(fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    }

    #[test]
    fn test_catch_not_found() {
        let result = catch_not_found(|| Err::<(), _>(io::ErrorKind::NotFound.into()));
        assert!(matches!(result, Ok(None)));

        let result = catch_not_found(|| Err::<(), _>(io::ErrorKind::PermissionDenied.into()));
        assert!(result.is_err());
    }
}
