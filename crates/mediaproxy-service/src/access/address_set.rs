use std::collections::HashSet;
use std::io;
use std::net::IpAddr;
use std::path::Path;
use std::time::{Duration, Instant};

/// An immutable snapshot of an address list file.
///
/// Every member passed strict IP literal validation. Snapshots are never mutated, a refresh
/// builds a new one and replaces the old one as a whole.
#[derive(Debug, Clone, Default)]
pub struct AddressSet {
    addrs: HashSet<IpAddr>,
    /// When the source file was read, `None` for a set that was never loaded.
    loaded_at: Option<Instant>,
}

impl AddressSet {
    /// Creates an empty set that counts as loaded right now.
    pub fn empty() -> Self {
        Self {
            addrs: HashSet::new(),
            loaded_at: Some(Instant::now()),
        }
    }

    /// Parses a line-oriented list of IPv4 and IPv6 literals.
    ///
    /// Surrounding whitespace is trimmed. Blank and malformed lines are skipped.
    pub fn parse(contents: &str) -> Self {
        let addrs = contents
            .lines()
            .filter_map(|line| line.trim().parse::<IpAddr>().ok())
            .map(|addr| addr.to_canonical())
            .collect();

        Self {
            addrs,
            loaded_at: Some(Instant::now()),
        }
    }

    /// Reads the list at `path`.
    ///
    /// A missing file is an empty list. Any other error is returned to the caller.
    pub async fn load(path: &Path) -> io::Result<Self> {
        match tokio::fs::read(path).await {
            Ok(contents) => Ok(Self::parse(&String::from_utf8_lossy(&contents))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::empty()),
            Err(e) => Err(e),
        }
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.addrs.contains(&addr.to_canonical())
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    /// Whether this snapshot should be read again.
    pub fn is_stale(&self, refresh_interval: Duration) -> bool {
        self.loaded_at
            .is_none_or(|loaded_at| loaded_at.elapsed() > refresh_interval)
    }

    /// Whether this set was ever successfully loaded.
    pub fn is_loaded(&self) -> bool {
        self.loaded_at.is_some()
    }

    /// Marks this set as freshly loaded without changing its members.
    pub(super) fn renewed(&self) -> Self {
        Self {
            addrs: self.addrs.clone(),
            loaded_at: Some(Instant::now()),
        }
    }
}

impl FromIterator<IpAddr> for AddressSet {
    fn from_iter<I: IntoIterator<Item = IpAddr>>(iter: I) -> Self {
        Self {
            addrs: iter.into_iter().map(|addr| addr.to_canonical()).collect(),
            loaded_at: Some(Instant::now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;

    #[test]
    fn test_parse_skips_malformed_lines() {
        let set = AddressSet::parse(
            "10.0.0.1\n\n  192.168.1.7  \nnot-an-ip\n999.1.1.1\n::1\n10.0.0.0/8\n2001:db8::42\r\n",
        );

        assert_eq!(set.len(), 4);
        assert!(set.contains(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert!(set.contains(&IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7))));
        assert!(set.contains(&IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(set.contains(&"2001:db8::42".parse().unwrap()));
        assert!(!set.contains(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))));
    }

    #[test]
    fn test_mapped_ipv4_matches() {
        let set = AddressSet::parse("1.2.3.4\n");
        let mapped: IpAddr = "::ffff:1.2.3.4".parse().unwrap();
        assert!(set.contains(&mapped));

        let set = AddressSet::parse("::ffff:5.6.7.8\n");
        assert!(set.contains(&IpAddr::V4(Ipv4Addr::new(5, 6, 7, 8))));
    }

    #[test]
    fn test_staleness() {
        assert!(AddressSet::default().is_stale(Duration::from_secs(60)));
        assert!(!AddressSet::default().is_loaded());

        let set = AddressSet::empty();
        assert!(set.is_loaded());
        assert!(!set.is_stale(Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(20));
        assert!(set.is_stale(Duration::from_millis(10)));
        assert!(!set.renewed().is_stale(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = mediaproxy_test::tempdir();
        let set = AddressSet::load(&dir.path().join("missing.txt"))
            .await
            .unwrap();
        assert!(set.is_empty());
        assert!(set.is_loaded());
    }

    #[tokio::test]
    async fn test_load_file() {
        let dir = mediaproxy_test::tempdir();
        let path = mediaproxy_test::write_lines(dir.path(), "list.txt", &["127.0.0.1", "junk"]);
        let set = AddressSet::load(&path).await.unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.contains(&IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }

    #[tokio::test]
    async fn test_load_directory_fails() {
        let dir = mediaproxy_test::tempdir();
        assert!(AddressSet::load(dir.path()).await.is_err());
    }
}
