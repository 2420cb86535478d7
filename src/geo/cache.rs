use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{debug, warn};

use super::{country_key, UNKNOWN_COUNTRY};
use crate::sink::{clean_field, read_lines, render_lines, write_atomic, FIELD_SEPARATOR};

/// Longest country name kept in the cache.
pub const MAX_NAME_CHARS: usize = 64;

/// Persistent `ip|country_name` cache, trimmed by insertion order.
#[derive(Debug)]
pub struct GeoCache {
    path: PathBuf,
    max_entries: usize,
    trim_to: usize,
    entries: HashMap<Ipv4Addr, String>,
    order: VecDeque<Ipv4Addr>,
    dirty: bool,
}

impl GeoCache {
    /// Empty cache that persists to `path`.
    pub fn new(path: impl Into<PathBuf>, max_entries: usize, trim_to: usize) -> Self {
        Self {
            path: path.into(),
            max_entries,
            trim_to: trim_to.min(max_entries),
            entries: HashMap::new(),
            order: VecDeque::new(),
            dirty: false,
        }
    }

    /// Load the cache from `path`. A missing file yields an empty cache;
    /// malformed lines are dropped and rewritten away on the next persist.
    pub fn load(path: impl Into<PathBuf>, max_entries: usize, trim_to: usize) -> Result<Self> {
        let mut cache = Self::new(path, max_entries, trim_to);
        let mut skipped = 0usize;

        for line in read_lines(&cache.path)? {
            let parsed = line
                .split_once(FIELD_SEPARATOR)
                .and_then(|(ip, name)| Some((ip.trim().parse::<Ipv4Addr>().ok()?, name)));
            match parsed {
                Some((ip, name)) => {
                    if cache.entries.contains_key(&ip) {
                        skipped += 1;
                    }
                    cache.put(ip, sanitize_name(name));
                }
                None => skipped += 1,
            }
        }

        if skipped > 0 {
            warn!(path = %cache.path.display(), skipped, "dropped malformed or duplicate geo cache lines");
            cache.dirty = true;
        }
        cache.trim();

        Ok(cache)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, ip: &Ipv4Addr) -> Option<&str> {
        self.entries.get(ip).map(String::as_str)
    }

    /// Store a result. Re-inserting an identical entry is a no-op.
    pub fn insert(&mut self, ip: Ipv4Addr, name: &str) {
        let name = sanitize_name(name);
        if self.entries.get(&ip) == Some(&name) {
            return;
        }
        self.put(ip, name);
        self.dirty = true;
        self.trim();
    }

    fn put(&mut self, ip: Ipv4Addr, name: String) {
        if self.entries.insert(ip, name).is_some() {
            self.order.retain(|o| *o != ip);
        }
        self.order.push_back(ip);
    }

    fn trim(&mut self) {
        if self.order.len() <= self.max_entries {
            return;
        }
        let drop = self.order.len() - self.trim_to;
        for ip in self.order.drain(..drop) {
            self.entries.remove(&ip);
        }
        self.dirty = true;
        debug!(dropped = drop, kept = self.order.len(), "trimmed geo cache");
    }

    /// Write the cache if anything changed since the last load or persist.
    pub fn persist(&mut self) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        let body = render_lines(self.order.iter().filter_map(|ip| {
            self.entries
                .get(ip)
                .map(|name| format!("{ip}{FIELD_SEPARATOR}{name}"))
        }));
        write_atomic(&self.path, body.as_bytes())?;
        self.dirty = false;
        Ok(true)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Strip the field separator and control characters and cap the length.
/// Country codes come out upper-cased; an empty result maps to the unknown
/// marker.
pub fn sanitize_name(raw: &str) -> String {
    let cleaned: String = clean_field(raw).chars().take(MAX_NAME_CHARS).collect();
    let cleaned = cleaned.trim_end();
    if cleaned.is_empty() {
        UNKNOWN_COUNTRY.to_string()
    } else {
        country_key(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("Germany"), "Germany");
        assert_eq!(sanitize_name("Ger|ma\nny\r"), "Germany");
        assert_eq!(sanitize_name("  "), UNKNOWN_COUNTRY);
        assert_eq!(sanitize_name(&"x".repeat(100)).len(), MAX_NAME_CHARS);
        assert_eq!(sanitize_name("de\n"), "DE");
    }

    #[test]
    fn test_insert_same_value_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cache = GeoCache::new(dir.path().join("geo_cache"), 10, 5);

        cache.insert(Ipv4Addr::new(1, 1, 1, 1), "DE");
        assert!(cache.persist().expect("persist"));
        let first = std::fs::read_to_string(cache.path()).expect("read");

        cache.insert(Ipv4Addr::new(1, 1, 1, 1), "DE");
        assert!(!cache.is_dirty());
        assert!(!cache.persist().expect("persist"));
        assert_eq!(std::fs::read_to_string(cache.path()).expect("read"), first);
        assert_eq!(first, "1.1.1.1|DE\n");
    }

    #[test]
    fn test_trim_keeps_most_recent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cache = GeoCache::new(dir.path().join("geo_cache"), 10_000, 5_000);

        for i in 0..10_001u32 {
            cache.insert(Ipv4Addr::from(0x0a00_0000 + i), "DE");
        }

        assert_eq!(cache.len(), 5_000);
        assert!(cache.get(&Ipv4Addr::from(0x0a00_0000)).is_none());
        assert!(cache.get(&Ipv4Addr::from(0x0a00_0000 + 10_000)).is_some());
        assert!(cache.get(&Ipv4Addr::from(0x0a00_0000 + 5_001)).is_some());
        assert!(cache.get(&Ipv4Addr::from(0x0a00_0000 + 5_000)).is_none());

        cache.persist().expect("persist");
        assert_eq!(read_lines(cache.path()).expect("read").len(), 5_000);
    }

    #[test]
    fn test_load_round_trip_and_bad_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("geo_cache");
        std::fs::write(&path, "1.2.3.4|DE\nnot-an-ip|FR\n5.6.7.8|France\n").expect("seed");

        let mut cache = GeoCache::load(&path, 10, 5).expect("load");
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&Ipv4Addr::new(1, 2, 3, 4)), Some("DE"));
        assert_eq!(cache.get(&Ipv4Addr::new(5, 6, 7, 8)), Some("France"));

        assert!(cache.persist().expect("persist"));
        assert_eq!(
            std::fs::read_to_string(&path).expect("read"),
            "1.2.3.4|DE\n5.6.7.8|France\n"
        );
    }

    #[test]
    fn test_load_clean_file_is_not_dirty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("geo_cache");
        std::fs::write(&path, "1.2.3.4|DE\n").expect("seed");

        let cache = GeoCache::load(&path, 10, 5).expect("load");
        assert!(!cache.is_dirty());
    }

    #[test]
    fn test_reinsert_changed_value_moves_to_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cache = GeoCache::new(dir.path().join("geo_cache"), 3, 2);
        let a = Ipv4Addr::new(1, 0, 0, 1);
        let b = Ipv4Addr::new(1, 0, 0, 2);
        let c = Ipv4Addr::new(1, 0, 0, 3);
        let d = Ipv4Addr::new(1, 0, 0, 4);

        cache.insert(a, "Unknown");
        cache.insert(b, "DE");
        cache.insert(c, "FR");
        cache.insert(a, "NL");
        cache.insert(d, "SE");

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&a), Some("NL"));
        assert_eq!(cache.get(&d), Some("SE"));
    }
}
