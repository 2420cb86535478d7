use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{debug, warn};

use super::{clean_field, read_lines, render_lines, write_atomic, FIELD_SEPARATOR};

/// How a snapshot entry was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryStatus {
    /// Clients reported by an instance's own country summary.
    Seen,
    /// A peer currently connected to the instance.
    Connected,
}

impl EntryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Seen => "SEEN",
            Self::Connected => "CONNECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SEEN" => Some(Self::Seen),
            "CONNECTED" => Some(Self::Connected),
            _ => None,
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `STATUS|country|weight|source_tag` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub status: EntryStatus,
    pub country: String,
    pub weight: u64,
    pub source_tag: String,
}

impl SnapshotEntry {
    fn render(&self) -> String {
        format!(
            "{status}{sep}{country}{sep}{weight}{sep}{tag}",
            status = self.status,
            country = clean_field(&self.country),
            weight = self.weight,
            tag = clean_field(&self.source_tag),
            sep = FIELD_SEPARATOR,
        )
    }

    fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split(FIELD_SEPARATOR);
        let status = EntryStatus::parse(fields.next()?)?;
        let country = fields.next()?.to_string();
        let weight = fields.next()?.parse().ok()?;
        let source_tag = fields.next()?.to_string();
        if fields.next().is_some() {
            return None;
        }
        Some(Self {
            status,
            country,
            weight,
            source_tag,
        })
    }
}

/// Single-cycle view of per-country weights.
///
/// Each publish fully replaces the previous file; nothing is merged.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the published snapshot with `entries`.
    ///
    /// An empty cycle leaves the previous snapshot in place and returns
    /// `false`, so a transient outage does not blank the live view.
    pub fn publish(&self, entries: &[SnapshotEntry]) -> Result<bool> {
        if entries.is_empty() {
            debug!(path = %self.path.display(), "empty cycle, keeping previous snapshot");
            return Ok(false);
        }

        let body = render_lines(entries.iter().map(SnapshotEntry::render));
        write_atomic(&self.path, body.as_bytes())?;
        Ok(true)
    }

    /// Read back the published entries. Unparseable lines are skipped.
    pub fn read(&self) -> Result<Vec<SnapshotEntry>> {
        let lines = read_lines(&self.path)?;
        let mut out = Vec::with_capacity(lines.len());
        for line in &lines {
            match SnapshotEntry::parse(line) {
                Some(entry) => out.push(entry),
                None => warn!(line = %line, "skipping malformed snapshot line"),
            }
        }
        Ok(out)
    }

    /// Consumer-side aggregation: total weight per country.
    pub fn read_weights(&self) -> Result<BTreeMap<String, u64>> {
        let mut weights = BTreeMap::new();
        for entry in self.read()? {
            let slot = weights.entry(entry.country).or_insert(0u64);
            *slot = slot.saturating_add(entry.weight);
        }
        Ok(weights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(status: EntryStatus, country: &str, weight: u64, tag: &str) -> SnapshotEntry {
        SnapshotEntry {
            status,
            country: country.to_string(),
            weight,
            source_tag: tag.to_string(),
        }
    }

    #[test]
    fn test_publish_writes_exact_format() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path().join("snapshot"));

        let published = store
            .publish(&[
                entry(EntryStatus::Seen, "ir", 10, "relay-1"),
                entry(EntryStatus::Connected, "DE", 1, "relay-2"),
            ])
            .expect("publish");
        assert!(published);

        let body = std::fs::read_to_string(store.path()).expect("read");
        assert_eq!(body, "SEEN|ir|10|relay-1\nCONNECTED|DE|1|relay-2\n");
    }

    #[test]
    fn test_publish_replaces_never_merges() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path().join("snapshot"));

        store
            .publish(&[entry(EntryStatus::Seen, "ir", 10, "relay-1")])
            .expect("publish");
        store
            .publish(&[entry(EntryStatus::Connected, "FR", 1, "relay-2")])
            .expect("publish");

        let entries = store.read().expect("read");
        assert_eq!(entries, vec![entry(EntryStatus::Connected, "FR", 1, "relay-2")]);
    }

    #[test]
    fn test_empty_publish_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path().join("snapshot"));

        store
            .publish(&[entry(EntryStatus::Seen, "cn", 5, "relay-1")])
            .expect("publish");
        let before = std::fs::read(store.path()).expect("read");

        assert!(!store.publish(&[]).expect("publish"));
        assert_eq!(std::fs::read(store.path()).expect("read"), before);
    }

    #[test]
    fn test_read_weights_sums_by_country() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path().join("snapshot"));

        store
            .publish(&[
                entry(EntryStatus::Connected, "DE", 1, "relay-2"),
                entry(EntryStatus::Connected, "DE", 1, "relay-2"),
                entry(EntryStatus::Seen, "DE", 4, "relay-1"),
                entry(EntryStatus::Connected, "FR", 1, "relay-2"),
            ])
            .expect("publish");

        let weights = store.read_weights().expect("weights");
        assert_eq!(weights.get("DE"), Some(&6));
        assert_eq!(weights.get("FR"), Some(&1));
    }

    #[test]
    fn test_separator_in_country_is_stripped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path().join("snapshot"));
        store
            .publish(&[entry(EntryStatus::Seen, "d|e", 1, "relay-1")])
            .expect("publish");
        assert_eq!(store.read().expect("read")[0].country, "de");
    }
}
