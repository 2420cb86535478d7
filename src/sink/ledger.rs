use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use tracing::{debug, info, warn};

use super::{clean_field, read_lines, render_lines, write_atomic, FIELD_SEPARATOR};

/// Cumulative bytes attributed to one country.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerTotals {
    pub download: u64,
    pub upload: u64,
}

/// Result of a [`Ledger::rotate`] check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    /// No marker existed; it now holds the current month.
    Initialized { month: String },
    /// Marker already matches the current month.
    Unchanged,
    /// The ledger was archived under `archived` and reset.
    Rotated { archived: String, pruned: usize },
}

/// Durable per-country totals with monthly rotation.
///
/// File format: `country|download_bytes|upload_bytes`, one line per country,
/// sorted by country, no header.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
    marker_path: PathBuf,
    retention: Duration,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>, marker_path: impl Into<PathBuf>, retention: Duration) -> Self {
        Self {
            path: path.into(),
            marker_path: marker_path.into(),
            retention,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the ledger. Malformed lines are skipped; a country listed twice
    /// is summed.
    pub fn load(&self) -> Result<BTreeMap<String, LedgerTotals>> {
        load_totals(&self.path)
    }

    /// Add per-country `(download, upload)` deltas and write the full map
    /// back. An empty or all-zero delta set does not touch the file.
    pub fn merge(&self, deltas: &BTreeMap<String, LedgerTotals>) -> Result<bool> {
        if deltas.values().all(|d| d.download == 0 && d.upload == 0) {
            return Ok(false);
        }

        let mut map = self.load()?;
        for (country, delta) in deltas {
            let country = clean_field(country);
            if country.is_empty() || (delta.download == 0 && delta.upload == 0) {
                continue;
            }
            add_totals(&mut map, country, *delta);
        }

        write_totals(&self.path, &map)?;
        Ok(true)
    }

    /// Archive and reset the ledger when the calendar month has changed
    /// since the last check, then prune expired archives.
    pub fn rotate(&self, today: NaiveDate) -> Result<RotationOutcome> {
        let current = month_label(today);

        let marker = match fs::read_to_string(&self.marker_path) {
            Ok(raw) => {
                let raw = raw.trim().to_string();
                if parse_month(&raw).is_some() {
                    Some(raw)
                } else {
                    warn!(marker = %raw, "ignoring malformed rotation marker");
                    None
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("reading {}", self.marker_path.display()))
            }
        };

        let Some(previous) = marker else {
            self.write_marker(&current)?;
            debug!(month = %current, "initialized rotation marker");
            return Ok(RotationOutcome::Initialized { month: current });
        };

        if previous == current {
            return Ok(RotationOutcome::Unchanged);
        }

        let archive = self.archive_path(&previous);
        self.archive_live(&archive)?;

        // Marker first; a failed prune does not fail the rotation.
        self.write_marker(&current)?;
        let pruned = match self.prune_archives(today) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "pruning ledger archives");
                0
            }
        };

        info!(
            archived = %archive.display(),
            month = %current,
            pruned,
            "rotated cumulative ledger",
        );

        Ok(RotationOutcome::Rotated {
            archived: previous,
            pruned,
        })
    }

    /// Move the live ledger to `archive` and leave an empty ledger behind.
    ///
    /// An archive left by an interrupted rotation is never replaced: the
    /// live totals are added into it instead.
    fn archive_live(&self, archive: &Path) -> Result<()> {
        if !self.path.exists() {
            debug!("no ledger to archive");
            return Ok(());
        }

        if archive.exists() {
            let mut archived = load_totals(archive)?;
            for (country, totals) in self.load()? {
                add_totals(&mut archived, country, totals);
            }
            write_totals(archive, &archived)?;
            warn!(archive = %archive.display(), "folded ledger into existing archive");
        } else {
            fs::rename(&self.path, archive).with_context(|| {
                format!("moving {} to {}", self.path.display(), archive.display())
            })?;
        }

        write_atomic(&self.path, b"")
    }

    /// Delete archives whose month ended longer than the retention window
    /// before `today`.
    pub fn prune_archives(&self, today: NaiveDate) -> Result<usize> {
        let Some(dir) = self.path.parent() else {
            return Ok(0);
        };
        let prefix = format!("{}.", self.file_name());
        let retention_days = i64::try_from(self.retention.as_secs() / 86_400).unwrap_or(i64::MAX);

        let entries = fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))?;
        let mut pruned = 0;

        for entry in entries {
            let Ok(entry) = entry else { continue };
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(suffix) = name.strip_prefix(&prefix) else {
                continue;
            };
            let Some(month_start) = parse_month(suffix) else {
                continue;
            };

            let age_days = (today - next_month(month_start)).num_days();
            if age_days > retention_days {
                fs::remove_file(entry.path())
                    .with_context(|| format!("removing {}", entry.path().display()))?;
                debug!(archive = %name, age_days, "pruned ledger archive");
                pruned += 1;
            }
        }

        Ok(pruned)
    }

    /// Path of the archive for the given `YYYY-MM` label.
    pub fn archive_path(&self, month: &str) -> PathBuf {
        self.path.with_file_name(format!("{}.{month}", self.file_name()))
    }

    fn write_marker(&self, month: &str) -> Result<()> {
        write_atomic(&self.marker_path, format!("{month}\n").as_bytes())
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn load_totals(path: &Path) -> Result<BTreeMap<String, LedgerTotals>> {
    let mut map = BTreeMap::new();
    for line in read_lines(path)? {
        match parse_line(&line) {
            Some((country, totals)) => add_totals(&mut map, country, totals),
            None => warn!(line = %line, "skipping malformed ledger line"),
        }
    }
    Ok(map)
}

fn add_totals(map: &mut BTreeMap<String, LedgerTotals>, country: String, delta: LedgerTotals) {
    let slot = map.entry(country).or_default();
    slot.download = slot.download.saturating_add(delta.download);
    slot.upload = slot.upload.saturating_add(delta.upload);
}

fn write_totals(path: &Path, map: &BTreeMap<String, LedgerTotals>) -> Result<()> {
    let body = render_lines(map.iter().map(|(country, t)| {
        format!(
            "{country}{sep}{down}{sep}{up}",
            down = t.download,
            up = t.upload,
            sep = FIELD_SEPARATOR,
        )
    }));
    write_atomic(path, body.as_bytes())
}

fn parse_line(line: &str) -> Option<(String, LedgerTotals)> {
    let mut fields = line.split(FIELD_SEPARATOR);
    let country = fields.next()?.trim();
    let download = fields.next()?.trim().parse().ok()?;
    let upload = fields.next()?.trim().parse().ok()?;
    if country.is_empty() || fields.next().is_some() {
        return None;
    }
    Some((country.to_string(), LedgerTotals { download, upload }))
}

/// `YYYY-MM` label of the month containing `date`.
pub fn month_label(date: NaiveDate) -> String {
    format!("{:04}-{:02}", date.year(), date.month())
}

/// First day of the month named by a `YYYY-MM` label.
fn parse_month(label: &str) -> Option<NaiveDate> {
    let (year, month) = label.split_once('-')?;
    if year.len() != 4 || month.len() != 2 {
        return None;
    }
    NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, 1)
}

fn next_month(first: NaiveDate) -> NaiveDate {
    let (year, month) = if first.month() == 12 {
        (first.year() + 1, 1)
    } else {
        (first.year(), first.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(first)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RETENTION: Duration = Duration::from_secs(90 * 86_400);

    fn ledger(dir: &Path) -> Ledger {
        Ledger::new(
            dir.join("cumulative_traffic"),
            dir.join("rotation_marker"),
            RETENTION,
        )
    }

    fn deltas(items: &[(&str, u64, u64)]) -> BTreeMap<String, LedgerTotals> {
        items
            .iter()
            .map(|(c, d, u)| {
                (
                    (*c).to_string(),
                    LedgerTotals {
                        download: *d,
                        upload: *u,
                    },
                )
            })
            .collect()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn test_merge_adds_and_sorts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = ledger(dir.path());

        ledger
            .merge(&deltas(&[("FR", 10, 20), ("DE", 1, 2)]))
            .expect("merge");
        ledger
            .merge(&deltas(&[("DE", 100, 200), ("AT", 5, 5)]))
            .expect("merge");

        let body = fs::read_to_string(ledger.path()).expect("read");
        assert_eq!(body, "AT|5|5\nDE|101|202\nFR|10|20\n");
    }

    #[test]
    fn test_empty_merge_is_byte_identical() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = ledger(dir.path());
        // Deliberately unsorted on disk.
        fs::write(ledger.path(), "FR|1|2\nDE|3|4\n").expect("seed");
        let before = fs::read(ledger.path()).expect("read");

        assert!(!ledger.merge(&BTreeMap::new()).expect("merge"));
        assert!(!ledger.merge(&deltas(&[("DE", 0, 0)])).expect("merge"));
        assert_eq!(fs::read(ledger.path()).expect("read"), before);
    }

    #[test]
    fn test_empty_merge_does_not_create_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = ledger(dir.path());
        ledger.merge(&BTreeMap::new()).expect("merge");
        assert!(!ledger.path().exists());
    }

    #[test]
    fn test_load_ignores_line_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = ledger(dir.path());
        fs::write(a.path(), "FR|1|2\nDE|3|4\n").expect("seed");
        let first = a.load().expect("load");

        fs::write(a.path(), "DE|3|4\nFR|1|2\n").expect("seed");
        let second = a.load().expect("load");

        assert_eq!(first, second);
        assert_eq!(
            first.get("DE"),
            Some(&LedgerTotals {
                download: 3,
                upload: 4
            })
        );
    }

    #[test]
    fn test_load_skips_malformed_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = ledger(dir.path());
        fs::write(ledger.path(), "DE|3|4\ngarbage\nFR|x|1\nUS|1|2|3\n").expect("seed");
        let map = ledger.load().expect("load");
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_rotation_initializes_missing_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = ledger(dir.path());
        let outcome = ledger.rotate(date(2024, 6, 3)).expect("rotate");
        assert_eq!(
            outcome,
            RotationOutcome::Initialized {
                month: "2024-06".to_string()
            }
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("rotation_marker")).expect("marker"),
            "2024-06\n"
        );
    }

    #[test]
    fn test_rotation_same_month_is_noop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = ledger(dir.path());
        fs::write(dir.path().join("rotation_marker"), "2024-06\n").expect("marker");
        ledger.merge(&deltas(&[("DE", 1, 1)])).expect("merge");

        assert_eq!(
            ledger.rotate(date(2024, 6, 30)).expect("rotate"),
            RotationOutcome::Unchanged
        );
        assert_eq!(ledger.load().expect("load").len(), 1);
    }

    #[test]
    fn test_rotation_on_month_change() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = ledger(dir.path());
        fs::write(dir.path().join("rotation_marker"), "2024-05").expect("marker");
        ledger.merge(&deltas(&[("DE", 7, 9)])).expect("merge");

        // Old archive (month ended 2024-02-01, > 90 days before 2024-06-10)
        // and a recent one (ended 2024-05-01).
        fs::write(dir.path().join("cumulative_traffic.2024-01"), "X|1|1\n").expect("old");
        fs::write(dir.path().join("cumulative_traffic.2024-04"), "Y|1|1\n").expect("recent");
        fs::write(dir.path().join("unrelated.2020-01"), "Z\n").expect("unrelated");

        let outcome = ledger.rotate(date(2024, 6, 10)).expect("rotate");
        assert_eq!(
            outcome,
            RotationOutcome::Rotated {
                archived: "2024-05".to_string(),
                pruned: 1
            }
        );

        assert_eq!(
            fs::read_to_string(ledger.archive_path("2024-05")).expect("archive"),
            "DE|7|9\n"
        );
        assert!(ledger.load().expect("load").is_empty());
        assert_eq!(
            fs::read_to_string(dir.path().join("rotation_marker")).expect("marker"),
            "2024-06\n"
        );
        assert!(!dir.path().join("cumulative_traffic.2024-01").exists());
        assert!(dir.path().join("cumulative_traffic.2024-04").exists());
        assert!(dir.path().join("unrelated.2020-01").exists());
    }

    #[test]
    fn test_failed_marker_write_keeps_archive_on_retry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = ledger(dir.path());
        fs::write(dir.path().join("rotation_marker"), "2024-05\n").expect("marker");
        ledger.merge(&deltas(&[("DE", 7, 9)])).expect("merge");

        // A directory squatting on the marker's temp file makes its write fail.
        let blocker = dir
            .path()
            .join(format!(".rotation_marker.tmp.{}", std::process::id()));
        fs::create_dir(&blocker).expect("blocker");
        assert!(ledger.rotate(date(2024, 6, 1)).is_err());
        assert_eq!(
            fs::read_to_string(ledger.archive_path("2024-05")).expect("archive"),
            "DE|7|9\n"
        );
        assert!(ledger.load().expect("load").is_empty());

        ledger.merge(&deltas(&[("FR", 1, 1)])).expect("merge");
        fs::remove_dir(&blocker).expect("unblock");

        let outcome = ledger.rotate(date(2024, 6, 1)).expect("retry");
        assert!(matches!(outcome, RotationOutcome::Rotated { ref archived, .. } if archived == "2024-05"));
        assert_eq!(
            fs::read_to_string(ledger.archive_path("2024-05")).expect("archive"),
            "DE|7|9\nFR|1|1\n"
        );
        assert!(ledger.load().expect("load").is_empty());
        assert_eq!(
            ledger.rotate(date(2024, 6, 2)).expect("rotate"),
            RotationOutcome::Unchanged
        );
    }

    #[test]
    fn test_rotation_folds_into_existing_archive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = ledger(dir.path());
        fs::write(dir.path().join("rotation_marker"), "2024-05\n").expect("marker");
        fs::write(ledger.archive_path("2024-05"), "DE|10|10\n").expect("archive");
        ledger.merge(&deltas(&[("DE", 1, 2), ("AT", 3, 4)])).expect("merge");

        ledger.rotate(date(2024, 6, 1)).expect("rotate");
        assert_eq!(
            fs::read_to_string(ledger.archive_path("2024-05")).expect("archive"),
            "AT|3|4\nDE|11|12\n"
        );
    }

    #[test]
    fn test_rotation_across_year_boundary() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = ledger(dir.path());
        fs::write(dir.path().join("rotation_marker"), "2023-12\n").expect("marker");
        ledger.merge(&deltas(&[("DE", 1, 1)])).expect("merge");

        let outcome = ledger.rotate(date(2024, 1, 1)).expect("rotate");
        assert!(matches!(outcome, RotationOutcome::Rotated { ref archived, .. } if archived == "2023-12"));
        assert!(ledger.archive_path("2023-12").exists());
    }

    #[test]
    fn test_month_helpers() {
        assert_eq!(month_label(date(2024, 5, 31)), "2024-05");
        assert_eq!(parse_month("2024-05"), Some(date(2024, 5, 1)));
        assert_eq!(parse_month("2024-5"), None);
        assert_eq!(parse_month("2024-13"), None);
        assert_eq!(next_month(date(2024, 12, 1)), date(2025, 1, 1));
    }
}
