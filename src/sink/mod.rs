//! File-backed stores shared with read-only consumers.
//!
//! Exactly one process writes each file. Every write goes to a temporary
//! file in the same directory which is then renamed over the target, so a
//! reader sees either the old or the new content, never a partial file.

pub mod ledger;
pub mod snapshot;
pub mod visitors;

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub use ledger::{Ledger, LedgerTotals, RotationOutcome};
pub use snapshot::{EntryStatus, SnapshotEntry, SnapshotStore};
pub use visitors::VisitorLedger;

/// Field separator of every persisted line format.
pub const FIELD_SEPARATOR: char = '|';

/// Atomically replace `path` with `contents`.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = temp_path(path);

    let result = (|| -> Result<()> {
        let mut file =
            File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
        file.write_all(contents)
            .with_context(|| format!("writing {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("syncing {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Read the non-empty lines of `path`; a missing file reads as empty.
pub fn read_lines(path: &Path) -> Result<Vec<String>> {
    match fs::read_to_string(path) {
        Ok(data) => Ok(data
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

/// Join lines with a trailing newline after each.
pub fn render_lines<I, S>(lines: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for line in lines {
        out.push_str(line.as_ref());
        out.push('\n');
    }
    out
}

/// Remove the field separator and control characters from a value.
pub fn clean_field(value: &str) -> String {
    value
        .chars()
        .filter(|c| *c != FIELD_SEPARATOR && !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp.{}", std::process::id()))
}
