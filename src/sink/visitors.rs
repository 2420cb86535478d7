use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::debug;

use super::{clean_field, read_lines, render_lines, write_atomic, FIELD_SEPARATOR};

/// Append-only record of distinct `country|ip` pairs, size-capped.
#[derive(Debug, Clone)]
pub struct VisitorLedger {
    path: PathBuf,
    max_lines: usize,
    trim_to: usize,
}

impl VisitorLedger {
    pub fn new(path: impl Into<PathBuf>, max_lines: usize, trim_to: usize) -> Self {
        Self {
            path: path.into(),
            max_lines,
            trim_to: trim_to.min(max_lines),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a single pair; returns whether it was new.
    pub fn record_if_new(&self, country: &str, ip: Ipv4Addr) -> Result<bool> {
        Ok(self.record_all(&[(country.to_string(), ip)])? == 1)
    }

    /// Append every pair not already present, trimming to the most recent
    /// `trim_to` lines once the file grows past `max_lines`. Returns the
    /// number of pairs appended.
    pub fn record_all(&self, pairs: &[(String, Ipv4Addr)]) -> Result<usize> {
        if pairs.is_empty() {
            return Ok(0);
        }

        let mut lines = read_lines(&self.path)?;
        let mut known: HashSet<String> = lines.iter().cloned().collect();
        let mut added = 0;

        for (country, ip) in pairs {
            let line = format!("{}{FIELD_SEPARATOR}{ip}", clean_field(country));
            if known.insert(line.clone()) {
                lines.push(line);
                added += 1;
            }
        }

        if added == 0 {
            return Ok(0);
        }

        if lines.len() > self.max_lines {
            let drop = lines.len() - self.trim_to;
            lines.drain(..drop);
            debug!(dropped = drop, kept = lines.len(), "trimmed unique-visitor ledger");
        }

        write_atomic(&self.path, render_lines(&lines).as_bytes())?;
        Ok(added)
    }

    /// Number of recorded pairs.
    pub fn len(&self) -> Result<usize> {
        Ok(read_lines(&self.path)?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
