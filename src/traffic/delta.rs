use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use tracing::{debug, warn};

use crate::control::TrafficTotals;
use crate::sink::{read_lines, render_lines, write_atomic, FIELD_SEPARATOR};

/// Bytes transferred by one instance during one interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delta {
    pub read: u64,
    pub written: u64,
}

/// Turns consecutive monotonic counter readings into interval deltas.
///
/// The previous reading per instance is owned exclusively here. It can be
/// saved to and restored from a baseline file so a restart of this process
/// does not count a relay's lifetime totals a second time.
#[derive(Debug, Clone, Default)]
pub struct DeltaAccumulator {
    previous: BTreeMap<u32, TrafficTotals>,
}

impl DeltaAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new reading for `instance` and return the delta since the
    /// previous one.
    pub fn update(&mut self, instance: u32, current: TrafficTotals) -> Delta {
        let prev = self.previous.insert(instance, current).unwrap_or_default();

        let delta = Delta {
            read: counter_delta(prev.read, current.read),
            written: counter_delta(prev.written, current.written),
        };

        if current.read < prev.read || current.written < prev.written {
            debug!(
                instance,
                prev_read = prev.read,
                prev_written = prev.written,
                read = current.read,
                written = current.written,
                "counter reset detected",
            );
        }

        delta
    }

    /// Last reading stored for `instance`.
    pub fn baseline(&self, instance: u32) -> Option<TrafficTotals> {
        self.previous.get(&instance).copied()
    }

    /// Restore baselines from `index|read|write` lines. A missing file
    /// yields an empty accumulator.
    pub fn load(path: &Path) -> Result<Self> {
        let mut previous = BTreeMap::new();
        for line in read_lines(path)? {
            match parse_baseline(&line) {
                Some((index, totals)) => {
                    previous.insert(index, totals);
                }
                None => warn!(line = %line, "skipping malformed baseline line"),
            }
        }
        Ok(Self { previous })
    }

    fn render(&self) -> String {
        render_lines(self.previous.iter().map(|(index, t)| {
            format!(
                "{index}{sep}{read}{sep}{written}",
                read = t.read,
                written = t.written,
                sep = FIELD_SEPARATOR,
            )
        }))
    }

    /// Atomically write the baselines as `index|read|written` lines.
    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, self.render().as_bytes())
    }
}

/// Non-negative delta between two readings of a monotonic counter. A
/// smaller reading means the counter restarted from zero, so the new value
/// itself is the traffic since the restart.
pub fn counter_delta(previous: u64, current: u64) -> u64 {
    if current < previous {
        current
    } else {
        current - previous
    }
}

fn parse_baseline(line: &str) -> Option<(u32, TrafficTotals)> {
    let mut fields = line.split(FIELD_SEPARATOR);
    let index = fields.next()?.trim().parse().ok()?;
    let read = fields.next()?.trim().parse().ok()?;
    let written = fields.next()?.trim().parse().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some((index, TrafficTotals { read, written }))
}
