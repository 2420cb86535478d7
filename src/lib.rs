//! Per-country traffic attribution for a set of locally running relays.
//!
//! Every poll cycle reads each relay's traffic counters over its control
//! channel, turns them into interval deltas, apportions the deltas to
//! countries and commits the result to a set of flat files.

pub mod agent;
pub mod config;
pub mod control;
pub mod export;
pub mod geo;
pub mod sink;
pub mod traffic;
