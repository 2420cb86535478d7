//! Interval deltas and their attribution to countries.

pub mod attribute;
pub mod delta;

pub use attribute::{by_clients, by_peers, sum_by_country, Attribution};
pub use delta::{counter_delta, Delta, DeltaAccumulator};
