//! Apportioning an instance's interval delta across countries.
//!
//! Both strategies use integer division per country. The truncated
//! remainder is dropped, so the attributed sum is never larger than the
//! instance's delta and falls short by less than one byte per country.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use super::delta::Delta;
use crate::control::CountryCount;
use crate::sink::LedgerTotals;

/// Bytes attributed to one country for one instance and cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribution {
    pub country: String,
    pub read: u64,
    pub written: u64,
}

/// `total * part / whole` without intermediate overflow; `whole` of zero is
/// treated as one.
fn share(total: u64, part: u64, whole: u64) -> u64 {
    let whole = u128::from(whole.max(1));
    let value = u128::from(total) * u128::from(part) / whole;
    u64::try_from(value).unwrap_or(u64::MAX)
}

/// Client-weighted attribution from an instance's country summary.
pub fn by_clients(delta: Delta, counts: &[CountryCount]) -> Vec<Attribution> {
    let total: u64 = counts.iter().map(|c| c.clients).fold(0, u64::saturating_add);

    counts
        .iter()
        .filter(|c| c.clients > 0)
        .map(|c| Attribution {
            country: c.country.clone(),
            read: share(delta.read, c.clients, total),
            written: share(delta.written, c.clients, total),
        })
        .collect()
}

/// Peer-weighted attribution: every distinct peer weighs `1/N`, and a
/// country holding `k` of the `N` peers receives `delta * k / N`.
///
/// `peers` maps each distinct peer address to its resolved country.
pub fn by_peers(delta: Delta, peers: &BTreeMap<Ipv4Addr, String>) -> Vec<Attribution> {
    let n = u64::try_from(peers.len()).unwrap_or(u64::MAX);

    let mut per_country: BTreeMap<&str, u64> = BTreeMap::new();
    for country in peers.values() {
        *per_country.entry(country.as_str()).or_insert(0) += 1;
    }

    per_country
        .into_iter()
        .map(|(country, k)| Attribution {
            country: country.to_string(),
            read: share(delta.read, k, n),
            written: share(delta.written, k, n),
        })
        .collect()
}

/// Sum attributions from several instances into per-country ledger deltas,
/// with read bytes counted as download and written bytes as upload.
pub fn sum_by_country<'a>(
    parts: impl IntoIterator<Item = &'a Attribution>,
) -> BTreeMap<String, LedgerTotals> {
    let mut out: BTreeMap<String, LedgerTotals> = BTreeMap::new();
    for part in parts {
        let slot = out.entry(part.country.clone()).or_default();
        slot.download = slot.download.saturating_add(part.read);
        slot.upload = slot.upload.saturating_add(part.written);
    }
    out
}
