//! IPv4 address to country resolution.
//!
//! Lookups go through a persistent cache first, then the reference
//! instance's own address table, then local database tools, and finally
//! settle on [`UNKNOWN_COUNTRY`]. Every answer is cached, the unknown marker
//! included, so an address costs at most one full resolution.

pub mod cache;
pub mod tools;

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::Config;
use crate::control::{parse_dotted_quad, ControlClient, Credential, Endpoint};

pub use cache::GeoCache;
pub use tools::GeoTool;

/// Country recorded when no source could answer.
pub const UNKNOWN_COUNTRY: &str = "Unknown";

/// File name of the geo cache inside the state directory.
pub const CACHE_FILE_NAME: &str = "geo_cache";

/// Canonical spelling of a country key. Two- and three-character codes are
/// upper-cased, so a relay's `de` and a database tool's `DE` land in the
/// same row; longer names such as [`UNKNOWN_COUNTRY`] pass through.
pub fn country_key(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.len() <= 3 && trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
        trimmed.to_ascii_uppercase()
    } else {
        trimmed.to_string()
    }
}

/// Maximum number of tool processes running at once.
const TOOL_CONCURRENCY: usize = 8;

/// An instance whose address table may be consulted, with what is needed
/// to reach it.
#[derive(Debug, Clone, Copy)]
pub struct Reference<'a> {
    pub client: &'a ControlClient,
    pub endpoint: &'a Endpoint,
    pub credential: &'a Credential,
}

/// Where the answers of one `resolve_many` call came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupStats {
    pub cache_hits: usize,
    pub control: usize,
    pub tools: usize,
    pub unknown: usize,
}

/// Tiered resolver owning the geo cache.
#[derive(Debug)]
pub struct GeoResolver {
    cache: GeoCache,
    tools: Vec<GeoTool>,
    tool_timeout: Duration,
}

impl GeoResolver {
    pub fn new(cache: GeoCache, tools: Vec<GeoTool>, tool_timeout: Duration) -> Self {
        Self {
            cache,
            tools,
            tool_timeout,
        }
    }

    /// Load the cache from the state directory and probe the configured
    /// tools.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let cache = GeoCache::load(
            cfg.state_dir.join(CACHE_FILE_NAME),
            cfg.geo.cache_max_entries,
            cfg.geo.cache_trim_to,
        )?;
        let tools = GeoTool::from_config(&cfg.geo);
        debug!(
            cached = cache.len(),
            tools = ?tools.iter().map(GeoTool::name).collect::<Vec<_>>(),
            "geo resolver ready",
        );
        Ok(Self::new(cache, tools, cfg.query_timeout))
    }

    pub fn cache(&self) -> &GeoCache {
        &self.cache
    }

    /// Resolve a single textual address. Anything that is not a plain
    /// dotted quad is unresolvable and yields `None`.
    pub async fn resolve(&mut self, ip: &str, reference: Option<Reference<'_>>) -> Option<String> {
        let addr = parse_dotted_quad(ip.trim())?;
        let (mut resolved, _) = self.resolve_many(&[addr], reference).await;
        resolved.remove(&addr)
    }

    /// Resolve a cycle's worth of addresses: one batched control query
    /// for every cache miss, tools for what is still missing, then a single
    /// cache persist.
    pub async fn resolve_many(
        &mut self,
        ips: &[Ipv4Addr],
        reference: Option<Reference<'_>>,
    ) -> (BTreeMap<Ipv4Addr, String>, LookupStats) {
        let mut stats = LookupStats::default();
        let mut out = BTreeMap::new();
        let mut misses = Vec::new();

        for ip in ips {
            if out.contains_key(ip) || misses.contains(ip) {
                continue;
            }
            match self.cache.get(ip) {
                Some(name) => {
                    stats.cache_hits += 1;
                    out.insert(*ip, name.to_string());
                }
                None => misses.push(*ip),
            }
        }

        if !misses.is_empty() {
            if let Some(r) = reference {
                match r
                    .client
                    .lookup_countries(r.endpoint, r.credential, &misses)
                    .await
                {
                    Ok(found) => {
                        misses.retain(|ip| match found.get(ip) {
                            Some(name) => {
                                stats.control += 1;
                                self.cache.insert(*ip, name);
                                out.insert(*ip, cache::sanitize_name(name));
                                false
                            }
                            None => true,
                        });
                    }
                    Err(e) => {
                        debug!(
                            endpoint = %r.endpoint,
                            error = %e,
                            "control address lookup failed, falling back to local tools",
                        );
                    }
                }
            }
        }

        if !misses.is_empty() {
            for (ip, answer) in self.run_tools(&misses).await {
                let name = match answer {
                    Some(name) => {
                        stats.tools += 1;
                        name
                    }
                    None => {
                        stats.unknown += 1;
                        UNKNOWN_COUNTRY.to_string()
                    }
                };
                self.cache.insert(ip, &name);
                out.insert(ip, cache::sanitize_name(&name));
            }
        }

        if let Err(e) = self.cache.persist() {
            warn!(
                path = %self.cache.path().display(),
                error = %e,
                "failed to persist geo cache",
            );
        }

        (out, stats)
    }

    /// Try every tool in order for each address, a bounded number of
    /// addresses at a time.
    async fn run_tools(&self, ips: &[Ipv4Addr]) -> Vec<(Ipv4Addr, Option<String>)> {
        if self.tools.is_empty() {
            return ips.iter().map(|ip| (*ip, None)).collect();
        }

        let permits = Arc::new(Semaphore::new(TOOL_CONCURRENCY));
        let mut set = JoinSet::new();
        for ip in ips.iter().copied() {
            let tools = self.tools.clone();
            let permits = Arc::clone(&permits);
            let timeout = self.tool_timeout;
            set.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                for tool in &tools {
                    if let Some(name) = tool.lookup(ip, timeout).await {
                        return (ip, Some(name));
                    }
                }
                (ip, None)
            });
        }

        let mut results = Vec::with_capacity(ips.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "geo tool task failed"),
            }
        }

        // Tasks that failed to join still get an answer.
        for ip in ips {
            if !results.iter().any(|(r, _)| r == ip) {
                results.push((*ip, None));
            }
        }
        results
    }
}
