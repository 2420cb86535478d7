use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::instances::{reload_config, Instance, Role};
use crate::config::Config;
use crate::control::{ControlClient, ControlError, Credential, CredentialCache, Query, Readings};
use crate::export::health::HealthMetrics;
use crate::geo::{GeoResolver, LookupStats, Reference, UNKNOWN_COUNTRY};
use crate::sink::{
    EntryStatus, Ledger, LedgerTotals, RotationOutcome, SnapshotEntry,
    SnapshotStore, VisitorLedger,
};
use crate::traffic::{by_clients, by_peers, sum_by_country, Attribution, DeltaAccumulator};

pub const SNAPSHOT_FILE_NAME: &str = "traffic_snapshot";
pub const LEDGER_FILE_NAME: &str = "cumulative_traffic";
pub const VISITORS_FILE_NAME: &str = "unique_visitors";
pub const ROTATION_MARKER_FILE_NAME: &str = "rotation_marker";
pub const BASELINE_FILE_NAME: &str = "delta_baseline";

/// Summary of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub configured: usize,
    pub reachable: usize,
    pub snapshot_rows: usize,
    /// Per-country bytes added to the ledger this cycle.
    pub ledger_delta: BTreeMap<String, LedgerTotals>,
    pub snapshot_published: bool,
    pub ledger_updated: bool,
    pub new_visitors: usize,
    pub rotation: Option<RotationOutcome>,
}

/// Successful poll of one instance.
struct Polled {
    instance: Instance,
    credential: Credential,
    readings: Readings,
}

/// Everything the blocking publish step writes.
struct PublishJob {
    snapshot: SnapshotStore,
    ledger: Ledger,
    visitors: VisitorLedger,
    baseline_path: PathBuf,
    entries: Vec<SnapshotEntry>,
    ledger_delta: BTreeMap<String, LedgerTotals>,
    visitor_pairs: Vec<(String, Ipv4Addr)>,
    baseline: Option<DeltaAccumulator>,
    rotate_on: Option<NaiveDate>,
}

#[derive(Debug, Default)]
struct PublishOutcome {
    snapshot_published: bool,
    ledger_updated: bool,
    new_visitors: usize,
    rotation: Option<RotationOutcome>,
    failed_stores: Vec<&'static str>,
}

/// Owns all state carried from one cycle to the next: the last good
/// instance list, credentials, counter baselines, the geo cache and
/// per-instance failure tracking.
pub struct Poller {
    instances_file: PathBuf,
    client: ControlClient,
    credentials: CredentialCache,
    deltas: DeltaAccumulator,
    geo: GeoResolver,
    snapshot: SnapshotStore,
    ledger: Ledger,
    visitors: VisitorLedger,
    baseline_path: PathBuf,
    last_good: Arc<Vec<Instance>>,
    failing: HashMap<u32, &'static str>,
    last_rotation_check: Option<NaiveDate>,
    health: Option<Arc<HealthMetrics>>,
}

impl Poller {
    pub fn new(cfg: &Config, health: Option<Arc<HealthMetrics>>) -> Result<Self> {
        std::fs::create_dir_all(&cfg.state_dir)
            .with_context(|| format!("creating state directory {}", cfg.state_dir.display()))?;

        let state = |name: &str| cfg.state_dir.join(name);

        let baseline_path = state(BASELINE_FILE_NAME);
        let deltas = DeltaAccumulator::load(&baseline_path).unwrap_or_else(|e| {
            warn!(error = %e, "failed to load counter baselines, starting from zero");
            DeltaAccumulator::new()
        });

        let geo = GeoResolver::from_config(cfg).context("loading geo cache")?;

        Ok(Self {
            instances_file: cfg.instances_file.clone(),
            client: ControlClient::new(cfg.query_timeout),
            credentials: CredentialCache::new(cfg.credential_ttl),
            deltas,
            geo,
            snapshot: SnapshotStore::new(state(SNAPSHOT_FILE_NAME)),
            ledger: Ledger::new(
                state(LEDGER_FILE_NAME),
                state(ROTATION_MARKER_FILE_NAME),
                cfg.rotation.retention,
            ),
            visitors: VisitorLedger::new(
                state(VISITORS_FILE_NAME),
                cfg.visitors.max_lines,
                cfg.visitors.trim_to,
            ),
            baseline_path,
            last_good: Arc::new(Vec::new()),
            failing: HashMap::new(),
            last_rotation_check: None,
            health,
        })
    }

    /// Re-read the instance file, keeping the last good list on failure.
    pub fn reload_instances(&mut self) -> Arc<Vec<Instance>> {
        match reload_config(&self.instances_file) {
            Ok(instances) => {
                if instances != *self.last_good {
                    info!(count = instances.len(), "instance configuration loaded");
                }
                self.last_good = Arc::new(instances);
            }
            Err(e) => {
                warn!(
                    error = %format!("{e:#}"),
                    kept = self.last_good.len(),
                    "instance configuration unusable, keeping last good configuration",
                );
                if let Some(h) = &self.health {
                    h.config_reload_errors.inc();
                }
            }
        }
        Arc::clone(&self.last_good)
    }

    /// Run one full cycle: reload, fan out, attribute, publish.
    pub async fn run_cycle(&mut self, today: NaiveDate) -> CycleReport {
        let started = Instant::now();
        let instances = self.reload_instances();
        self.failing
            .retain(|index, _| instances.iter().any(|i| i.index == *index));

        let polled = self.poll_all(&instances).await;

        let mut report = CycleReport {
            configured: instances.len(),
            reachable: polled.len(),
            ..CycleReport::default()
        };

        let (countries, lookups) = self.resolve_peers(&polled).await;

        let mut entries = Vec::new();
        let mut attributions: Vec<Attribution> = Vec::new();
        let mut visitor_pairs = Vec::new();
        let mut baseline_changed = false;

        for p in &polled {
            let Some(traffic) = p.readings.traffic else {
                continue;
            };
            let delta = self.deltas.update(p.instance.index, traffic);
            baseline_changed = true;
            let tag = p.instance.source_tag();

            match p.instance.role {
                Role::ClientCount => {
                    let counts = p.readings.countries.as_deref().unwrap_or_default();
                    attributions.extend(by_clients(delta, counts));
                    entries.extend(counts.iter().filter(|c| c.clients > 0).map(|c| {
                        SnapshotEntry {
                            status: EntryStatus::Seen,
                            country: c.country.clone(),
                            weight: c.clients,
                            source_tag: tag.clone(),
                        }
                    }));
                }
                Role::PeerIp => {
                    let peers: BTreeMap<Ipv4Addr, String> = p
                        .readings
                        .peers
                        .as_deref()
                        .unwrap_or_default()
                        .iter()
                        .map(|ip| {
                            let country = countries
                                .get(ip)
                                .cloned()
                                .unwrap_or_else(|| UNKNOWN_COUNTRY.to_string());
                            (*ip, country)
                        })
                        .collect();

                    attributions.extend(by_peers(delta, &peers));
                    for (ip, country) in &peers {
                        entries.push(SnapshotEntry {
                            status: EntryStatus::Connected,
                            country: country.clone(),
                            weight: 1,
                            source_tag: tag.clone(),
                        });
                        visitor_pairs.push((country.clone(), *ip));
                    }
                }
            }

            debug!(
                instance = p.instance.index,
                role = %p.instance.role,
                read = delta.read,
                written = delta.written,
                "interval delta",
            );
        }

        let ledger_delta = sum_by_country(&attributions);
        report.snapshot_rows = entries.len();

        let rotate_on = (self.last_rotation_check != Some(today)).then_some(today);
        let job = PublishJob {
            snapshot: self.snapshot.clone(),
            ledger: self.ledger.clone(),
            visitors: self.visitors.clone(),
            baseline_path: self.baseline_path.clone(),
            entries,
            ledger_delta: ledger_delta.clone(),
            visitor_pairs,
            baseline: baseline_changed.then(|| self.deltas.clone()),
            rotate_on,
        };

        let outcome = match tokio::task::spawn_blocking(move || publish(job)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "publish task failed");
                PublishOutcome {
                    failed_stores: vec!["publish"],
                    ..PublishOutcome::default()
                }
            }
        };

        // A failed rotation is retried next cycle.
        if rotate_on.is_some() && !outcome.failed_stores.contains(&"rotation") {
            self.last_rotation_check = Some(today);
        }

        report.ledger_delta = ledger_delta;
        report.snapshot_published = outcome.snapshot_published;
        report.ledger_updated = outcome.ledger_updated;
        report.new_visitors = outcome.new_visitors;
        report.rotation = outcome.rotation;

        self.record_metrics(&report, &lookups, &outcome.failed_stores, started);

        debug!(
            configured = report.configured,
            reachable = report.reachable,
            rows = report.snapshot_rows,
            countries = report.ledger_delta.len(),
            new_visitors = report.new_visitors,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "poll cycle complete",
        );

        report
    }

    /// Query every instance concurrently and return the successful polls,
    /// ordered by instance index.
    async fn poll_all(&mut self, instances: &[Instance]) -> Vec<Polled> {
        let mut set = JoinSet::new();

        for instance in instances {
            let credential = match self.credentials.fetch(&instance.data_dir) {
                Ok(c) => c,
                Err(e) => {
                    self.note_failure(instance, &e);
                    continue;
                }
            };

            let queries: &'static [Query] = match instance.role {
                Role::ClientCount => &[Query::Traffic, Query::CountrySummary],
                Role::PeerIp => &[Query::Traffic, Query::Peers],
            };

            let client = self.client.clone();
            let instance = instance.clone();
            set.spawn(async move {
                let result = client.poll(&instance.endpoint, &credential, queries).await;
                (instance, credential, result)
            });
        }

        let mut polled = Vec::with_capacity(set.len());
        while let Some(joined) = set.join_next().await {
            let (instance, credential, result) = match joined {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "instance poll task failed");
                    continue;
                }
            };

            match result {
                Ok(readings) => {
                    self.note_success(&instance);
                    polled.push(Polled {
                        instance,
                        credential,
                        readings,
                    });
                }
                Err(e) => {
                    if e.invalidates_credential() {
                        self.credentials.invalidate(&instance.data_dir);
                    }
                    self.note_failure(&instance, &e);
                }
            }
        }

        polled.sort_by_key(|p| p.instance.index);
        polled
    }

    /// Resolve the union of every peer-reporting instance's peers, using
    /// the first reachable instance's address table as the reference.
    async fn resolve_peers(
        &mut self,
        polled: &[Polled],
    ) -> (BTreeMap<Ipv4Addr, String>, LookupStats) {
        let peers: BTreeSet<Ipv4Addr> = polled
            .iter()
            .filter(|p| p.instance.role == Role::PeerIp)
            .filter_map(|p| p.readings.peers.as_ref())
            .flatten()
            .copied()
            .collect();

        if peers.is_empty() {
            return (BTreeMap::new(), LookupStats::default());
        }

        let peers: Vec<Ipv4Addr> = peers.into_iter().collect();
        let reference = polled.first().map(|p| Reference {
            client: &self.client,
            endpoint: &p.instance.endpoint,
            credential: &p.credential,
        });

        self.geo.resolve_many(&peers, reference).await
    }

    fn note_failure(&mut self, instance: &Instance, err: &ControlError) {
        let kind = err.kind();
        let previous = self.failing.insert(instance.index, kind);

        if previous == Some(kind) {
            debug!(
                instance = instance.index,
                endpoint = %instance.endpoint,
                error = %err,
                "instance still failing",
            );
        } else {
            warn!(
                instance = instance.index,
                endpoint = %instance.endpoint,
                error_type = kind,
                error = %err,
                "instance poll failed, contributing nothing this cycle",
            );
        }

        if let Some(h) = &self.health {
            let index = instance.index.to_string();
            h.poll_errors
                .with_label_values(&[index.as_str(), kind])
                .inc();
        }
    }

    fn note_success(&mut self, instance: &Instance) {
        if let Some(kind) = self.failing.remove(&instance.index) {
            info!(
                instance = instance.index,
                endpoint = %instance.endpoint,
                after = kind,
                "instance recovered",
            );
        }
    }

    fn record_metrics(
        &self,
        report: &CycleReport,
        lookups: &LookupStats,
        failed_stores: &[&'static str],
        started: Instant,
    ) {
        for store in failed_stores {
            warn!(store = *store, "persistence failed this cycle");
        }

        let Some(h) = &self.health else {
            return;
        };

        h.cycles.inc();
        h.cycle_duration.observe(started.elapsed().as_secs_f64());
        h.instances_configured.set(report.configured as f64);
        h.instances_reachable.set(report.reachable as f64);

        let (download, upload) = report
            .ledger_delta
            .values()
            .fold((0u64, 0u64), |(d, u), t| {
                (d.saturating_add(t.download), u.saturating_add(t.upload))
            });
        h.attributed_bytes
            .with_label_values(&["download"])
            .inc_by(download as f64);
        h.attributed_bytes
            .with_label_values(&["upload"])
            .inc_by(upload as f64);

        for (source, n) in [
            ("cache", lookups.cache_hits),
            ("control", lookups.control),
            ("tool", lookups.tools),
            ("unknown", lookups.unknown),
        ] {
            if n > 0 {
                h.geo_lookups.with_label_values(&[source]).inc_by(n as f64);
            }
        }
        h.geo_cache_entries.set(self.geo.cache().len() as f64);

        for store in failed_stores {
            h.persist_errors.with_label_values(&[*store]).inc();
        }

        if report.snapshot_published {
            h.last_publish_timestamp
                .set(chrono::Utc::now().timestamp() as f64);
        }
    }
}

/// Commit one cycle to disk. Each store fails independently.
fn publish(job: PublishJob) -> PublishOutcome {
    let mut out = PublishOutcome::default();

    if let Some(today) = job.rotate_on {
        match job.ledger.rotate(today) {
            Ok(outcome) => {
                if let RotationOutcome::Rotated { archived, pruned } = &outcome {
                    info!(archived = %archived, pruned, "ledger rotated");
                }
                out.rotation = Some(outcome);
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "ledger rotation failed");
                out.failed_stores.push("rotation");
            }
        }
    }

    match job.snapshot.publish(&job.entries) {
        Ok(published) => out.snapshot_published = published,
        Err(e) => {
            warn!(error = %format!("{e:#}"), "snapshot publish failed, previous snapshot kept");
            out.failed_stores.push("snapshot");
        }
    }

    match job.ledger.merge(&job.ledger_delta) {
        Ok(updated) => out.ledger_updated = updated,
        Err(e) => {
            warn!(error = %format!("{e:#}"), "ledger merge failed");
            out.failed_stores.push("ledger");
        }
    }

    match job.visitors.record_all(&job.visitor_pairs) {
        Ok(added) => out.new_visitors = added,
        Err(e) => {
            warn!(error = %format!("{e:#}"), "unique-visitor ledger update failed");
            out.failed_stores.push("visitors");
        }
    }

    if let Some(deltas) = job.baseline {
        if let Err(e) = deltas.save(&job.baseline_path) {
            warn!(error = %format!("{e:#}"), "saving counter baselines failed");
            out.failed_stores.push("baseline");
        }
    }

    out
}
