pub mod instances;
pub mod scheduler;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::export::health::HealthMetrics;

pub use instances::{Instance, Role};
pub use scheduler::{CycleReport, Poller};

/// Agent owns the health server and the poll loop.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
    poll_task: Option<JoinHandle<()>>,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            cancel: CancellationToken::new(),
            poll_task: None,
        })
    }

    /// Start the health server and the poll loop.
    pub async fn start(&mut self) -> Result<()> {
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        let poller = Poller::new(&self.cfg, Some(Arc::clone(&self.health)))
            .context("initializing poller")?;

        self.spawn_poll_loop(poller);

        info!(
            instances_file = %self.cfg.instances_file.display(),
            state_dir = %self.cfg.state_dir.display(),
            poll_interval = ?self.cfg.poll_interval,
            "agent started",
        );

        Ok(())
    }

    /// Signal the poll loop to stop and wait for the in-flight cycle.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(task) = self.poll_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "poll loop ended abnormally");
            }
        }

        self.health.stop().await?;

        Ok(())
    }

    /// Spawn the ticker loop. The first tick fires immediately; a cycle
    /// that overruns the interval skips the missed ticks.
    fn spawn_poll_loop(&mut self, mut poller: Poller) {
        let cancel = self.cancel.clone();
        let poll_interval = self.cfg.poll_interval;

        self.poll_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let today = chrono::Local::now().date_naive();
                        poller.run_cycle(today).await;
                    }
                }
            }
        }));
    }
}
