//! Fleet watch mode
//!
//! Polls the serial connector for newly attached devices and provisions each
//! one as it appears. A device is provisioned once per attachment; unplugging
//! and re-plugging it starts a new run.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use prov_core::SerialConnector;
use tracing::{debug, error, info, warn};

use crate::pipeline::{PipelineError, ProvisionReport, Provisioner, Stage};

/// Watch loop timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    /// Pause between port scans
    pub poll_interval: Duration,
    /// Pause between seeing a new port and opening it
    pub settle_delay: Duration,
    /// Treat ports attached at startup as already handled
    pub ignore_existing: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            settle_delay: Duration::from_secs(2),
            ignore_existing: true,
        }
    }
}

/// Counts of a watch session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchSummary {
    pub provisioned: usize,
    pub failed: usize,
    /// Stopped because sequenced settings could not be stored
    pub halted: bool,
}

pub struct FleetWatcher {
    provisioner: Provisioner,
    connector: Arc<dyn SerialConnector>,
    config: WatchConfig,
    known: BTreeSet<String>,
    next_index: Option<u32>,
    summary: WatchSummary,
}

impl FleetWatcher {
    pub fn new(provisioner: Provisioner, connector: Arc<dyn SerialConnector>, config: WatchConfig) -> Self {
        let sequencer = &provisioner.config().sequencer;
        let next_index = if sequencer.enabled {
            sequencer.start_index
        } else {
            None
        };
        Self {
            provisioner,
            connector,
            config,
            known: BTreeSet::new(),
            next_index,
            summary: WatchSummary::default(),
        }
    }

    /// Index the next device gets, if devices are numbered explicitly
    pub fn next_index(&self) -> Option<u32> {
        self.next_index
    }

    pub fn summary(&self) -> &WatchSummary {
        &self.summary
    }

    /// Record the currently attached ports without provisioning them
    pub async fn prime(&mut self) {
        match self.connector.list_ports().await {
            Ok(ports) => {
                debug!(count = ports.len(), "Ignoring already attached ports");
                self.known = ports.into_iter().collect();
            }
            Err(e) => warn!(%e, "Listing serial ports failed"),
        }
    }

    /// Scan once and provision every newly attached device
    pub async fn poll_once(&mut self) -> Vec<Result<ProvisionReport, PipelineError>> {
        let ports: BTreeSet<String> = match self.connector.list_ports().await {
            Ok(ports) => ports.into_iter().collect(),
            Err(e) => {
                warn!(%e, "Listing serial ports failed");
                return Vec::new();
            }
        };

        // Forget detached ports so a re-plugged device runs again
        self.known.retain(|port| ports.contains(port));

        let fresh: Vec<String> = ports.difference(&self.known).cloned().collect();
        let mut results = Vec::with_capacity(fresh.len());
        for port in fresh {
            if self.summary.halted {
                break;
            }
            info!(%port, "New device attached");
            if !self.config.settle_delay.is_zero() {
                tokio::time::sleep(self.config.settle_delay).await;
            }
            self.known.insert(port.clone());

            let result = self.provisioner.provision(&port, self.next_index).await;
            match &result {
                Ok(report) => {
                    self.summary.provisioned += 1;
                    if let Some(index) = self.next_index.as_mut() {
                        *index += 1;
                    }
                    info!(
                        %port,
                        identity = %report.identity,
                        ip = report.ip_sta.as_deref().unwrap_or("DHCP"),
                        "Device ready"
                    );
                }
                Err(e) => {
                    self.summary.failed += 1;
                    error!(
                        %port,
                        stage = %e.stage,
                        category = e.source.category(),
                        error = %e,
                        "Provisioning failed"
                    );
                    if e.stage == Stage::Persist {
                        self.summary.halted = true;
                        error!("Stopping, the next device would repeat these settings");
                    }
                }
            }
            results.push(result);
        }
        results
    }

    /// Watch until `shutdown` completes
    pub async fn run<F>(&mut self, shutdown: F) -> WatchSummary
    where
        F: Future<Output = ()>,
    {
        if self.config.ignore_existing {
            self.prime().await;
        }
        info!(interval = ?self.config.poll_interval, "Watching for devices");

        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    self.poll_once().await;
                    if self.summary.halted {
                        break;
                    }
                }
            }
        }

        info!(
            provisioned = self.summary.provisioned,
            failed = self.summary.failed,
            "Watch stopped"
        );
        self.summary.clone()
    }
}
