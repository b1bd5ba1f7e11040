//! MetricsCollector (spec.md §4.2): on a fixed cadence, visits every
//! configured host, normalizes state and load, and writes it to the state
//! DB and (when enabled) the time-series DB.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::configuration::Settings;
use crate::healthcheck::HealthState;
use crate::hypervisor::{self, managed::ManagedConnection};
use crate::model::host::{Host, HostCredentials, ResourceCapacity};
use crate::storage::state::{HostRecord, SharedStateStore, StateStore, VmRecord};
use crate::storage::timeseries::{Point, SharedTimeSeriesStore, TimeSeriesStore};

fn host_from_config(config: &crate::configuration::HostConfig) -> Host {
    let resources = config.resources.as_ref();
    Host {
        name: config.name.clone(),
        address: config.address.clone(),
        transport: config.protocol,
        port: config.port,
        hypervisor: config.hypervisor,
        credentials: HostCredentials {
            user: config.user.clone(),
            password: None,
            ssh_key: config.ssh_key.clone(),
        },
        capacity: ResourceCapacity {
            cpu_cores: resources.and_then(|r| r.cpu_cores).unwrap_or(0),
            memory_bytes: resources.and_then(|r| r.memory_bytes).unwrap_or(0),
            storage_bytes: resources.and_then(|r| r.storage_bytes).unwrap_or(0),
        },
        connection_timeout_secs: config.timeout.unwrap_or(5),
    }
}

fn host_record(host: &Host) -> HostRecord {
    HostRecord {
        name: host.name.clone(),
        address: host.address.clone(),
        transport: host.transport.to_string(),
        port: host.port,
        hypervisor: host.hypervisor.to_string(),
        cpu_cores: host.capacity.cpu_cores,
        memory_bytes: host.capacity.memory_bytes,
        storage_bytes: host.capacity.storage_bytes,
    }
}

fn record_changed(existing: &HostRecord, fresh: &HostRecord) -> bool {
    existing.transport != fresh.transport
        || existing.port != fresh.port
        || existing.hypervisor != fresh.hypervisor
        || existing.cpu_cores != fresh.cpu_cores
        || existing.memory_bytes != fresh.memory_bytes
        || existing.storage_bytes != fresh.storage_bytes
}

pub struct MetricsCollector {
    hosts: Vec<Host>,
    state: SharedStateStore,
    timeseries: Option<SharedTimeSeriesStore>,
    page_size: usize,
    max_connection_threads: usize,
    collection_interval: Duration,
    health: Arc<HealthState>,
}

impl MetricsCollector {
    /// `state`/`timeseries` are shared with the Reconciler (and `state`
    /// with the Dispatcher) so every subsystem reads and writes the same
    /// backing store rather than each opening its own private one.
    pub fn new(
        settings: &Settings,
        health: Arc<HealthState>,
        state: SharedStateStore,
        timeseries: SharedTimeSeriesStore,
    ) -> Self {
        let hosts = settings.controller.autoscale.hosts.iter().map(host_from_config).collect();
        let db = &settings.controller.databases;

        MetricsCollector {
            hosts,
            state,
            timeseries: Some(timeseries),
            page_size: settings.collection_page_size(),
            max_connection_threads: db.max_host_connection_threads,
            collection_interval: Duration::from_secs(db.collection_interval),
            health,
        }
    }

    /// Idempotent schema bootstrap plus seeding declared-but-unseen hosts
    /// (spec.md §4.2 "Initialization").
    pub async fn initialize(&mut self) -> Result<(), crate::errors::FatalError> {
        {
            let mut state = self.state.lock().await;
            state.open().await.map_err(|e| crate::errors::FatalError::ChildFailed {
                subsystem: "collector",
                source: e.into(),
            })?;
            state.initialize().await.map_err(|e| crate::errors::FatalError::ChildFailed {
                subsystem: "collector",
                source: e.into(),
            })?;
        }
        if let Some(ts) = self.timeseries.as_ref() {
            ts.lock().await.open().await.map_err(|e| crate::errors::FatalError::ChildFailed {
                subsystem: "collector",
                source: e.into(),
            })?;
        }

        for host in &self.hosts {
            let mut state = self.state.lock().await;
            let exists = state
                .host_exists(&host.name, &host.address)
                .await
                .map_err(|e| crate::errors::FatalError::ChildFailed { subsystem: "collector", source: e.into() })?;
            if !exists {
                state
                    .host_create(&host_record(host))
                    .await
                    .map_err(|e| crate::errors::FatalError::ChildFailed { subsystem: "collector", source: e.into() })?;
            }
        }
        Ok(())
    }

    /// Run collection cycles forever. Each cycle paces itself against
    /// `collectionInterval` and never sleeps a negative duration.
    pub async fn run(&mut self) -> Result<(), crate::errors::FatalError> {
        self.initialize().await?;

        loop {
            let started = Instant::now();
            self.run_one_cycle().await;
            self.health.mark_ready();

            let elapsed = started.elapsed();
            if elapsed >= self.collection_interval {
                warn!(?elapsed, interval = ?self.collection_interval, "collection cycle overran its interval");
                continue;
            }
            sleep(self.collection_interval - elapsed).await;
        }
    }

    async fn run_one_cycle(&mut self) {
        let pages: Vec<Vec<Host>> = self
            .hosts
            .chunks(self.page_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect();

        for page in pages {
            let max_threads = self.max_connection_threads.max(1);
            let results: Vec<(Host, Option<hypervisor::HostStats>, Vec<crate::model::domain::DomainStats>)> =
                stream::iter(page.into_iter())
                    .map(|host| async move {
                        let (host_stats, vm_stats) = collect_one_host(&host).await;
                        (host, host_stats, vm_stats)
                    })
                    .buffer_unordered(max_threads)
                    .collect()
                    .await;

            for (host, host_stats, vm_stats) in results {
                if host_stats.is_none() {
                    continue;
                }
                if let Err(e) = self.reconcile_host_record(&host).await {
                    warn!(host = %host.name, error = %e, "failed to update host record");
                    continue;
                }
                if let Err(e) = self.write_vm_stats(&host, vm_stats).await {
                    warn!(host = %host.name, error = %e, "failed to write vm stats");
                }
            }
        }
    }

    async fn reconcile_host_record(&mut self, host: &Host) -> Result<(), crate::storage::state::StateError> {
        let fresh = host_record(host);
        let mut state = self.state.lock().await;
        match state.get_host(&host.name, &host.address).await? {
            None => state.host_create(&fresh).await,
            Some(existing) if record_changed(&existing, &fresh) => state.host_update(&fresh).await,
            Some(_) => Ok(()),
        }
    }

    async fn write_vm_stats(
        &mut self,
        host: &Host,
        vm_stats: Vec<crate::model::domain::DomainStats>,
    ) -> Result<(), crate::storage::state::StateError> {
        if vm_stats.is_empty() {
            return Ok(());
        }

        {
            let mut state = self.state.lock().await;
            let existing_vms = state.vm_report(Some(&host.name)).await?;
            let asg_by_name: HashMap<String, Option<String>> =
                existing_vms.into_iter().map(|v| (v.name, v.asg)).collect();

            for stats in &vm_stats {
                let asg = asg_by_name.get(&stats.name).cloned().flatten();
                let row = hypervisor::stats_to_state_db(stats, asg);
                state
                    .vm_create(&VmRecord { host: row.host, name: row.vm, state: row.state, asg: row.asg })
                    .await?;
            }
        }

        if let Some(ts) = self.timeseries.as_ref() {
            let mut points = Vec::new();
            for stats in &vm_stats {
                for row in hypervisor::stats_to_metrics_db(stats) {
                    points.push(Point::from_metrics_row(&row, stats.collected_at));
                }
            }
            if !points.is_empty() {
                let _ = ts.lock().await.insert_batch(points).await.map_err(|e| {
                    warn!(host = %host.name, error = %e, "failed to write time-series batch");
                });
            }
        }

        Ok(())
    }
}

/// One host's collection job: open a readonly connection, collect both
/// stats calls, close. Connection failures are logged and treated as "no
/// data this cycle" rather than propagated (spec.md §4.2 per-host job).
async fn collect_one_host(host: &Host) -> (Option<hypervisor::HostStats>, Vec<crate::model::domain::DomainStats>) {
    let connection = hypervisor::connect_for_host(host);
    let mut managed = ManagedConnection::new(connection, 3);

    if let Err(e) = managed.open(true).await {
        warn!(host = %host.name, error = %e, "failed to open hypervisor connection, skipping this cycle");
        return (None, Vec::new());
    }

    let host_stats = match managed.get_host_stats().await {
        Ok(stats) => Some(stats),
        Err(e) => {
            warn!(host = %host.name, error = %e, "failed to collect host stats");
            None
        }
    };

    let vm_stats = match managed.get_host_vm_stats().await {
        Ok(stats) => stats,
        Err(e) => {
            warn!(host = %host.name, error = %e, "failed to collect vm stats");
            Vec::new()
        }
    };

    managed.close().await;
    info!(host = %host.name, vms = vm_stats.len(), "collected host");
    (host_stats, vm_stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_changed_detects_capacity_drift() {
        let base = HostRecord {
            name: "h1".into(),
            address: "10.0.0.2".into(),
            transport: "ssh".into(),
            port: 22,
            hypervisor: "kvm".into(),
            cpu_cores: 8,
            memory_bytes: 1024,
            storage_bytes: 2048,
        };
        let mut changed = base.clone();
        changed.cpu_cores = 16;
        assert!(record_changed(&base, &changed));
        assert!(!record_changed(&base, &base));
    }
}
