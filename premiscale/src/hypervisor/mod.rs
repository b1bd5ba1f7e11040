//! Hypervisor connection contract (spec.md §4.1): abstracts QEMU/KVM, ESX,
//! and Xen behind one read/write interface. One connection instance exists
//! per host per concurrent user (the MetricsCollector's worker pool holds
//! one each).

pub mod managed;
pub mod ssh_driver;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::model::domain::DomainStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Opening,
    Open,
    Degraded,
    Closed,
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum ConnectError {
    #[error("transport error connecting to {0}: {1}")]
    Transport(String, String),
    #[error("authentication failed for {0}")]
    Authentication(String),
    #[error("hypervisor protocol error: {0}")]
    Protocol(String),
    #[error("unsupported hypervisor kind: {0}")]
    UnsupportedKind(String),
    /// Returned by the retry wrapper after exhausting its attempts. Never
    /// propagated as a panic/unwind into the scheduler (spec.md §4.1).
    #[error("host unavailable after retries: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub struct DomainSnapshot {
    pub name: String,
    pub state: crate::model::domain::PowerState,
}

/// Point-in-time host-level snapshot (spec.md §4.1 `getHostStats`).
#[derive(Debug, Clone)]
pub struct HostStats {
    pub hostname: String,
    pub hypervisor_kind: String,
    pub hypervisor_version: String,
    pub uri: String,
    pub capabilities: String,
    pub max_vcpus: u32,
    pub free_memory_bytes: u64,
    pub node_memory_stats: HashMap<String, u64>,
    pub node_cpu_stats: HashMap<String, u64>,
    pub domains: Vec<DomainSnapshot>,
}

/// A row the `StateStore` adapter accepts, produced by
/// `statsToStateDB` (spec.md §4.1).
#[derive(Debug, Clone)]
pub struct StateRow {
    pub host: String,
    pub vm: String,
    pub state: crate::model::domain::PowerState,
    pub asg: Option<String>,
}

/// A row the `TimeSeriesStore` adapter accepts, produced by
/// `statsToMetricsDB` (spec.md §4.1).
#[derive(Debug, Clone)]
pub struct MetricsRow {
    pub measurement: crate::storage::timeseries::Measurement,
    pub host: String,
    pub vm: String,
    pub state: crate::model::domain::PowerState,
    pub fields: HashMap<String, f64>,
}

/// One connection to one hypervisor host. Implementors hide whether the
/// transport is SSH or TLS and which hypervisor dialect (KVM/ESX/Xen) is on
/// the other end.
#[async_trait]
pub trait HypervisorConnection: Send + Sync {
    fn state(&self) -> ConnectionState;

    /// Establish the connection. `readonly` mirrors the read-only
    /// connections the MetricsCollector opens; write operations (used by
    /// the Dispatcher) open non-readonly.
    async fn open(&mut self, readonly: bool) -> Result<(), ConnectError>;

    /// Safe to call on a never-opened or already-closed instance.
    async fn close(&mut self);

    async fn get_host_stats(&mut self) -> Result<HostStats, ConnectError>;

    async fn get_host_vm_stats(&mut self) -> Result<Vec<DomainStats>, ConnectError>;

    async fn create_domain(&mut self, spec: &DomainCreateSpec) -> Result<(), ConnectError>;
    async fn clone_domain(&mut self, source: &str, dest: &str) -> Result<(), ConnectError>;
    async fn migrate_domain(&mut self, vm: &str, dest_uri: &str) -> Result<(), ConnectError>;
    async fn delete_domain(&mut self, vm: &str, reclaim_storage: bool) -> Result<(), ConnectError>;
}

#[async_trait]
impl HypervisorConnection for Box<dyn HypervisorConnection> {
    fn state(&self) -> ConnectionState {
        (**self).state()
    }
    async fn open(&mut self, readonly: bool) -> Result<(), ConnectError> {
        (**self).open(readonly).await
    }
    async fn close(&mut self) {
        (**self).close().await
    }
    async fn get_host_stats(&mut self) -> Result<HostStats, ConnectError> {
        (**self).get_host_stats().await
    }
    async fn get_host_vm_stats(&mut self) -> Result<Vec<DomainStats>, ConnectError> {
        (**self).get_host_vm_stats().await
    }
    async fn create_domain(&mut self, spec: &DomainCreateSpec) -> Result<(), ConnectError> {
        (**self).create_domain(spec).await
    }
    async fn clone_domain(&mut self, source: &str, dest: &str) -> Result<(), ConnectError> {
        (**self).clone_domain(source, dest).await
    }
    async fn migrate_domain(&mut self, vm: &str, dest_uri: &str) -> Result<(), ConnectError> {
        (**self).migrate_domain(vm, dest_uri).await
    }
    async fn delete_domain(&mut self, vm: &str, reclaim_storage: bool) -> Result<(), ConnectError> {
        (**self).delete_domain(vm, reclaim_storage).await
    }
}

#[derive(Debug, Clone)]
pub struct DomainCreateSpec {
    pub name: String,
    pub vcpus: u32,
    pub memory_bytes: u64,
    pub image: String,
    pub cloud_init: Option<String>,
    pub network_bridge: String,
}

/// Convert a sample into the row the state DB expects.
pub fn stats_to_state_db(stats: &DomainStats, asg: Option<String>) -> StateRow {
    StateRow { host: stats.host.clone(), vm: stats.name.clone(), state: stats.state, asg }
}

/// Convert a sample into the rows the time-series DB expects, one per
/// measurement kind (`cpu|memory|net|block`, spec.md §4.2 step 3).
pub fn stats_to_metrics_db(stats: &DomainStats) -> Vec<MetricsRow> {
    let mut rows = Vec::new();

    let mut cpu_fields = HashMap::new();
    cpu_fields.insert("total_ns".to_string(), stats.cpu_time.total_ns as f64);
    cpu_fields.insert("user_ns".to_string(), stats.cpu_time.user_ns as f64);
    cpu_fields.insert("system_ns".to_string(), stats.cpu_time.system_ns as f64);
    rows.push(MetricsRow {
        measurement: crate::storage::timeseries::Measurement::Cpu,
        host: stats.host.clone(),
        vm: stats.name.clone(),
        state: stats.state,
        fields: cpu_fields,
    });

    if let Some(current) = stats.balloon_current {
        let mut mem_fields = HashMap::new();
        mem_fields.insert("current".to_string(), current as f64);
        if let Some(max) = stats.balloon_maximum {
            mem_fields.insert("maximum".to_string(), max as f64);
        }
        rows.push(MetricsRow {
            measurement: crate::storage::timeseries::Measurement::Memory,
            host: stats.host.clone(),
            vm: stats.name.clone(),
            state: stats.state,
            fields: mem_fields,
        });
    }

    for nic in &stats.nics {
        let mut fields = HashMap::new();
        fields.insert("rx_bytes".to_string(), nic.rx_bytes as f64);
        fields.insert("tx_bytes".to_string(), nic.tx_bytes as f64);
        fields.insert("rx_drop".to_string(), nic.rx_drop as f64);
        fields.insert("tx_drop".to_string(), nic.tx_drop as f64);
        rows.push(MetricsRow {
            measurement: crate::storage::timeseries::Measurement::Net,
            host: stats.host.clone(),
            vm: stats.name.clone(),
            state: stats.state,
            fields,
        });
    }

    for block in &stats.blocks {
        let mut fields = HashMap::new();
        fields.insert("read_bytes".to_string(), block.read_bytes as f64);
        fields.insert("write_bytes".to_string(), block.write_bytes as f64);
        fields.insert("allocation".to_string(), block.allocation as f64);
        rows.push(MetricsRow {
            measurement: crate::storage::timeseries::Measurement::Block,
            host: stats.host.clone(),
            vm: stats.name.clone(),
            state: stats.state,
            fields,
        });
    }

    rows
}

/// Build the appropriate connection for a host's declared hypervisor kind.
/// Unknown kinds are rejected at config validation (spec.md design note 9);
/// this is the tagged-union dispatch point.
pub fn connect_for_host(host: &crate::model::host::Host) -> Box<dyn HypervisorConnection> {
    use crate::model::host::HypervisorKind;
    match host.hypervisor {
        HypervisorKind::Kvm | HypervisorKind::Esx | HypervisorKind::Xen => {
            Box::new(ssh_driver::SshHypervisorConnection::new(host.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::domain::{BlockStat, NicStat, PowerState};

    #[test]
    fn stats_to_metrics_db_emits_one_row_per_measurement_with_data() {
        let mut stats = DomainStats::new("h1", "vm1", PowerState::Running);
        stats.balloon_current = Some(1024);
        stats.nics.push(NicStat { name: "eth0".into(), ..Default::default() });
        stats.blocks.push(BlockStat { path: "/dev/vda".into(), ..Default::default() });
        let rows = stats_to_metrics_db(&stats);
        assert_eq!(rows.len(), 4); // cpu + memory + net + block
    }
}
