//! Domain (VM) and the normalized per-VM sample produced each collection
//! cycle. See spec.md §3.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PowerState {
    NoState,
    Running,
    Blocked,
    Paused,
    ShuttingDown,
    ShutOff,
    Crashed,
    PmSuspended,
}

#[derive(Debug, Clone)]
pub struct BlockDevice {
    pub device: String,
    pub source_path: Option<String>,
    pub size_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct NetworkInterface {
    pub mac: String,
    pub bridge: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Domain {
    pub host: String,
    pub name: String,
    pub state: PowerState,
    pub vcpu_current: u32,
    pub vcpu_maximum: u32,
    pub memory_bytes: u64,
    pub block_devices: Vec<BlockDevice>,
    pub nics: Vec<NetworkInterface>,
    pub asg: Option<String>,
    pub image: Option<String>,
    pub cloud_init: Option<String>,
}

impl Domain {
    /// (host, name) is the identity key (spec.md §3).
    pub fn key(&self) -> (&str, &str) {
        (&self.host, &self.name)
    }

    /// spec.md §3 invariant: `vcpu_current <= vcpu_maximum`.
    pub fn vcpu_invariant_holds(&self) -> bool {
        self.vcpu_current <= self.vcpu_maximum
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VcpuStat {
    pub state: Option<i32>,
    pub time_ns: Option<u64>,
    pub wait_ns: Option<u64>,
    pub delay_ns: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuTimeStat {
    pub total_ns: u64,
    pub user_ns: u64,
    pub system_ns: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NicStat {
    pub name: String,
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_errs: u64,
    pub rx_drop: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errs: u64,
    pub tx_drop: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockStat {
    pub path: String,
    pub read_reqs: u64,
    pub read_bytes: u64,
    pub write_reqs: u64,
    pub write_bytes: u64,
    pub flush_reqs: u64,
    pub allocation: u64,
    pub capacity: u64,
    pub physical_size: u64,
}

/// One normalized per-VM sample. Field names mirror the hypervisor driver's
/// normalization contract (spec.md §4.1): dots/dashes become underscores,
/// and flat `vcpu_N_time`-style keys are binned into `vcpus` in index order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainStats {
    pub host: String,
    pub name: String,
    pub state: PowerState,
    pub state_reason: Option<i32>,

    pub cpu_time: CpuTimeStat,
    pub vcpus: Vec<VcpuStat>,

    pub balloon_current: Option<u64>,
    pub balloon_maximum: Option<u64>,
    pub balloon_swap_in: Option<u64>,
    pub balloon_swap_out: Option<u64>,

    pub nics: Vec<NicStat>,
    pub blocks: Vec<BlockStat>,

    /// Derived-at-record-time fields (spec.md §3).
    pub net_count: usize,
    pub block_count: usize,
    pub collected_at: DateTime<Utc>,

    /// Set when a hypervisor reported `vcpu_current > vcpu_maximum`; the
    /// sample is kept (spec.md §3 invariant note) but flagged rather than
    /// discarded.
    pub vcpu_invariant_violated: bool,
}

impl DomainStats {
    pub fn new(host: impl Into<String>, name: impl Into<String>, state: PowerState) -> Self {
        DomainStats {
            host: host.into(),
            name: name.into(),
            state,
            state_reason: None,
            cpu_time: CpuTimeStat::default(),
            vcpus: Vec::new(),
            balloon_current: None,
            balloon_maximum: None,
            balloon_swap_in: None,
            balloon_swap_out: None,
            nics: Vec::new(),
            blocks: Vec::new(),
            net_count: 0,
            block_count: 0,
            collected_at: Utc::now(),
            vcpu_invariant_violated: false,
        }
    }

    /// Populate the derived fields and the vCPU invariant flag from the raw
    /// current/maximum a driver filled in.
    pub fn finalize(mut self, vcpu_current: u32, vcpu_maximum: u32) -> Self {
        self.net_count = self.nics.len();
        self.block_count = self.blocks.len();
        self.vcpu_invariant_violated = vcpu_current > vcpu_maximum;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vcpu_invariant_flagged_not_discarded() {
        let stats = DomainStats::new("h1", "vm1", PowerState::Running).finalize(5, 4);
        assert!(stats.vcpu_invariant_violated);
    }

    #[test]
    fn vcpu_invariant_ok() {
        let stats = DomainStats::new("h1", "vm1", PowerState::Running).finalize(2, 4);
        assert!(!stats.vcpu_invariant_violated);
    }

    #[test]
    fn derived_counts_match_vec_lengths() {
        let mut stats = DomainStats::new("h1", "vm1", PowerState::Running);
        stats.nics.push(NicStat { name: "eth0".into(), ..Default::default() });
        stats.blocks.push(BlockStat { path: "/dev/vda".into(), ..Default::default() });
        let stats = stats.finalize(1, 2);
        assert_eq!(stats.net_count, 1);
        assert_eq!(stats.block_count, 1);
    }
}
