//! Host: a hypervisor endpoint identified by (name, address). See spec.md §3.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Transport {
    Ssh,
    Tls,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HypervisorKind {
    Kvm,
    Esx,
    Xen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceCapacity {
    pub cpu_cores: u32,
    pub memory_bytes: u64,
    pub storage_bytes: u64,
}

/// Credential material for a host connection. Never logged, never
/// re-serialized by `configRender` (spec.md §6).
#[derive(Debug, Clone)]
pub struct HostCredentials {
    pub user: Option<String>,
    pub password: Option<SecretString>,
    pub ssh_key: Option<SecretString>,
}

#[derive(Debug, Clone)]
pub struct Host {
    pub name: String,
    pub address: String,
    pub transport: Transport,
    pub port: u16,
    pub hypervisor: HypervisorKind,
    pub credentials: HostCredentials,
    pub capacity: ResourceCapacity,
    pub connection_timeout_secs: u64,
}

impl Host {
    /// (name, address) is the identity key used by the state DB and by
    /// every invariant in spec.md §3.
    pub fn key(&self) -> (&str, &str) {
        (&self.name, &self.address)
    }

    /// True if any capacity-relevant or transport attribute differs from
    /// `other`, i.e. whether `MetricsCollector` should issue a `host_update`
    /// (spec.md §4.2, step 2).
    pub fn capacity_changed(&self, other: &Host) -> bool {
        self.capacity.cpu_cores != other.capacity.cpu_cores
            || self.capacity.memory_bytes != other.capacity.memory_bytes
            || self.capacity.storage_bytes != other.capacity.storage_bytes
            || self.transport != other.transport
            || self.port != other.port
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(cores: u32) -> Host {
        Host {
            name: "h1".into(),
            address: "10.0.0.2".into(),
            transport: Transport::Ssh,
            port: 22,
            hypervisor: HypervisorKind::Kvm,
            credentials: HostCredentials { user: None, password: None, ssh_key: None },
            capacity: ResourceCapacity { cpu_cores: cores, memory_bytes: 0, storage_bytes: 0 },
            connection_timeout_secs: 5,
        }
    }

    #[test]
    fn capacity_change_detected() {
        assert!(host(4).capacity_changed(&host(8)));
        assert!(!host(4).capacity_changed(&host(4)));
    }
}
