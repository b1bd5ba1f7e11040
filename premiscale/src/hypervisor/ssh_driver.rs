//! Concrete hypervisor driver for QEMU/KVM (and, by the same SSH+`virsh`
//! transport, ESX/Xen hosts that expose a libvirt-compatible CLI). This is
//! the "out of scope, specified only at its interface" implementation
//! spec.md §1 calls out — kept intentionally thin; the contract in
//! [`super::HypervisorConnection`] is what the rest of the control plane
//! depends on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::ChannelMsg;
use secrecy::ExposeSecret;
use tokio::time::timeout;
use tracing::debug;

use crate::model::domain::{CpuTimeStat, DomainStats, PowerState};
use crate::model::host::Host;

use super::{ConnectError, ConnectionState, DomainCreateSpec, DomainSnapshot, HostStats, HypervisorConnection};

struct AcceptingHandler;

impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Host-key pinning is left to the operator's SSH client
        // configuration (see spec.md design note on SSH side effects);
        // this driver trusts whatever the transport layer hands it.
        Ok(true)
    }
}

pub struct SshHypervisorConnection {
    host: Host,
    state: ConnectionState,
    session: Option<Handle<AcceptingHandler>>,
}

impl SshHypervisorConnection {
    pub fn new(host: Host) -> Self {
        SshHypervisorConnection { host, state: ConnectionState::New, session: None }
    }

    async fn run(&mut self, command: &str) -> Result<String, ConnectError> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| ConnectError::Protocol("not connected".into()))?;

        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| ConnectError::Protocol(e.to_string()))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| ConnectError::Protocol(e.to_string()))?;

        let mut stdout = Vec::new();
        let mut exit_status = None;
        while let Some(message) = channel.wait().await {
            match message {
                ChannelMsg::Data { data } => stdout.extend_from_slice(data.as_ref()),
                ChannelMsg::ExtendedData { data, .. } => stdout.extend_from_slice(data.as_ref()),
                ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
                _ => {}
            }
        }

        match exit_status {
            Some(0) | None => Ok(String::from_utf8_lossy(&stdout).to_string()),
            Some(status) => Err(ConnectError::Protocol(format!(
                "command `{command}` exited with status {status}: {}",
                String::from_utf8_lossy(&stdout).trim()
            ))),
        }
    }
}

#[async_trait]
impl HypervisorConnection for SshHypervisorConnection {
    fn state(&self) -> ConnectionState {
        self.state
    }

    async fn open(&mut self, _readonly: bool) -> Result<(), ConnectError> {
        self.state = ConnectionState::Opening;

        let config = Arc::new(client::Config::default());
        let address = self.host.address.clone();
        let port = self.host.port;

        let connect_result = timeout(
            Duration::from_secs(self.host.connection_timeout_secs),
            client::connect(config, (address.as_str(), port), AcceptingHandler),
        )
        .await;

        let mut session = match connect_result {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                self.state = ConnectionState::Degraded;
                return Err(ConnectError::Transport(address, e.to_string()));
            }
            Err(_) => {
                self.state = ConnectionState::Degraded;
                return Err(ConnectError::Transport(address, "connect timed out".into()));
            }
        };

        let user = self.host.credentials.user.clone().unwrap_or_else(|| "root".to_string());
        let authenticated = if let Some(password) = &self.host.credentials.password {
            session
                .authenticate_password(user.clone(), password.expose_secret())
                .await
                .map_err(|e| ConnectError::Protocol(e.to_string()))?
                .success()
        } else {
            false
        };

        if !authenticated {
            self.state = ConnectionState::Degraded;
            return Err(ConnectError::Authentication(user));
        }

        self.session = Some(session);
        self.state = ConnectionState::Open;
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session
                .disconnect(russh::Disconnect::ByApplication, "collection complete", "en")
                .await;
        }
        self.state = ConnectionState::Closed;
    }

    async fn get_host_stats(&mut self) -> Result<HostStats, ConnectError> {
        let nodeinfo = self.run("virsh nodeinfo").await?;
        let mut node_cpu_stats = HashMap::new();
        let mut max_vcpus = 0u32;
        for line in nodeinfo.lines() {
            let mut parts = line.splitn(2, ':');
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else { continue };
            let key = key.trim();
            let value = value.trim();
            if key == "CPU(s)" {
                max_vcpus = value.parse().unwrap_or(0);
            }
            if let Ok(n) = value.parse::<f64>() {
                node_cpu_stats.insert(key.to_string(), n as u64);
            }
        }

        let free_mem_output = self.run("virsh freecell --all").await.unwrap_or_default();
        let free_memory_bytes = free_mem_output
            .lines()
            .find_map(|l| l.split(':').nth(1))
            .and_then(|s| s.trim().split_whitespace().next())
            .and_then(|n| n.parse::<u64>().ok())
            .unwrap_or(0)
            * 1024;

        let list_output = self.run("virsh list --all --name").await?;
        let domains = list_output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|name| DomainSnapshot { name: name.to_string(), state: PowerState::NoState })
            .collect();

        Ok(HostStats {
            hostname: self.host.name.clone(),
            hypervisor_kind: self.host.hypervisor.to_string(),
            hypervisor_version: "unknown".to_string(),
            uri: format!("qemu+ssh://{}/system", self.host.address),
            capabilities: String::new(),
            max_vcpus,
            free_memory_bytes,
            node_memory_stats: HashMap::new(),
            node_cpu_stats,
            domains,
        })
    }

    async fn get_host_vm_stats(&mut self) -> Result<Vec<DomainStats>, ConnectError> {
        let names_output = self.run("virsh list --name --state-running").await?;
        let mut out = Vec::new();

        for name in names_output.lines().map(str::trim).filter(|l| !l.is_empty()) {
            // `virsh domstats <name>` emits `key=value` pairs; real field
            // names use dots (e.g. `vcpu.0.time`) which are normalized here
            // to underscores per the driver contract in spec.md §4.1.
            let raw = self.run(&format!("virsh domstats {name}")).await.unwrap_or_default();
            let mut stats = DomainStats::new(self.host.name.clone(), name.to_string(), PowerState::Running);
            let mut vcpu_current = 0u32;
            let vcpu_maximum = self.host_vcpu_ceiling();

            for line in raw.lines() {
                let Some((key, value)) = line.trim().split_once('=') else { continue };
                let key = key.replace(['.', '-'], "_");
                match key.as_str() {
                    "cpu_time" => stats.cpu_time = CpuTimeStat { total_ns: value.parse().unwrap_or(0), ..stats.cpu_time },
                    "cpu_user" => stats.cpu_time.user_ns = value.parse().unwrap_or(0),
                    "cpu_system" => stats.cpu_time.system_ns = value.parse().unwrap_or(0),
                    "vcpu_current" => vcpu_current = value.parse().unwrap_or(0),
                    "balloon_current" => stats.balloon_current = value.parse().ok(),
                    "balloon_maximum" => stats.balloon_maximum = value.parse().ok(),
                    _ => {}
                }
            }

            out.push(stats.finalize(vcpu_current, vcpu_maximum));
        }

        Ok(out)
    }

    async fn create_domain(&mut self, spec: &DomainCreateSpec) -> Result<(), ConnectError> {
        debug!(vm = %spec.name, "creating domain via virt-install");
        let cmd = format!(
            "virt-install --name {} --vcpus {} --memory {} --import --disk none --network bridge={} --noautoconsole",
            shell_quote(&spec.name),
            spec.vcpus,
            spec.memory_bytes / (1024 * 1024),
            shell_quote(&spec.network_bridge),
        );
        self.run(&cmd).await.map(|_| ())
    }

    async fn clone_domain(&mut self, source: &str, dest: &str) -> Result<(), ConnectError> {
        let cmd = format!("virt-clone --original {} --name {} --auto-clone", shell_quote(source), shell_quote(dest));
        self.run(&cmd).await.map(|_| ())
    }

    async fn migrate_domain(&mut self, vm: &str, dest_uri: &str) -> Result<(), ConnectError> {
        let cmd = format!("virsh migrate --live {} {}", shell_quote(vm), shell_quote(dest_uri));
        self.run(&cmd).await.map(|_| ())
    }

    async fn delete_domain(&mut self, vm: &str, reclaim_storage: bool) -> Result<(), ConnectError> {
        // Idempotent: deleting a missing domain is success (spec.md §5).
        let flag = if reclaim_storage { " --remove-all-storage" } else { "" };
        let cmd = format!("virsh destroy {vm}; virsh undefine{flag} {}", shell_quote(vm));
        match self.run(&cmd).await {
            Ok(_) => Ok(()),
            Err(ConnectError::Protocol(msg)) if msg.contains("domain not found") => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl SshHypervisorConnection {
    fn host_vcpu_ceiling(&self) -> u32 {
        self.host.capacity.cpu_cores.max(1)
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
