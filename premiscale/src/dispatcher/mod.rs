//! AutoscalerDispatcher (spec.md §4.4): consumes Actions from the ASG
//! queue, serializes execution per ASG through a single-slot lane, and
//! reports an audit record for every completed Action.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

use crate::action::{Action, ActionOutcome, AuditRecord};
use crate::hypervisor::{self, ConnectError, DomainCreateSpec};
use crate::model::asg::AsgTable;
use crate::model::host::Host;
use crate::queues::{AsgQueueReceiver, PlatformMessage, PlatformQueueSender};
use crate::storage::state::{SharedStateStore, StateStore, VmRecord};

const DISPATCH_RETRIES: u32 = 3;
const DISPATCH_BACKOFF_BASE: Duration = Duration::from_secs(1);

pub struct AutoscalerDispatcher {
    asgs: AsgTable,
    hosts_by_name: HashMap<String, Host>,
    state: SharedStateStore,
    asg_queue: AsgQueueReceiver,
    platform_queue: PlatformQueueSender,
    lanes: Arc<AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl AutoscalerDispatcher {
    /// `state` is shared with the Collector/Reconciler so created and
    /// deleted VMs are visible to the rest of the controller immediately,
    /// rather than landing in a private store of the Dispatcher's own.
    pub fn new(
        asgs: AsgTable,
        hosts_by_name: HashMap<String, Host>,
        state: SharedStateStore,
        asg_queue: AsgQueueReceiver,
        platform_queue: PlatformQueueSender,
    ) -> Self {
        AutoscalerDispatcher {
            asgs,
            hosts_by_name,
            state,
            asg_queue,
            platform_queue,
            lanes: Arc::new(AsyncMutex::new(HashMap::new())),
        }
    }

    pub async fn open(&mut self) -> Result<(), crate::errors::FatalError> {
        self.state
            .lock()
            .await
            .open()
            .await
            .map_err(|e| crate::errors::FatalError::ChildFailed { subsystem: "dispatcher", source: e.into() })
    }

    pub async fn run(&mut self) -> Result<(), crate::errors::FatalError> {
        self.open().await?;

        while let Some(action) = self.asg_queue.recv().await {
            if action == Action::Null {
                continue;
            }
            let Some(asg_name) = action.asg().map(str::to_string) else { continue };

            // Acquire the lane in dequeue order, before spawning, so two
            // actions for the same ASG run in enqueue order: tokio's mutex
            // is FIFO-fair, but only over waiters already queued on it, so
            // the wait must start here rather than inside the spawned task
            // (otherwise the task scheduler decides which one locks first).
            let lane = self.lane_for(&asg_name).await;
            let permit = lane.lock_owned().await;

            let asgs = self.asgs.clone();
            let hosts = self.hosts_by_name.clone();
            let state = self.state.clone();
            let platform_queue = self.platform_queue.clone();

            tokio::spawn(async move {
                let _permit = permit;
                run_action(action, asgs, hosts, state, platform_queue).await;
            });
        }
        Ok(())
    }

    async fn lane_for(&self, asg: &str) -> Arc<AsyncMutex<()>> {
        let mut lanes = self.lanes.lock().await;
        lanes.entry(asg.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }
}

async fn run_action(
    action: Action,
    asgs: AsgTable,
    hosts: HashMap<String, Host>,
    state: SharedStateStore,
    platform_queue: PlatformQueueSender,
) {
    let started_at = chrono::Utc::now();
    let asg_name = action.asg().unwrap_or_default().to_string();

    let (host_name, vm_name, result) = execute(&action, &asgs, &hosts, &state).await;
    let finished_at = chrono::Utc::now();

    let (outcome, error) = match &result {
        Ok(()) => (ActionOutcome::Succeeded, None),
        Err(e) => (ActionOutcome::Failed, Some(e.to_string())),
    };

    if let Err(e) = &result {
        warn!(asg = %asg_name, vm = %vm_name, error = %e, "action failed after retries");
    } else {
        info!(asg = %asg_name, vm = %vm_name, "action completed");
    }

    let record = AuditRecord {
        id: Uuid::new_v4(),
        action,
        asg: asg_name,
        host: host_name,
        vm: vm_name,
        started_at,
        finished_at,
        outcome,
        error,
    };

    if platform_queue.send(PlatformMessage::Audit(record)).await.is_err() {
        warn!("platform queue receiver dropped; audit record discarded");
    }
}

/// Map one Action to its hypervisor write call(s), retrying transient
/// failures with bounded exponential backoff (spec.md §4.4: 3 tries, base
/// 1s). Returns the (host, vm) this action targeted for audit purposes.
async fn execute(
    action: &Action,
    asgs: &AsgTable,
    hosts: &HashMap<String, Host>,
    state: &SharedStateStore,
) -> (String, String, Result<(), ConnectError>) {
    match action {
        Action::Null => (String::new(), String::new(), Ok(())),

        Action::Create { asg, host, modifier } => {
            let result = create_members(asg, host, *modifier, asgs, hosts, state).await;
            (host.clone(), format!("{asg}-batch"), result)
        }

        Action::Clone { vm, source_host, dest_host, .. } => {
            let dest_name = format!("{vm}-clone");
            let result = with_retry(source_host, hosts, |conn| {
                let vm = vm.clone();
                let dest_name = dest_name.clone();
                Box::pin(async move { conn.clone_domain(&vm, &dest_name).await })
            })
            .await;
            let _ = dest_host;
            (source_host.clone(), vm.clone(), result)
        }

        Action::Migrate { vm, source_host, dest_host, .. } => {
            let dest_uri = hosts
                .get(dest_host)
                .map(|h| format!("qemu+ssh://{}/system", h.address))
                .unwrap_or_default();
            let result = with_retry(source_host, hosts, |conn| {
                let vm = vm.clone();
                let dest_uri = dest_uri.clone();
                Box::pin(async move { conn.migrate_domain(&vm, &dest_uri).await })
            })
            .await;
            (source_host.clone(), vm.clone(), result)
        }

        Action::Replace { vm, host, .. } => {
            let result = with_retry(host, hosts, |conn| {
                let vm = vm.clone();
                Box::pin(async move { conn.delete_domain(&vm, false).await })
            })
            .await;
            let result = match result {
                Ok(()) => {
                    with_retry(host, hosts, |conn| {
                        let spec = DomainCreateSpec {
                            name: vm.clone(),
                            vcpus: 1,
                            memory_bytes: 1 << 30,
                            image: String::new(),
                            cloud_init: None,
                            network_bridge: String::new(),
                        };
                        Box::pin(async move { conn.create_domain(&spec).await })
                    })
                    .await
                }
                Err(e) => Err(e),
            };
            (host.clone(), vm.clone(), result)
        }

        Action::Delete { vm, host, reclaim_storage, asg, .. } => {
            let result = with_retry(host, hosts, |conn| {
                let vm = vm.clone();
                let reclaim = *reclaim_storage;
                Box::pin(async move { conn.delete_domain(&vm, reclaim).await })
            })
            .await;
            if result.is_ok() {
                let mut guard = state.lock().await;
                let _ = guard.vm_delete(host, vm).await;
                let _ = guard.asg_remove_vm(asg, host, vm).await;
            }
            (host.clone(), vm.clone(), result)
        }
    }
}

async fn create_members(
    asg_name: &str,
    host_name: &str,
    modifier: u32,
    asgs: &AsgTable,
    hosts: &HashMap<String, Host>,
    state: &SharedStateStore,
) -> Result<(), ConnectError> {
    let Some(asg) = asgs.get(asg_name) else {
        return Err(ConnectError::Protocol(format!("unknown asg {asg_name}")));
    };

    let existing = {
        let guard = state.lock().await;
        guard.get_asg_vms(asg_name, None).await.unwrap_or_default()
    };
    let mut next_index = existing.len() as u32;

    for _ in 0..modifier {
        let name = asg.render_domain_name(next_index);
        next_index += 1;

        let spec = DomainCreateSpec {
            name: name.clone(),
            vcpus: 1,
            memory_bytes: 1 << 30,
            image: asg.image.clone(),
            cloud_init: asg.cloud_init.clone(),
            network_bridge: asg.network.bridge.clone(),
        };

        with_retry(host_name, hosts, |conn| {
            let spec = spec.clone();
            Box::pin(async move { conn.create_domain(&spec).await })
        })
        .await?;

        let mut guard = state.lock().await;
        let _ = guard
            .vm_create(&VmRecord {
                host: host_name.to_string(),
                name: name.clone(),
                state: crate::model::domain::PowerState::Running,
                asg: Some(asg_name.to_string()),
            })
            .await;
        let _ = guard.asg_create(asg_name).await;
        let _ = guard.asg_add_vm(asg_name, host_name, &name).await;
    }

    Ok(())
}

async fn with_retry<F>(host_name: &str, hosts: &HashMap<String, Host>, mut op: F) -> Result<(), ConnectError>
where
    F: for<'a> FnMut(
        &'a mut Box<dyn hypervisor::HypervisorConnection>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), ConnectError>> + Send + 'a>>,
{
    let Some(host) = hosts.get(host_name) else {
        return Err(ConnectError::Transport(host_name.to_string(), "unknown host".into()));
    };

    let mut connection = hypervisor::connect_for_host(host);
    connection.open(false).await?;

    let mut last_err = None;
    for attempt in 0..DISPATCH_RETRIES {
        match op(&mut connection).await {
            Ok(()) => {
                connection.close().await;
                return Ok(());
            }
            Err(e) => {
                warn!(host = %host_name, attempt = attempt + 1, error = %e, "hypervisor write failed, retrying");
                last_err = Some(e);
                sleep(DISPATCH_BACKOFF_BASE * 2u32.pow(attempt)).await;
            }
        }
    }
    connection.close().await;
    Err(last_err.unwrap_or_else(|| ConnectError::Unavailable("exhausted retries".into())))
}
