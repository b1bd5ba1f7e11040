//! Supervisor (spec.md §4.1, §7): owns the queues and every subsystem,
//! starts them as concurrent tasks, and tears everything down on the first
//! fatal child completion or shutdown signal.

use std::sync::Arc;

use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

use crate::collector::MetricsCollector;
use crate::configuration::Settings;
use crate::dispatcher::AutoscalerDispatcher;
use crate::errors::FatalError;
use crate::healthcheck::{self, HealthState};
use crate::platform::{self, PlatformLink};
use crate::queues::{asg_queue, platform_queue};
use crate::reconciler::Reconciler;

pub struct Supervisor {
    settings: Settings,
}

impl Supervisor {
    pub fn new(settings: Settings) -> Self {
        Supervisor { settings }
    }

    /// Start every subsystem and block until either a fatal child error or
    /// a shutdown signal arrives. Returns the process exit code (spec.md §6).
    pub async fn run(self) -> i32 {
        let health = HealthState::new();

        let (asg_tx, asg_rx) = asg_queue(self.settings.controller.platform.actions_queue_max_size);
        let (platform_tx, platform_rx) = platform_queue(self.settings.controller.platform.actions_queue_max_size);

        let hosts_by_name = self
            .settings
            .controller
            .autoscale
            .hosts
            .iter()
            .map(|h| {
                let host = crate::model::host::Host {
                    name: h.name.clone(),
                    address: h.address.clone(),
                    transport: h.protocol,
                    port: h.port,
                    hypervisor: h.hypervisor,
                    credentials: crate::model::host::HostCredentials {
                        user: h.user.clone(),
                        password: None,
                        ssh_key: h.ssh_key.clone(),
                    },
                    capacity: crate::model::host::ResourceCapacity {
                        cpu_cores: h.resources.as_ref().and_then(|r| r.cpu_cores).unwrap_or(0),
                        memory_bytes: h.resources.as_ref().and_then(|r| r.memory_bytes).unwrap_or(0),
                        storage_bytes: h.resources.as_ref().and_then(|r| r.storage_bytes).unwrap_or(0),
                    },
                    connection_timeout_secs: h.timeout.unwrap_or(5),
                };
                (host.name.clone(), host)
            })
            .collect();

        let asgs = crate::reconciler::asgs_from_config(&self.settings);

        // One shared state store and one shared time-series store for the
        // whole process: the Collector writes what it observes, the
        // Reconciler reads it back to compute Actions, and the Dispatcher
        // updates it as Actions land. Building a private store per
        // component here would leave each subsystem looking at its own
        // disjoint copy of the world.
        let db = &self.settings.controller.databases;
        let state = crate::storage::state::build_shared(&db.state);
        let timeseries = crate::storage::timeseries::build_shared(&db.timeseries);

        let mut collector = MetricsCollector::new(&self.settings, health.clone(), state.clone(), timeseries.clone());
        let mut reconciler = Reconciler::new(&self.settings, asg_tx, state.clone(), timeseries);
        let mut dispatcher = AutoscalerDispatcher::new(asgs, hosts_by_name, state, asg_rx, platform_tx);

        // Inbound platform messages are parsed and logged by PlatformLink;
        // wiring them into Reconciler's live config overrides is left for
        // a follow-up once that control path is specified in more detail.
        let (inbound_tx, _inbound_rx) = tokio::sync::mpsc::channel(64);
        let platform_link = PlatformLink::new(
            &self.settings.controller.platform,
            std::path::Path::new("registration.json"),
            platform_rx,
            inbound_tx,
        );

        let healthcheck_settings = self.settings.controller.healthcheck.clone();
        let health_for_server = health.clone();

        let collector_task = tokio::spawn(async move { collector.run().await });
        let reconciler_task = tokio::spawn(async move { reconciler.run().await });
        let dispatcher_task = tokio::spawn(async move { dispatcher.run().await });
        let health_task = tokio::spawn(async move {
            health_for_server.mark_supervisor_alive();
            healthcheck::serve(&healthcheck_settings.host, healthcheck_settings.port, health_for_server).await
        });

        let platform_task = match platform_link {
            Ok(link) => tokio::spawn(async move { link.run().await }),
            Err(leftover_rx) => {
                info!("no platform token configured, running standalone");
                tokio::spawn(async move {
                    platform::drain_standalone(leftover_rx).await;
                    Ok(())
                })
            }
        };

        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");

        let exit_code = tokio::select! {
            result = collector_task => child_exit_code("collector", result),
            result = reconciler_task => child_exit_code("reconciler", result),
            result = dispatcher_task => child_exit_code("dispatcher", result),
            result = platform_task => child_exit_code("platform", result),
            result = health_task => health_exit_code(result),
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
                0
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                0
            }
            _ = sighup.recv() => {
                warn!("received SIGHUP, shutting down (config reload is not supported)");
                0
            }
        };

        exit_code
    }
}

fn child_exit_code(subsystem: &'static str, result: Result<Result<(), FatalError>, tokio::task::JoinError>) -> i32 {
    match result {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            eprintln!("{subsystem} failed: {e}");
            error!(subsystem, error = %e, "fatal child completion");
            e.exit_code()
        }
        Err(join_err) => {
            eprintln!("{subsystem} panicked: {join_err}");
            error!(subsystem, error = %join_err, "child task panicked");
            1
        }
    }
}

fn health_exit_code(result: Result<std::io::Result<()>, tokio::task::JoinError>) -> i32 {
    match result {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            eprintln!("healthcheck server failed: {e}");
            error!(error = %e, "healthcheck server exited");
            1
        }
        Err(join_err) => {
            eprintln!("healthcheck server panicked: {join_err}");
            1
        }
    }
}
