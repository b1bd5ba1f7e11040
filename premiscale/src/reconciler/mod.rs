//! Reconciler (spec.md §4.3): joins desired config state with observed
//! state-DB membership and recent TSDB load, emits the minimal Action
//! sequence per ASG onto the ASG queue.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};

use crate::action::{self, Action};
use crate::configuration::Settings;
use crate::model::asg::{AsgTable, AutoscalingGroup, ScalingMethod};
use crate::queues::AsgQueueSender;
use crate::storage::state::{SharedStateStore, StateStore};
use crate::storage::timeseries::{Measurement, SharedTimeSeriesStore, TimeSeriesStore};

/// Grouping key used to fold candidate Actions within one cycle: Creates
/// for the same ASG merge (no VM target yet); everything else groups by
/// the specific (asg, vm) it targets (spec.md §3 combine).
fn group_key(action: &Action) -> String {
    match action {
        Action::Null => "null".to_string(),
        Action::Create { asg, .. } => format!("create:{asg}"),
        Action::Clone { asg, vm, .. } => format!("{asg}:{vm}"),
        Action::Migrate { asg, vm, .. } => format!("{asg}:{vm}"),
        Action::Replace { asg, vm, .. } => format!("{asg}:{vm}"),
        Action::Delete { asg, vm, .. } => format!("{asg}:{vm}"),
    }
}

/// Fold a candidate list (in emission order) into the minimal set of
/// Actions actually enqueued, grouping same-target candidates together
/// before applying the monoid (spec.md §4.3 "Action reduction").
fn reduce_candidates(candidates: Vec<Action>) -> Vec<Action> {
    let mut groups: Vec<(String, Vec<Action>)> = Vec::new();
    for action in candidates {
        let key = group_key(&action);
        if let Some(entry) = groups.iter_mut().find(|(k, _)| *k == key) {
            entry.1.push(action);
        } else {
            groups.push((key, vec![action]));
        }
    }
    groups
        .into_iter()
        .map(|(_, actions)| action::reduce(actions))
        .filter(|a| *a != Action::Null)
        .collect()
}

/// Estimate a 0..1 utilization fraction for one ASG's scaling method from
/// raw TSDB fields. The underlying counters are cumulative/raw (ns, bytes)
/// rather than pre-normalized percentages, so this rates the field's
/// change over the window against a nominal per-resource capacity.
async fn measure_utilization(
    timeseries: &SharedTimeSeriesStore,
    members: &[(String, String)],
    method: ScalingMethod,
    trailing_secs: u64,
) -> f64 {
    if members.is_empty() {
        return 0.0;
    }

    let since = Utc::now() - chrono::Duration::seconds(trailing_secs as i64);
    let (measurement, field_a, field_b, capacity_per_sec): (Measurement, &str, Option<&str>, f64) = match method {
        ScalingMethod::Cpu => (Measurement::Cpu, "total_ns", None, 1_000_000_000.0),
        ScalingMethod::Memory => (Measurement::Memory, "current", Some("maximum"), 0.0),
        ScalingMethod::Net => (Measurement::Net, "rx_bytes", Some("tx_bytes"), 1_000_000_000.0 / 8.0),
        ScalingMethod::Block => (Measurement::Block, "read_bytes", Some("write_bytes"), 500_000_000.0),
    };

    let mut samples = Vec::new();
    {
        let guard = timeseries.lock().await;
        for (host, vm) in members {
            match guard.get_all(measurement, host, vm, since).await {
                Ok(points) => samples.push(points),
                Err(e) => warn!(host, vm, error = %e, "failed to read time-series window"),
            }
        }
    }

    let mut fractions = Vec::new();
    for points in samples {
        if points.is_empty() {
            continue;
        }
        if method == ScalingMethod::Memory {
            let ratios: Vec<f64> = points
                .iter()
                .filter_map(|p| {
                    let current = p.fields.get(field_a)?;
                    let maximum = field_b.and_then(|f| p.fields.get(f))?;
                    if *maximum > 0.0 { Some(current / maximum) } else { None }
                })
                .collect();
            if !ratios.is_empty() {
                fractions.push(ratios.iter().sum::<f64>() / ratios.len() as f64);
            }
            continue;
        }

        let mut sorted = points.clone();
        sorted.sort_by_key(|p| p.recorded_at);
        let first = sorted.first().unwrap();
        let last = sorted.last().unwrap();
        let window_secs = (last.recorded_at - first.recorded_at).num_seconds().max(1) as f64;

        let delta_a = last.fields.get(field_a).copied().unwrap_or(0.0) - first.fields.get(field_a).copied().unwrap_or(0.0);
        let delta_b = field_b
            .map(|f| last.fields.get(f).copied().unwrap_or(0.0) - first.fields.get(f).copied().unwrap_or(0.0))
            .unwrap_or(0.0);

        let rate = (delta_a + delta_b).max(0.0) / window_secs;
        if capacity_per_sec > 0.0 {
            fractions.push((rate / capacity_per_sec).min(1.0));
        }
    }

    if fractions.is_empty() {
        0.0
    } else {
        fractions.iter().sum::<f64>() / fractions.len() as f64
    }
}

fn target_for(asg: &AutoscalingGroup) -> Option<f64> {
    match asg.scaling_method {
        ScalingMethod::Cpu => asg.target_utilization.cpu,
        ScalingMethod::Memory => asg.target_utilization.memory,
        ScalingMethod::Net => asg.target_utilization.net,
        ScalingMethod::Block => asg.target_utilization.block,
    }
}

pub struct Reconciler {
    asgs: AsgTable,
    state: SharedStateStore,
    timeseries: SharedTimeSeriesStore,
    asg_queue: AsgQueueSender,
    interval: Duration,
    trailing_secs: u64,
    last_action_at: HashMap<String, Instant>,
}

impl Reconciler {
    /// `state`/`timeseries` are shared with the Collector (and `state`
    /// with the Dispatcher) so the Reconciler reads exactly what the
    /// Collector just wrote, rather than a private, disjoint store.
    pub fn new(
        settings: &Settings,
        asg_queue: AsgQueueSender,
        state: SharedStateStore,
        timeseries: SharedTimeSeriesStore,
    ) -> Self {
        let asgs = asgs_from_config(settings);
        let db = &settings.controller.databases;
        Reconciler {
            asgs,
            state,
            timeseries,
            asg_queue,
            interval: Duration::from_secs(settings.controller.reconciliation.interval),
            trailing_secs: db.timeseries.trailing_secs(),
            last_action_at: HashMap::new(),
        }
    }

    /// Construct a Reconciler directly over already-open, shared storage
    /// adapters, bypassing config-driven construction. Used by integration
    /// tests that need to seed state/timeseries data the Reconciler will
    /// read back (often the same stores handed to a Collector/Dispatcher
    /// under test).
    pub fn with_stores(
        asgs: AsgTable,
        state: SharedStateStore,
        timeseries: SharedTimeSeriesStore,
        asg_queue: AsgQueueSender,
        interval: Duration,
        trailing_secs: u64,
    ) -> Self {
        Reconciler { asgs, state, timeseries, asg_queue, interval, trailing_secs, last_action_at: HashMap::new() }
    }

    pub async fn open(&mut self) -> Result<(), crate::errors::FatalError> {
        self.state
            .lock()
            .await
            .open()
            .await
            .map_err(|e| crate::errors::FatalError::ChildFailed { subsystem: "reconciler", source: e.into() })?;
        self.timeseries
            .lock()
            .await
            .open()
            .await
            .map_err(|e| crate::errors::FatalError::ChildFailed { subsystem: "reconciler", source: e.into() })?;
        Ok(())
    }

    pub async fn run(&mut self) -> Result<(), crate::errors::FatalError> {
        self.open().await?;

        loop {
            let started = Instant::now();
            self.run_one_cycle().await;

            let elapsed = started.elapsed();
            if elapsed >= self.interval {
                warn!(?elapsed, interval = ?self.interval, "reconciliation cycle overran its interval");
                continue;
            }
            tokio::time::sleep(self.interval - elapsed).await;
        }
    }

    /// Run exactly one reconciliation cycle across every configured ASG.
    /// `run` calls this in a loop; exposed directly so callers (tests,
    /// an external scheduler) can drive single steps.
    pub async fn tick(&mut self) {
        self.run_one_cycle().await;
    }

    async fn run_one_cycle(&mut self) {
        let names: Vec<String> = self.asgs.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.reconcile_one(&name).await {
                warn!(asg = %name, error = %e, "skipping reconciliation cycle for this ASG due to a backend failure");
            }
        }
    }

    async fn reconcile_one(&mut self, name: &str) -> Result<(), crate::storage::state::StateError> {
        let asg = self.asgs.get(name).cloned().expect("asg name comes from self.asgs.keys()");

        if let Some(last) = self.last_action_at.get(name) {
            if last.elapsed() < Duration::from_secs(asg.cooldown_secs) {
                self.send(Action::Null).await;
                return Ok(());
            }
        }

        let members = self.state.lock().await.get_asg_vms(name, None).await?;
        let member_pairs: Vec<(String, String)> = members.iter().map(|v| (v.host.clone(), v.name.clone())).collect();

        let utilization = measure_utilization(
            &self.timeseries,
            &member_pairs,
            asg.scaling_method,
            self.trailing_secs,
        )
        .await;

        let target = target_for(&asg).unwrap_or(0.5);
        let signed_delta = if target > 0.0 { ((utilization - target) / target).signum() * asg.increment as f64 } else { 0.0 };
        let delta = signed_delta.round() as i64;

        let new_desired = asg.clamp_desired(members.len() as i64 + delta);
        let diff = new_desired as i64 - members.len() as i64;

        let candidates = self.build_candidates(&asg, &members, diff);
        let actions = reduce_candidates(candidates);

        if actions.is_empty() {
            self.send(Action::Null).await;
        } else {
            for action in actions {
                self.last_action_at.insert(name.to_string(), Instant::now());
                self.send(action).await;
            }
        }

        Ok(())
    }

    fn build_candidates(
        &self,
        asg: &AutoscalingGroup,
        members: &[crate::storage::state::VmRecord],
        diff: i64,
    ) -> Vec<Action> {
        if diff > 0 {
            let bounded = diff.min(asg.replacement.max_surge.max(1) as i64) as u32;
            let host = asg.hosts.first().cloned().unwrap_or_default();
            vec![Action::Create { asg: asg.name.clone(), host, modifier: bounded }]
        } else if diff < 0 {
            let bounded = (-diff).min(asg.replacement.max_unavailable.max(1) as i64) as usize;
            let mut sorted = members.to_vec();
            sorted.sort_by(|a, b| a.name.cmp(&b.name));
            sorted
                .into_iter()
                .rev()
                .take(bounded)
                .map(|v| Action::Delete { asg: asg.name.clone(), vm: v.name, host: v.host, reclaim_storage: true })
                .collect()
        } else {
            Vec::new()
        }
    }

    async fn send(&self, action: Action) {
        if self.asg_queue.send(action).await.is_err() {
            warn!("asg queue receiver dropped; dispatcher may have shut down");
        } else {
            info!("emitted action onto asg queue");
        }
    }
}

pub(crate) fn asgs_from_config(settings: &Settings) -> AsgTable {
    settings
        .controller
        .autoscale
        .groups
        .iter()
        .map(|(name, group)| {
            (
                name.clone(),
                AutoscalingGroup {
                    name: name.clone(),
                    min: group.scaling.min,
                    max: group.scaling.max,
                    desired: group.scaling.desired,
                    increment: group.scaling.increment,
                    cooldown_secs: group.scaling.cooldown,
                    scaling_method: group.scaling.method,
                    target_utilization: group.scaling.target_utilization.clone(),
                    replacement: group.replacement.clone(),
                    network: group.networking.clone(),
                    image: group.image.clone(),
                    domain_name_template: group.domain_name.clone(),
                    cloud_init: group.cloud_init.clone(),
                    hosts: group.hosts.clone(),
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(asg: &str, n: u32) -> Action {
        Action::Create { asg: asg.into(), host: "h1".into(), modifier: n }
    }

    #[test]
    fn candidates_for_same_asg_create_merge() {
        let reduced = reduce_candidates(vec![create("g1", 1), create("g1", 1)]);
        assert_eq!(reduced, vec![create("g1", 2)]);
    }

    #[test]
    fn candidates_for_different_vms_stay_distinct() {
        let a = Action::Delete { asg: "g1".into(), vm: "v1".into(), host: "h1".into(), reclaim_storage: true };
        let b = Action::Delete { asg: "g1".into(), vm: "v2".into(), host: "h1".into(), reclaim_storage: true };
        let reduced = reduce_candidates(vec![a.clone(), b.clone()]);
        assert_eq!(reduced.len(), 2);
        assert!(reduced.contains(&a));
        assert!(reduced.contains(&b));
    }

    #[test]
    fn null_candidates_are_dropped() {
        let reduced = reduce_candidates(vec![Action::Null, Action::Null]);
        assert!(reduced.is_empty());
    }
}
