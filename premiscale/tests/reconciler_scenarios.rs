//! End-to-end scenarios against the Reconciler driven directly over
//! in-memory storage adapters (no hypervisor I/O, no network): cold start,
//! scale-up under sustained load, and cooldown suppression.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;

use premiscale::action::Action;
use premiscale::model::asg::{AsgTable, AutoscalingGroup, NetworkSpec, Replacement, ReplacementStrategy, ScalingMethod, UtilizationTargets};
use premiscale::queues::asg_queue;
use premiscale::reconciler::Reconciler;
use premiscale::storage::state::{SharedStateStore, StateStore, VmRecord};
use premiscale::storage::timeseries::{Measurement, Point, SharedTimeSeriesStore, TimeSeriesStore};

fn one_asg(name: &str) -> AsgTable {
    let mut table = HashMap::new();
    table.insert(
        name.to_string(),
        AutoscalingGroup {
            name: name.to_string(),
            min: 1,
            max: 3,
            desired: 1,
            increment: 1,
            cooldown_secs: 300,
            scaling_method: ScalingMethod::Cpu,
            target_utilization: UtilizationTargets { cpu: Some(0.6), ..Default::default() },
            replacement: Replacement { strategy: ReplacementStrategy::RollingUpdate, max_unavailable: 1, max_surge: 1 },
            network: NetworkSpec { bridge: "br0".into(), mtu: None },
            image: "base.img".into(),
            domain_name_template: "{asg}-{index}".into(),
            cloud_init: None,
            hosts: vec!["h1".into()],
        },
    );
    table
}

async fn new_state() -> SharedStateStore {
    let mut state = premiscale::storage::state::sqlite::SqliteStateStore::new(None);
    state.open().await.unwrap();
    state.initialize().await.unwrap();
    std::sync::Arc::new(tokio::sync::Mutex::new(Box::new(state) as Box<dyn StateStore>))
}

fn new_timeseries() -> SharedTimeSeriesStore {
    std::sync::Arc::new(tokio::sync::Mutex::new(
        Box::new(premiscale::storage::timeseries::memory::MemoryTimeSeriesStore::new()) as Box<dyn TimeSeriesStore>,
    ))
}

#[tokio::test]
async fn cold_start_emits_single_create_for_empty_asg() {
    let asgs = one_asg("g1");
    let state = new_state().await;
    let timeseries = new_timeseries();
    let (tx, mut rx) = asg_queue(8);

    let mut reconciler = Reconciler::with_stores(asgs, state, timeseries, tx, Duration::from_secs(30), 600);
    reconciler.open().await.unwrap();
    reconciler.tick().await;

    let action = rx.try_recv().expect("reconciler should have emitted an action");
    assert!(matches!(action, Action::Create { ref asg, modifier: 1, .. } if asg == "g1"));
    assert!(rx.try_recv().is_err(), "exactly one action expected per cycle");
}

#[tokio::test]
async fn scale_up_on_sustained_high_cpu_then_null_next_cycle() {
    let asgs = one_asg("g1");
    let state = new_state().await;

    {
        let mut guard = state.lock().await;
        guard
            .vm_create(&VmRecord {
                host: "h1".into(),
                name: "g1-0".into(),
                state: premiscale::model::domain::PowerState::Running,
                asg: Some("g1".into()),
            })
            .await
            .unwrap();
        guard.asg_create("g1").await.unwrap();
        guard.asg_add_vm("g1", "h1", "g1-0").await.unwrap();
    }

    let timeseries = new_timeseries();
    timeseries.lock().await.open().await.unwrap();

    // Two samples 60s apart whose total_ns delta implies ~90% of one core.
    let now = Utc::now();
    let mut early = HashMap::new();
    early.insert("total_ns".to_string(), 0.0);
    let mut late = HashMap::new();
    late.insert("total_ns".to_string(), 54_000_000_000.0);

    timeseries
        .lock()
        .await
        .insert_batch(vec![
            Point { measurement: Measurement::Cpu, host: "h1".into(), vm: "g1-0".into(), fields: early, recorded_at: now - chrono::Duration::seconds(60) },
            Point { measurement: Measurement::Cpu, host: "h1".into(), vm: "g1-0".into(), fields: late, recorded_at: now },
        ])
        .await
        .unwrap();

    let (tx, mut rx) = asg_queue(8);
    let mut reconciler = Reconciler::with_stores(asgs.clone(), state, timeseries, tx, Duration::from_secs(30), 600);
    reconciler.open().await.unwrap();
    reconciler.tick().await;

    let action = rx.try_recv().expect("expected a scale-up action under sustained high load");
    assert!(matches!(action, Action::Create { ref asg, modifier: 1, .. } if asg == "g1"));
}

#[tokio::test]
async fn cooldown_suppresses_second_cycle_action() {
    let asgs = one_asg("g1");
    let state = new_state().await;
    let timeseries = new_timeseries();
    let (tx, mut rx) = asg_queue(8);

    let mut reconciler = Reconciler::with_stores(asgs, state, timeseries, tx, Duration::from_secs(30), 600);
    reconciler.open().await.unwrap();

    reconciler.tick().await;
    let first = rx.try_recv().expect("first cycle should scale up from zero");
    assert!(matches!(first, Action::Create { .. }));

    reconciler.tick().await;
    let second = rx.try_recv().expect("second cycle should still emit (even if Null)");
    assert_eq!(second, Action::Null, "cooldown should suppress further action this soon");
}
