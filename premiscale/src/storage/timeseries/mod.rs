//! Time-series DB interface (spec.md §6): write-mostly, with a trailing
//! retention window and a read path used by the Reconciler to compute
//! utilization deltas. Three provided adapters: in-memory (TinyFlux-shaped,
//! default), CSV-backed, and InfluxDB (spoken over line protocol via the
//! HTTP client already in the dependency stack, rather than pulling in an
//! unlisted `influxdb` crate).

pub mod influx;
pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use strum_macros::{Display, EnumString};
use tokio::sync::Mutex;

#[derive(thiserror::Error, Debug)]
pub enum TimeseriesError {
    #[error("not connected")]
    NotConnected,
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("query failed: {0}")]
    Query(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Measurement {
    Cpu,
    Memory,
    Net,
    Block,
}

/// One sample, mirroring the `(measurement, tags, fields, time)` shape the
/// source's TinyFlux/InfluxDB adapters both speak (spec.md §4.1/§4.2).
#[derive(Debug, Clone)]
pub struct Point {
    pub measurement: Measurement,
    pub host: String,
    pub vm: String,
    pub fields: HashMap<String, f64>,
    pub recorded_at: DateTime<Utc>,
}

impl Point {
    pub fn from_metrics_row(row: &crate::hypervisor::MetricsRow, recorded_at: DateTime<Utc>) -> Self {
        Point {
            measurement: row.measurement,
            host: row.host.clone(),
            vm: row.vm.clone(),
            fields: row.fields.clone(),
            recorded_at,
        }
    }
}

#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    fn is_connected(&self) -> bool;
    async fn open(&mut self) -> Result<(), TimeseriesError>;
    async fn close(&mut self) -> Result<(), TimeseriesError>;
    async fn commit(&mut self) -> Result<(), TimeseriesError>;

    async fn insert(&mut self, point: Point) -> Result<(), TimeseriesError>;
    async fn insert_batch(&mut self, points: Vec<Point>) -> Result<(), TimeseriesError>;

    /// Every point for `measurement` on `(host, vm)` collected at or after
    /// `since`, used by the Reconciler's utilization-delta computation
    /// (spec.md §4.3).
    async fn get_all(
        &self,
        measurement: Measurement,
        host: &str,
        vm: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Point>, TimeseriesError>;

    async fn clear(&mut self) -> Result<(), TimeseriesError>;

    /// Drop points older than `trailing_secs` (the only retention policy
    /// this system runs, spec.md §6 `timeseries.trailing`).
    async fn run_retention_policy(&mut self, trailing_secs: u64) -> Result<(), TimeseriesError>;
}

/// Dispatch from config's `controller.databases.timeseries` to a concrete
/// adapter.
pub fn build(settings: &crate::configuration::TimeseriesSettings) -> Box<dyn TimeSeriesStore> {
    use crate::configuration::TimeseriesSettings::*;
    match settings {
        Memory { .. } => Box::new(memory::MemoryTimeSeriesStore::new()),
        Csv { dbfile, .. } => Box::new(memory::MemoryTimeSeriesStore::with_csv_mirror(dbfile.clone())),
        Influxdb { connection, .. } => Box::new(influx::InfluxTimeSeriesStore::new(connection.clone())),
    }
}

/// One time-series store, mutex-guarded per call (spec.md §5), shared
/// between the Collector (writer) and the Reconciler (reader) so the
/// Reconciler actually sees what the Collector just wrote.
pub type SharedTimeSeriesStore = Arc<Mutex<Box<dyn TimeSeriesStore>>>;

pub fn build_shared(settings: &crate::configuration::TimeseriesSettings) -> SharedTimeSeriesStore {
    Arc::new(Mutex::new(build(settings)))
}
