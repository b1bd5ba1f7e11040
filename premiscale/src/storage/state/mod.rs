//! State DB interface (spec.md §6): semantic CRUD, adapter-agnostic. Two
//! provided implementations live alongside this trait: in-memory SQLite
//! (default, single-process) and MySQL (shared, multi-replica).

pub mod mysql;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::model::domain::PowerState;

#[derive(thiserror::Error, Debug)]
pub enum StateError {
    #[error("not connected")]
    NotConnected,
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("query failed: {0}")]
    Query(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostRecord {
    pub name: String,
    pub address: String,
    pub transport: String,
    pub port: u16,
    pub hypervisor: String,
    pub cpu_cores: u32,
    pub memory_bytes: u64,
    pub storage_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VmRecord {
    pub host: String,
    pub name: String,
    pub state: PowerState,
    pub asg: Option<String>,
}

/// Adapter-agnostic semantic CRUD surface (spec.md §6). Every method maps
/// 1:1 onto the source's `state._base` contract; concrete adapters hold a
/// mutex around each call (spec.md §5) so callers never need their own
/// external synchronization.
#[async_trait]
pub trait StateStore: Send + Sync {
    fn is_connected(&self) -> bool;
    async fn open(&mut self) -> Result<(), StateError>;
    async fn close(&mut self) -> Result<(), StateError>;
    async fn commit(&mut self) -> Result<(), StateError>;

    /// Idempotent schema bootstrap, run once at MetricsCollector startup
    /// (spec.md §4.2).
    async fn initialize(&mut self) -> Result<(), StateError>;

    async fn get_host(&self, name: &str, address: &str) -> Result<Option<HostRecord>, StateError>;
    async fn host_exists(&self, name: &str, address: &str) -> Result<bool, StateError>;
    async fn host_create(&mut self, host: &HostRecord) -> Result<(), StateError>;
    async fn host_update(&mut self, host: &HostRecord) -> Result<(), StateError>;
    async fn host_delete(&mut self, name: &str, address: &str) -> Result<(), StateError>;
    async fn host_report(&self) -> Result<Vec<HostRecord>, StateError>;

    async fn vm_create(&mut self, vm: &VmRecord) -> Result<(), StateError>;
    async fn vm_update(&mut self, vm: &VmRecord) -> Result<(), StateError>;
    async fn vm_delete(&mut self, host: &str, name: &str) -> Result<(), StateError>;
    async fn vm_report(&self, host: Option<&str>) -> Result<Vec<VmRecord>, StateError>;

    async fn asg_create(&mut self, name: &str) -> Result<(), StateError>;
    async fn asg_delete(&mut self, name: &str) -> Result<(), StateError>;
    async fn asg_add_vm(&mut self, asg: &str, host: &str, vm: &str) -> Result<(), StateError>;
    async fn asg_remove_vm(&mut self, asg: &str, host: &str, vm: &str) -> Result<(), StateError>;
    async fn get_asg_vms(&self, asg: &str, host: Option<&str>) -> Result<Vec<VmRecord>, StateError>;
    async fn asg_report(&self, vm_enabled: bool) -> Result<Vec<(String, Vec<VmRecord>)>, StateError>;
}

/// Dispatch from config's `controller.databases.state` to a concrete
/// adapter (spec.md design note 9's tagged-union construction pattern).
pub fn build(settings: &crate::configuration::StateSettings) -> Box<dyn StateStore> {
    use crate::configuration::StateSettings::*;
    match settings {
        Sqlite { connection } => Box::new(sqlite::SqliteStateStore::new(connection.clone())),
        Mysql { connection } => Box::new(mysql::MysqlStateStore::new(connection.clone())),
    }
}

/// One state store, mutex-guarded per call (spec.md §5), shared across the
/// Collector, Reconciler, and Dispatcher so all three observe the same
/// hosts/VMs/ASG membership rather than three private, disjoint stores.
pub type SharedStateStore = Arc<Mutex<Box<dyn StateStore>>>;

pub fn build_shared(settings: &crate::configuration::StateSettings) -> SharedStateStore {
    Arc::new(Mutex::new(build(settings)))
}
