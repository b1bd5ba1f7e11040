//! In-memory SQLite `StateStore` — the default, single-process backend.
//! Matches the teacher's `sqlx::query`/`Row::get` style in
//! `qarax::model::hosts` rather than the compile-time-checked `query_as!`
//! macros, since those require a live database at build time.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use crate::model::domain::PowerState;

use super::{HostRecord, StateError, StateStore, VmRecord};

pub struct SqliteStateStore {
    connection: String,
    pool: Option<SqlitePool>,
}

impl SqliteStateStore {
    pub fn new(connection: Option<String>) -> Self {
        SqliteStateStore { connection: connection.unwrap_or_else(|| ":memory:".to_string()), pool: None }
    }

    fn pool(&self) -> Result<&SqlitePool, StateError> {
        self.pool.as_ref().ok_or(StateError::NotConnected)
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    fn is_connected(&self) -> bool {
        self.pool.is_some()
    }

    async fn open(&mut self) -> Result<(), StateError> {
        if self.pool.is_some() {
            return Ok(());
        }
        // A single shared pool now serves the Collector, Reconciler, and
        // Dispatcher concurrently; for the default `:memory:` connection
        // an idle-reaped connection would drop the whole in-memory
        // database out from under the other components, so pin exactly
        // one live connection open for the pool's lifetime.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .connect(&format!("sqlite:{}", self.connection))
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;
        self.pool = Some(pool);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StateError> {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StateError> {
        // SQLite autocommits each statement in this adapter; nothing to flush.
        Ok(())
    }

    async fn initialize(&mut self) -> Result<(), StateError> {
        let pool = self.pool()?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hosts (
                name TEXT NOT NULL,
                address TEXT NOT NULL,
                transport TEXT NOT NULL,
                port INTEGER NOT NULL,
                hypervisor TEXT NOT NULL,
                cpu_cores INTEGER NOT NULL,
                memory_bytes INTEGER NOT NULL,
                storage_bytes INTEGER NOT NULL,
                PRIMARY KEY (name, address)
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| StateError::Query(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vms (
                host TEXT NOT NULL,
                name TEXT NOT NULL,
                state TEXT NOT NULL,
                asg TEXT,
                PRIMARY KEY (host, name)
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| StateError::Query(e.to_string()))?;

        sqlx::query("CREATE TABLE IF NOT EXISTS asgs (name TEXT PRIMARY KEY)")
            .execute(pool)
            .await
            .map_err(|e| StateError::Query(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS asg_vms (
                asg TEXT NOT NULL,
                host TEXT NOT NULL,
                vm TEXT NOT NULL,
                PRIMARY KEY (asg, host, vm)
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| StateError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_host(&self, name: &str, address: &str) -> Result<Option<HostRecord>, StateError> {
        let pool = self.pool()?;
        let row = sqlx::query(
            "SELECT name, address, transport, port, hypervisor, cpu_cores, memory_bytes, storage_bytes \
             FROM hosts WHERE name = ?1 AND address = ?2",
        )
        .bind(name)
        .bind(address)
        .fetch_optional(pool)
        .await
        .map_err(|e| StateError::Query(e.to_string()))?;

        Ok(row.map(row_to_host))
    }

    async fn host_exists(&self, name: &str, address: &str) -> Result<bool, StateError> {
        Ok(self.get_host(name, address).await?.is_some())
    }

    async fn host_create(&mut self, host: &HostRecord) -> Result<(), StateError> {
        let pool = self.pool()?;
        sqlx::query(
            "INSERT INTO hosts (name, address, transport, port, hypervisor, cpu_cores, memory_bytes, storage_bytes) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&host.name)
        .bind(&host.address)
        .bind(&host.transport)
        .bind(host.port as i64)
        .bind(&host.hypervisor)
        .bind(host.cpu_cores as i64)
        .bind(host.memory_bytes as i64)
        .bind(host.storage_bytes as i64)
        .execute(pool)
        .await
        .map_err(|e| StateError::Query(e.to_string()))?;
        Ok(())
    }

    async fn host_update(&mut self, host: &HostRecord) -> Result<(), StateError> {
        let pool = self.pool()?;
        sqlx::query(
            "UPDATE hosts SET transport = ?1, port = ?2, hypervisor = ?3, cpu_cores = ?4, \
             memory_bytes = ?5, storage_bytes = ?6 WHERE name = ?7 AND address = ?8",
        )
        .bind(&host.transport)
        .bind(host.port as i64)
        .bind(&host.hypervisor)
        .bind(host.cpu_cores as i64)
        .bind(host.memory_bytes as i64)
        .bind(host.storage_bytes as i64)
        .bind(&host.name)
        .bind(&host.address)
        .execute(pool)
        .await
        .map_err(|e| StateError::Query(e.to_string()))?;
        Ok(())
    }

    async fn host_delete(&mut self, name: &str, address: &str) -> Result<(), StateError> {
        let pool = self.pool()?;
        sqlx::query("DELETE FROM hosts WHERE name = ?1 AND address = ?2")
            .bind(name)
            .bind(address)
            .execute(pool)
            .await
            .map_err(|e| StateError::Query(e.to_string()))?;
        Ok(())
    }

    async fn host_report(&self) -> Result<Vec<HostRecord>, StateError> {
        let pool = self.pool()?;
        let rows = sqlx::query(
            "SELECT name, address, transport, port, hypervisor, cpu_cores, memory_bytes, storage_bytes FROM hosts",
        )
        .fetch_all(pool)
        .await
        .map_err(|e| StateError::Query(e.to_string()))?;
        Ok(rows.into_iter().map(row_to_host).collect())
    }

    async fn vm_create(&mut self, vm: &VmRecord) -> Result<(), StateError> {
        if !self.host_exists(&vm.host, &vm.host).await.unwrap_or(false)
            && self.get_host_by_name(&vm.host).await?.is_none()
        {
            return Err(StateError::Query(format!(
                "vm_create: host {} does not exist (invariant violation)",
                vm.host
            )));
        }
        let pool = self.pool()?;
        sqlx::query(
            "INSERT INTO vms (host, name, state, asg) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(host, name) DO UPDATE SET state = excluded.state, asg = excluded.asg",
        )
        .bind(&vm.host)
        .bind(&vm.name)
        .bind(vm.state.to_string())
        .bind(&vm.asg)
        .execute(pool)
        .await
        .map_err(|e| StateError::Query(e.to_string()))?;
        Ok(())
    }

    async fn vm_update(&mut self, vm: &VmRecord) -> Result<(), StateError> {
        let pool = self.pool()?;
        sqlx::query("UPDATE vms SET state = ?1, asg = ?2 WHERE host = ?3 AND name = ?4")
            .bind(vm.state.to_string())
            .bind(&vm.asg)
            .bind(&vm.host)
            .bind(&vm.name)
            .execute(pool)
            .await
            .map_err(|e| StateError::Query(e.to_string()))?;
        Ok(())
    }

    async fn vm_delete(&mut self, host: &str, name: &str) -> Result<(), StateError> {
        let pool = self.pool()?;
        sqlx::query("DELETE FROM vms WHERE host = ?1 AND name = ?2")
            .bind(host)
            .bind(name)
            .execute(pool)
            .await
            .map_err(|e| StateError::Query(e.to_string()))?;
        Ok(())
    }

    async fn vm_report(&self, host: Option<&str>) -> Result<Vec<VmRecord>, StateError> {
        let pool = self.pool()?;
        let rows = match host {
            Some(h) => sqlx::query("SELECT host, name, state, asg FROM vms WHERE host = ?1")
                .bind(h)
                .fetch_all(pool)
                .await,
            None => sqlx::query("SELECT host, name, state, asg FROM vms").fetch_all(pool).await,
        }
        .map_err(|e| StateError::Query(e.to_string()))?;
        Ok(rows.into_iter().map(row_to_vm).collect())
    }

    async fn asg_create(&mut self, name: &str) -> Result<(), StateError> {
        let pool = self.pool()?;
        sqlx::query("INSERT OR IGNORE INTO asgs (name) VALUES (?1)")
            .bind(name)
            .execute(pool)
            .await
            .map_err(|e| StateError::Query(e.to_string()))?;
        Ok(())
    }

    async fn asg_delete(&mut self, name: &str) -> Result<(), StateError> {
        let pool = self.pool()?;
        sqlx::query("DELETE FROM asg_vms WHERE asg = ?1").bind(name).execute(pool).await.ok();
        sqlx::query("DELETE FROM asgs WHERE name = ?1")
            .bind(name)
            .execute(pool)
            .await
            .map_err(|e| StateError::Query(e.to_string()))?;
        Ok(())
    }

    async fn asg_add_vm(&mut self, asg: &str, host: &str, vm: &str) -> Result<(), StateError> {
        let pool = self.pool()?;
        sqlx::query("INSERT OR IGNORE INTO asg_vms (asg, host, vm) VALUES (?1, ?2, ?3)")
            .bind(asg)
            .bind(host)
            .bind(vm)
            .execute(pool)
            .await
            .map_err(|e| StateError::Query(e.to_string()))?;
        Ok(())
    }

    async fn asg_remove_vm(&mut self, asg: &str, host: &str, vm: &str) -> Result<(), StateError> {
        let pool = self.pool()?;
        sqlx::query("DELETE FROM asg_vms WHERE asg = ?1 AND host = ?2 AND vm = ?3")
            .bind(asg)
            .bind(host)
            .bind(vm)
            .execute(pool)
            .await
            .map_err(|e| StateError::Query(e.to_string()))?;
        Ok(())
    }

    async fn get_asg_vms(&self, asg: &str, host: Option<&str>) -> Result<Vec<VmRecord>, StateError> {
        let pool = self.pool()?;
        let rows = match host {
            Some(h) => sqlx::query(
                "SELECT v.host, v.name, v.state, v.asg FROM vms v \
                 JOIN asg_vms a ON a.host = v.host AND a.vm = v.name \
                 WHERE a.asg = ?1 AND v.host = ?2",
            )
            .bind(asg)
            .bind(h)
            .fetch_all(pool)
            .await,
            None => sqlx::query(
                "SELECT v.host, v.name, v.state, v.asg FROM vms v \
                 JOIN asg_vms a ON a.host = v.host AND a.vm = v.name \
                 WHERE a.asg = ?1",
            )
            .bind(asg)
            .fetch_all(pool)
            .await,
        }
        .map_err(|e| StateError::Query(e.to_string()))?;
        Ok(rows.into_iter().map(row_to_vm).collect())
    }

    async fn asg_report(&self, vm_enabled: bool) -> Result<Vec<(String, Vec<VmRecord>)>, StateError> {
        let pool = self.pool()?;
        let names: Vec<String> = sqlx::query("SELECT name FROM asgs")
            .fetch_all(pool)
            .await
            .map_err(|e| StateError::Query(e.to_string()))?
            .into_iter()
            .map(|r| r.get::<String, _>("name"))
            .collect();

        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let vms = if vm_enabled { self.get_asg_vms(&name, None).await? } else { Vec::new() };
            out.push((name, vms));
        }
        Ok(out)
    }
}

impl SqliteStateStore {
    async fn get_host_by_name(&self, name: &str) -> Result<Option<HostRecord>, StateError> {
        let pool = self.pool()?;
        let row = sqlx::query(
            "SELECT name, address, transport, port, hypervisor, cpu_cores, memory_bytes, storage_bytes \
             FROM hosts WHERE name = ?1 LIMIT 1",
        )
        .bind(name)
        .fetch_optional(pool)
        .await
        .map_err(|e| StateError::Query(e.to_string()))?;
        Ok(row.map(row_to_host))
    }
}

fn row_to_host(row: sqlx::sqlite::SqliteRow) -> HostRecord {
    HostRecord {
        name: row.get("name"),
        address: row.get("address"),
        transport: row.get("transport"),
        port: row.get::<i64, _>("port") as u16,
        hypervisor: row.get("hypervisor"),
        cpu_cores: row.get::<i64, _>("cpu_cores") as u32,
        memory_bytes: row.get::<i64, _>("memory_bytes") as u64,
        storage_bytes: row.get::<i64, _>("storage_bytes") as u64,
    }
}

fn row_to_vm(row: sqlx::sqlite::SqliteRow) -> VmRecord {
    let state: String = row.get("state");
    VmRecord {
        host: row.get("host"),
        name: row.get("name"),
        state: PowerState::from_str(&state).unwrap_or(PowerState::NoState),
        asg: row.get("asg"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(name: &str) -> HostRecord {
        HostRecord {
            name: name.to_string(),
            address: "10.0.0.2".to_string(),
            transport: "ssh".to_string(),
            port: 22,
            hypervisor: "kvm".to_string(),
            cpu_cores: 8,
            memory_bytes: 1 << 34,
            storage_bytes: 1 << 40,
        }
    }

    async fn opened_store() -> SqliteStateStore {
        let mut store = SqliteStateStore::new(None);
        store.open().await.unwrap();
        store.initialize().await.unwrap();
        store
    }

    #[tokio::test]
    async fn host_exists_after_create() {
        let mut store = opened_store().await;
        store.host_create(&host("h1")).await.unwrap();
        assert!(store.host_exists("h1", "10.0.0.2").await.unwrap());
    }

    #[tokio::test]
    async fn vm_create_requires_existing_host() {
        let mut store = opened_store().await;
        let vm = VmRecord { host: "ghost".into(), name: "vm1".into(), state: PowerState::Running, asg: None };
        assert!(store.vm_create(&vm).await.is_err());
    }

    #[tokio::test]
    async fn asg_report_lists_members_when_enabled() {
        let mut store = opened_store().await;
        store.host_create(&host("h1")).await.unwrap();
        let vm = VmRecord { host: "h1".into(), name: "vm1".into(), state: PowerState::Running, asg: Some("g1".into()) };
        store.vm_create(&vm).await.unwrap();
        store.asg_create("g1").await.unwrap();
        store.asg_add_vm("g1", "h1", "vm1").await.unwrap();

        let report = store.asg_report(true).await.unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].0, "g1");
        assert_eq!(report[0].1.len(), 1);
    }

    #[tokio::test]
    async fn double_initialize_is_idempotent() {
        let mut store = opened_store().await;
        store.initialize().await.unwrap();
    }
}
