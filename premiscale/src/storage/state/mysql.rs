//! MySQL `StateStore` — the shared, multi-replica backend (spec.md §6).
//! Supplemented from `premiscale/premiscale/mysql.py` in the original
//! source: a second replica-safe backend behind the same trait surface as
//! the default SQLite one, so a controller fleet can share state.

use async_trait::async_trait;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySqlPool, Row};
use std::str::FromStr;

use crate::model::domain::PowerState;

use super::{HostRecord, StateError, StateStore, VmRecord};

pub struct MysqlStateStore {
    connection: String,
    pool: Option<MySqlPool>,
}

impl MysqlStateStore {
    pub fn new(connection: String) -> Self {
        MysqlStateStore { connection, pool: None }
    }

    fn pool(&self) -> Result<&MySqlPool, StateError> {
        self.pool.as_ref().ok_or(StateError::NotConnected)
    }
}

#[async_trait]
impl StateStore for MysqlStateStore {
    fn is_connected(&self) -> bool {
        self.pool.is_some()
    }

    async fn open(&mut self) -> Result<(), StateError> {
        if self.pool.is_some() {
            return Ok(());
        }
        let pool = MySqlPoolOptions::new()
            .max_connections(8)
            .connect(&self.connection)
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
        // Each call above runs as its own autocommitted statement against
        // the pool; there is no open transaction to flush here.
        Ok(())
    }

    async fn initialize(&mut self) -> Result<(), StateError> {
        let pool = self.pool()?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hosts (
                name VARCHAR(255) NOT NULL,
                address VARCHAR(255) NOT NULL,
                transport VARCHAR(16) NOT NULL,
                port INT UNSIGNED NOT NULL,
                hypervisor VARCHAR(16) NOT NULL,
                cpu_cores INT UNSIGNED NOT NULL,
                memory_bytes BIGINT UNSIGNED NOT NULL,
                storage_bytes BIGINT UNSIGNED NOT NULL,
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
                host VARCHAR(255) NOT NULL,
                name VARCHAR(255) NOT NULL,
                state VARCHAR(32) NOT NULL,
                asg VARCHAR(255) NULL,
                PRIMARY KEY (host, name)
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| StateError::Query(e.to_string()))?;

        sqlx::query("CREATE TABLE IF NOT EXISTS asgs (name VARCHAR(255) PRIMARY KEY)")
            .execute(pool)
            .await
            .map_err(|e| StateError::Query(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS asg_vms (
                asg VARCHAR(255) NOT NULL,
                host VARCHAR(255) NOT NULL,
                vm VARCHAR(255) NOT NULL,
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
             FROM hosts WHERE name = ? AND address = ?",
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
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&host.name)
        .bind(&host.address)
        .bind(&host.transport)
        .bind(host.port)
        .bind(&host.hypervisor)
        .bind(host.cpu_cores)
        .bind(host.memory_bytes)
        .bind(host.storage_bytes)
        .execute(pool)
        .await
        .map_err(|e| StateError::Query(e.to_string()))?;
        Ok(())
    }

    async fn host_update(&mut self, host: &HostRecord) -> Result<(), StateError> {
        let pool = self.pool()?;
        sqlx::query(
            "UPDATE hosts SET transport = ?, port = ?, hypervisor = ?, cpu_cores = ?, \
             memory_bytes = ?, storage_bytes = ? WHERE name = ? AND address = ?",
        )
        .bind(&host.transport)
        .bind(host.port)
        .bind(&host.hypervisor)
        .bind(host.cpu_cores)
        .bind(host.memory_bytes)
        .bind(host.storage_bytes)
        .bind(&host.name)
        .bind(&host.address)
        .execute(pool)
        .await
        .map_err(|e| StateError::Query(e.to_string()))?;
        Ok(())
    }

    async fn host_delete(&mut self, name: &str, address: &str) -> Result<(), StateError> {
        let pool = self.pool()?;
        sqlx::query("DELETE FROM hosts WHERE name = ? AND address = ?")
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
        if self.get_host_by_name(&vm.host).await?.is_none() {
            return Err(StateError::Query(format!(
                "vm_create: host {} does not exist (invariant violation)",
                vm.host
            )));
        }
        let pool = self.pool()?;
        sqlx::query(
            "INSERT INTO vms (host, name, state, asg) VALUES (?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE state = VALUES(state), asg = VALUES(asg)",
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
        sqlx::query("UPDATE vms SET state = ?, asg = ? WHERE host = ? AND name = ?")
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
        sqlx::query("DELETE FROM vms WHERE host = ? AND name = ?")
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
            Some(h) => sqlx::query("SELECT host, name, state, asg FROM vms WHERE host = ?")
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
        sqlx::query("INSERT IGNORE INTO asgs (name) VALUES (?)")
            .bind(name)
            .execute(pool)
            .await
            .map_err(|e| StateError::Query(e.to_string()))?;
        Ok(())
    }

    async fn asg_delete(&mut self, name: &str) -> Result<(), StateError> {
        let pool = self.pool()?;
        sqlx::query("DELETE FROM asg_vms WHERE asg = ?").bind(name).execute(pool).await.ok();
        sqlx::query("DELETE FROM asgs WHERE name = ?")
            .bind(name)
            .execute(pool)
            .await
            .map_err(|e| StateError::Query(e.to_string()))?;
        Ok(())
    }

    async fn asg_add_vm(&mut self, asg: &str, host: &str, vm: &str) -> Result<(), StateError> {
        let pool = self.pool()?;
        sqlx::query("INSERT IGNORE INTO asg_vms (asg, host, vm) VALUES (?, ?, ?)")
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
        sqlx::query("DELETE FROM asg_vms WHERE asg = ? AND host = ? AND vm = ?")
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
                 WHERE a.asg = ? AND v.host = ?",
            )
            .bind(asg)
            .bind(h)
            .fetch_all(pool)
            .await,
            None => sqlx::query(
                "SELECT v.host, v.name, v.state, v.asg FROM vms v \
                 JOIN asg_vms a ON a.host = v.host AND a.vm = v.name \
                 WHERE a.asg = ?",
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

impl MysqlStateStore {
    async fn get_host_by_name(&self, name: &str) -> Result<Option<HostRecord>, StateError> {
        let pool = self.pool()?;
        let row = sqlx::query(
            "SELECT name, address, transport, port, hypervisor, cpu_cores, memory_bytes, storage_bytes \
             FROM hosts WHERE name = ? LIMIT 1",
        )
        .bind(name)
        .fetch_optional(pool)
        .await
        .map_err(|e| StateError::Query(e.to_string()))?;
        Ok(row.map(row_to_host))
    }
}

fn row_to_host(row: sqlx::mysql::MySqlRow) -> HostRecord {
    HostRecord {
        name: row.get("name"),
        address: row.get("address"),
        transport: row.get("transport"),
        port: row.get::<u32, _>("port") as u16,
        hypervisor: row.get("hypervisor"),
        cpu_cores: row.get("cpu_cores"),
        memory_bytes: row.get("memory_bytes"),
        storage_bytes: row.get("storage_bytes"),
    }
}

fn row_to_vm(row: sqlx::mysql::MySqlRow) -> VmRecord {
    let state: String = row.get("state");
    VmRecord {
        host: row.get("host"),
        name: row.get("name"),
        state: PowerState::from_str(&state).unwrap_or(PowerState::NoState),
        asg: row.get("asg"),
    }
}

// No `#[tokio::test]`s against a live MySQL server here; integration
// coverage for this adapter lives in tests/ behind a feature flag that
// points at a running instance. The SQLite adapter's in-memory tests
// exercise the shared `StateStore` contract instead.
