//! `@retry_connection(n=3)` wrapper (spec.md §4.1): detects a dropped
//! connection, reopens it, and after `n` failures returns a typed
//! `Unavailable` result rather than throwing into the scheduler. Also
//! memoizes `get_host_stats`/`get_host_vm_stats` for a small TTL to dedupe
//! repeated calls within one collection cycle.

use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::warn;

use crate::model::domain::DomainStats;

use super::{ConnectError, ConnectionState, HostStats, HypervisorConnection};

const DEFAULT_MEMO_TTL: Duration = Duration::from_secs(5);

pub struct ManagedConnection<C: HypervisorConnection> {
    inner: C,
    retries: u32,
    memo_ttl: Duration,
    cached_host_stats: Option<(Instant, HostStats)>,
    cached_vm_stats: Option<(Instant, Vec<DomainStats>)>,
}

impl<C: HypervisorConnection> ManagedConnection<C> {
    pub fn new(inner: C, retries: u32) -> Self {
        ManagedConnection {
            inner,
            retries,
            memo_ttl: DEFAULT_MEMO_TTL,
            cached_host_stats: None,
            cached_vm_stats: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    async fn reopen(&mut self) -> Result<(), ConnectError> {
        self.inner.close().await;
        self.inner.open(true).await
    }

    /// Run `op` against the inner connection, reopening once per attempt if
    /// the connection looks degraded, up to `self.retries` attempts total.
    async fn with_retry<T, F>(&mut self, mut op: F) -> Result<T, ConnectError>
    where
        F: for<'a> FnMut(&'a mut C) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<T, ConnectError>> + Send + 'a>>,
    {
        let mut last_err = None;
        for attempt in 0..self.retries.max(1) {
            if self.inner.state() != ConnectionState::Open {
                if let Err(e) = self.reopen().await {
                    last_err = Some(e);
                    let backoff = Duration::from_millis(200 * 2u64.pow(attempt));
                    sleep(backoff).await;
                    continue;
                }
            }
            match op(&mut self.inner).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    warn!("hypervisor operation failed (attempt {}/{}): {}", attempt + 1, self.retries, e);
                    last_err = Some(e);
                }
            }
        }
        Err(ConnectError::Unavailable(
            last_err.map(|e| e.to_string()).unwrap_or_else(|| "unknown error".into()),
        ))
    }

    pub async fn open(&mut self, readonly: bool) -> Result<(), ConnectError> {
        self.inner.open(readonly).await
    }

    pub async fn close(&mut self) {
        self.inner.close().await;
    }

    pub async fn get_host_stats(&mut self) -> Result<HostStats, ConnectError> {
        if let Some((at, stats)) = &self.cached_host_stats {
            if at.elapsed() < self.memo_ttl {
                return Ok(stats.clone());
            }
        }
        let stats = self.with_retry(|c| Box::pin(c.get_host_stats())).await?;
        self.cached_host_stats = Some((Instant::now(), stats.clone()));
        Ok(stats)
    }

    pub async fn get_host_vm_stats(&mut self) -> Result<Vec<DomainStats>, ConnectError> {
        if let Some((at, stats)) = &self.cached_vm_stats {
            if at.elapsed() < self.memo_ttl {
                return Ok(stats.clone());
            }
        }
        let stats = self.with_retry(|c| Box::pin(c.get_host_vm_stats())).await?;
        self.cached_vm_stats = Some((Instant::now(), stats.clone()));
        Ok(stats)
    }

    pub async fn create_domain(&mut self, spec: &super::DomainCreateSpec) -> Result<(), ConnectError> {
        self.with_retry(|c| Box::pin(c.create_domain(spec))).await
    }

    pub async fn clone_domain(&mut self, source: &str, dest: &str) -> Result<(), ConnectError> {
        self.with_retry(|c| Box::pin(c.clone_domain(source, dest))).await
    }

    pub async fn migrate_domain(&mut self, vm: &str, dest_uri: &str) -> Result<(), ConnectError> {
        self.with_retry(|c| Box::pin(c.migrate_domain(vm, dest_uri))).await
    }

    pub async fn delete_domain(&mut self, vm: &str, reclaim_storage: bool) -> Result<(), ConnectError> {
        self.with_retry(|c| Box::pin(c.delete_domain(vm, reclaim_storage))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::domain::PowerState;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FlakyConnection {
        state: ConnectionState,
        open_calls: Arc<AtomicUsize>,
        stats_calls: Arc<AtomicUsize>,
        fail_opens: usize,
    }

    #[async_trait]
    impl HypervisorConnection for FlakyConnection {
        fn state(&self) -> ConnectionState {
            self.state
        }

        async fn open(&mut self, _readonly: bool) -> Result<(), ConnectError> {
            let n = self.open_calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_opens {
                return Err(ConnectError::Transport("h1".into(), "refused".into()));
            }
            self.state = ConnectionState::Open;
            Ok(())
        }

        async fn close(&mut self) {
            self.state = ConnectionState::Closed;
        }

        async fn get_host_stats(&mut self) -> Result<HostStats, ConnectError> {
            self.stats_calls.fetch_add(1, Ordering::SeqCst);
            Ok(HostStats {
                hostname: "h1".into(),
                hypervisor_kind: "kvm".into(),
                hypervisor_version: "1.0".into(),
                uri: "qemu+ssh://h1/system".into(),
                capabilities: String::new(),
                max_vcpus: 8,
                free_memory_bytes: 0,
                node_memory_stats: Default::default(),
                node_cpu_stats: Default::default(),
                domains: Vec::new(),
            })
        }

        async fn get_host_vm_stats(&mut self) -> Result<Vec<DomainStats>, ConnectError> {
            Ok(vec![DomainStats::new("h1", "vm1", PowerState::Running)])
        }

        async fn create_domain(&mut self, _spec: &super::super::DomainCreateSpec) -> Result<(), ConnectError> {
            Ok(())
        }
        async fn clone_domain(&mut self, _source: &str, _dest: &str) -> Result<(), ConnectError> {
            Ok(())
        }
        async fn migrate_domain(&mut self, _vm: &str, _dest_uri: &str) -> Result<(), ConnectError> {
            Ok(())
        }
        async fn delete_domain(&mut self, _vm: &str, _reclaim_storage: bool) -> Result<(), ConnectError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn retries_reopen_after_transient_failure() {
        let open_calls = Arc::new(AtomicUsize::new(0));
        let conn = FlakyConnection {
            state: ConnectionState::Degraded,
            open_calls: open_calls.clone(),
            stats_calls: Arc::new(AtomicUsize::new(0)),
            fail_opens: 2,
        };
        let mut managed = ManagedConnection::new(conn, 3);
        let result = managed.get_host_stats().await;
        assert!(result.is_ok());
        assert_eq!(open_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_return_unavailable_not_panic() {
        let conn = FlakyConnection {
            state: ConnectionState::Degraded,
            open_calls: Arc::new(AtomicUsize::new(0)),
            stats_calls: Arc::new(AtomicUsize::new(0)),
            fail_opens: 100,
        };
        let mut managed = ManagedConnection::new(conn, 3);
        let result = managed.get_host_stats().await;
        assert!(matches!(result, Err(ConnectError::Unavailable(_))));
    }

    #[tokio::test]
    async fn memoized_stats_avoid_second_call_within_ttl() {
        let stats_calls = Arc::new(AtomicUsize::new(0));
        let conn = FlakyConnection {
            state: ConnectionState::Open,
            open_calls: Arc::new(AtomicUsize::new(0)),
            stats_calls: stats_calls.clone(),
            fail_opens: 0,
        };
        let mut managed = ManagedConnection::new(conn, 3);
        managed.get_host_stats().await.unwrap();
        managed.get_host_stats().await.unwrap();
        assert_eq!(stats_calls.load(Ordering::SeqCst), 1);
    }
}
