//! Connection Pool
//!
//! 연결 풀링
//!
//! A deliberately small pool: bounded size, per-server idle queues, borrow
//! with deadline and liveness threshold, lazy reset on release. Fancier
//! queueing and background eviction live outside this crate; the session
//! only needs the contract implemented here.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::bolt::BoltIo;

use super::connection::{Connection, ConnectionState};
use super::error::{DriverError, DriverResult};

// ============================================================================
// Connect - 커넥터 인터페이스
// ============================================================================

/// Produces authenticated connections to a server address.
///
/// The production connector dials TCP, runs the handshake and HELLO; tests
/// substitute scripted connections.
pub trait Connect: Send + Sync {
    /// Channel type of produced connections
    type Io: BoltIo + 'static;

    /// Open and authenticate a connection to `address`.
    fn connect(
        &self,
        address: &str,
    ) -> impl Future<Output = DriverResult<Connection<Self::Io>>> + Send;
}

// ============================================================================
// PoolConfig - 풀 설정
// ============================================================================

/// 연결 풀 설정
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// 최대 연결 수
    pub max_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_size: 100 }
    }
}

// ============================================================================
// ConnectionPool - 연결 풀
// ============================================================================

struct Idle<IO: BoltIo> {
    connection: Connection<IO>,
    since: Instant,
}

/// 연결 풀
pub struct ConnectionPool<C: Connect> {
    connector: C,
    config: PoolConfig,
    idle: Mutex<HashMap<String, VecDeque<Idle<C::Io>>>>,
    /// 크기 제한 세마포어
    semaphore: Arc<Semaphore>,
    /// 대여 중인 연결 수
    borrowed: AtomicUsize,
}

impl<C: Connect> ConnectionPool<C> {
    /// 새 풀 생성
    pub fn new(connector: C, config: PoolConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_size.max(1)));
        Self {
            connector,
            config,
            idle: Mutex::new(HashMap::new()),
            semaphore,
            borrowed: AtomicUsize::new(0),
        }
    }

    /// Borrow a connection to one of `servers`, tried in order.
    ///
    /// `acquisition_timeout` bounds the wait for pool capacity and the
    /// dialing; `None` waits forever. An idle connection older than
    /// `liveness_threshold` is probed with RESET before being handed out.
    pub async fn borrow(
        &self,
        servers: &[String],
        acquisition_timeout: Option<Duration>,
        liveness_threshold: Duration,
    ) -> DriverResult<Connection<C::Io>> {
        if servers.is_empty() {
            return Err(DriverError::connectivity("no server available"));
        }

        let borrow = self.borrow_inner(servers, liveness_threshold);
        let connection = match acquisition_timeout {
            Some(limit) => tokio::time::timeout(limit, borrow)
                .await
                .map_err(|_| DriverError::timeout("connection acquisition timed out"))??,
            None => borrow.await?,
        };

        self.borrowed.fetch_add(1, Ordering::SeqCst);
        Ok(connection)
    }

    async fn borrow_inner(
        &self,
        servers: &[String],
        liveness_threshold: Duration,
    ) -> DriverResult<Connection<C::Io>> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| DriverError::connectivity("pool is closed"))?;
        permit.forget();

        match self.pick_connection(servers, liveness_threshold).await {
            Ok(connection) => Ok(connection),
            Err(err) => {
                self.semaphore.add_permits(1);
                Err(err)
            }
        }
    }

    async fn pick_connection(
        &self,
        servers: &[String],
        liveness_threshold: Duration,
    ) -> DriverResult<Connection<C::Io>> {
        // Reuse an idle connection when one is healthy
        for server in servers {
            while let Some(idle) = self.pop_idle(server) {
                let mut connection = idle.connection;
                if idle.since.elapsed() >= liveness_threshold {
                    if connection.force_reset().await.is_err() {
                        tracing::debug!(server = %server, "evicting idle connection that failed liveness check");
                        connection.close().await;
                        continue;
                    }
                }
                if connection.state() == ConnectionState::Ready {
                    return Ok(connection);
                }
                connection.close().await;
            }
        }

        // Nothing idle; dial the servers in order
        let mut last_err = None;
        for server in servers {
            match self.connector.connect(server).await {
                Ok(connection) => return Ok(connection),
                Err(err) => {
                    tracing::debug!(server = %server, error = %err, "connect failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| DriverError::connectivity("no server available")))
    }

    fn pop_idle(&self, server: &str) -> Option<Idle<C::Io>> {
        self.idle.lock().get_mut(server)?.pop_front()
    }

    /// Return a borrowed connection.
    ///
    /// Dead connections are closed and dropped. A connection left mid-work
    /// or failed is reset lazily here; only a connection that comes back
    /// `Ready` is re-idled.
    pub async fn release(&self, mut connection: Connection<C::Io>) {
        self.borrowed.fetch_sub(1, Ordering::SeqCst);
        self.semaphore.add_permits(1);

        if connection.state() != ConnectionState::Ready {
            if connection.reset().await.is_err()
                || connection.state() != ConnectionState::Ready
            {
                tracing::debug!(server = %connection.server_name(), "dropping unrecoverable connection");
                connection.close().await;
                return;
            }
        }

        connection.clear_bookmark();
        let server = connection.server_name().to_string();
        self.idle.lock().entry(server).or_default().push_back(Idle {
            connection,
            since: Instant::now(),
        });
    }

    /// 유휴 연결 전부 정리
    pub async fn clean_up(&self) -> DriverResult<()> {
        let drained: Vec<Idle<C::Io>> = {
            let mut idle = self.idle.lock();
            idle.drain().flat_map(|(_, queue)| queue).collect()
        };
        for mut idle in drained {
            idle.connection.close().await;
        }
        Ok(())
    }

    /// 대여 중인 연결 수
    pub fn in_use(&self) -> usize {
        self.borrowed.load(Ordering::SeqCst)
    }

    /// 유휴 연결 수
    pub fn idle_count(&self) -> usize {
        self.idle.lock().values().map(VecDeque::len).sum()
    }

    /// 풀 설정
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

impl<C: Connect> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("max_size", &self.config.max_size)
            .field("in_use", &self.in_use())
            .field("idle", &self.idle_count())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::{success_empty, ScriptConnect};

    fn servers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_borrow_and_release() {
        let connector = ScriptConnect::new();
        connector.push_script(vec![]);
        let pool = ConnectionPool::new(connector, PoolConfig::default());

        let connection = pool
            .borrow(&servers(&["srv1"]), None, Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(pool.in_use(), 1);
        assert_eq!(connection.server_name(), "srv1");

        pool.release(connection).await;
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_borrow_reuses_idle() {
        let connector = ScriptConnect::new();
        connector.push_script(vec![]);
        let pool = ConnectionPool::new(connector, PoolConfig::default());

        let connection = pool
            .borrow(&servers(&["srv1"]), None, Duration::from_secs(300))
            .await
            .unwrap();
        pool.release(connection).await;

        // No second script was pushed: reuse is the only way this succeeds
        let connection = pool
            .borrow(&servers(&["srv1"]), None, Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.idle_count(), 0);
        pool.release(connection).await;
    }

    #[tokio::test]
    async fn test_release_drops_dead_connection() {
        let connector = ScriptConnect::new();
        connector.push_script(vec![]);
        let pool = ConnectionPool::new(connector, PoolConfig::default());

        let mut connection = pool
            .borrow(&servers(&["srv1"]), None, Duration::from_secs(300))
            .await
            .unwrap();
        // Exhausting the script kills the connection on next receive
        let _ = connection
            .run(
                crate::driver::connection::Command::new("RETURN 1"),
                Default::default(),
            )
            .await;
        assert!(!connection.is_alive());

        pool.release(connection).await;
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_liveness_probe_on_stale_idle() {
        let connector = ScriptConnect::new();
        // The idle connection answers the RESET probe
        connector.push_script(vec![success_empty()]);
        let pool = ConnectionPool::new(connector, PoolConfig::default());

        let connection = pool
            .borrow(&servers(&["srv1"]), None, Duration::ZERO)
            .await
            .unwrap();
        pool.release(connection).await;

        // Threshold zero forces the probe
        let connection = pool
            .borrow(&servers(&["srv1"]), None, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(connection.state(), ConnectionState::Ready);
        pool.release(connection).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_borrow_times_out_at_capacity() {
        let connector = ScriptConnect::new();
        connector.push_script(vec![]);
        let pool = ConnectionPool::new(connector, PoolConfig { max_size: 1 });

        let held = pool
            .borrow(&servers(&["srv1"]), None, Duration::from_secs(300))
            .await
            .unwrap();

        let err = pool
            .borrow(
                &servers(&["srv1"]),
                Some(Duration::from_millis(50)),
                Duration::from_secs(300),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Timeout(_)));

        pool.release(held).await;
    }

    #[tokio::test]
    async fn test_borrow_no_servers() {
        let pool = ConnectionPool::new(ScriptConnect::new(), PoolConfig::default());
        let err = pool
            .borrow(&[], None, Duration::from_secs(300))
            .await
            .unwrap_err();
        assert!(err.is_connectivity());
    }

    #[tokio::test]
    async fn test_clean_up_closes_idle() {
        let connector = ScriptConnect::new();
        connector.push_script(vec![]);
        let pool = ConnectionPool::new(connector, PoolConfig::default());

        let connection = pool
            .borrow(&servers(&["srv1"]), None, Duration::from_secs(300))
            .await
            .unwrap();
        pool.release(connection).await;
        assert_eq!(pool.idle_count(), 1);

        pool.clean_up().await.unwrap();
        assert_eq!(pool.idle_count(), 0);
    }
}
