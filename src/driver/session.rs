//! Session Management
//!
//! 세션 관리
//!
//! A session is a logical execution context: it owns bookmark propagation,
//! home-database resolution, the one-pending-work-unit rule and the borrow/
//! return dance with the pool. Transactions and streams are opaque tokens
//! the session dereferences; they never hold a reference back into it.
//!
//! Sessions are not safe for concurrent use. Drivers are.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::bolt::{BoltIo, BoltVersion, Value};

use super::connection::{AccessMode, Command, Connection, TxConfig, TxHandle};
use super::driver::DriverConfig;
use super::error::{combine_errors, DriverError, DriverResult};
use super::pool::{Connect, ConnectionPool};
use super::retry::{RetryPolicy, RetryState};
use super::routing::Router;
use super::stream::{Fetched, StreamHandle, Summary};
use super::transaction::{ManagedTransaction, TransactionConfig, TransactionWork};

/// Liveness threshold used for regular work: idle connections are trusted.
const DEFAULT_LIVENESS_CHECK_THRESHOLD: Duration = Duration::MAX;

// ============================================================================
// SessionConfig - 세션 설정
// ============================================================================

/// 세션 설정
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// 기본 접근 모드
    pub access_mode: AccessMode,
    /// 초기 북마크 (빈 문자열은 걸러냄)
    pub bookmarks: Vec<String>,
    /// 데이터베이스 이름 (없으면 홈 데이터베이스를 조회)
    pub database: Option<String>,
    /// Fetch Size (0 = 드라이버 기본값, -1 = 전부)
    pub fetch_size: i64,
    /// 임퍼서네이션 사용자
    pub impersonated_user: Option<String>,
}

impl SessionConfig {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 빌더 시작
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }
}

/// 세션 설정 빌더
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// 읽기 모드로 설정
    pub fn with_read_access(mut self) -> Self {
        self.config.access_mode = AccessMode::Read;
        self
    }

    /// 쓰기 모드로 설정
    pub fn with_write_access(mut self) -> Self {
        self.config.access_mode = AccessMode::Write;
        self
    }

    /// 데이터베이스 설정
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.config.database = Some(database.into());
        self
    }

    /// 북마크 추가
    pub fn with_bookmark(mut self, bookmark: impl Into<String>) -> Self {
        self.config.bookmarks.push(bookmark.into());
        self
    }

    /// 북마크 설정
    pub fn with_bookmarks(mut self, bookmarks: Vec<String>) -> Self {
        self.config.bookmarks = bookmarks;
        self
    }

    /// Fetch Size 설정
    pub fn with_fetch_size(mut self, fetch_size: i64) -> Self {
        self.config.fetch_size = fetch_size;
        self
    }

    /// 임퍼서네이션 사용자 설정
    pub fn with_impersonated_user(mut self, user: impl Into<String>) -> Self {
        self.config.impersonated_user = Some(user.into());
        self
    }

    /// 빌드
    pub fn build(self) -> SessionConfig {
        self.config
    }
}

/// 빈 문자열 북마크 제거
fn cleanup_bookmarks(bookmarks: Vec<String>) -> Vec<String> {
    if bookmarks.iter().all(|b| !b.is_empty()) {
        return bookmarks;
    }
    bookmarks.into_iter().filter(|b| !b.is_empty()).collect()
}

// ============================================================================
// Tokens - 세션이 역참조하는 불투명 토큰
// ============================================================================

/// Opaque reference to the session's open explicit transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxRef(u64);

/// Opaque reference to a stream owned by one of the session's work units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRef {
    owner: u64,
    handle: StreamHandle,
}

// ============================================================================
// ServerInfo - 서버 정보
// ============================================================================

/// 서버 정보
#[derive(Debug, Clone)]
pub struct ServerInfo {
    /// 서버 주소 (이름)
    pub address: String,
    /// 서버 에이전트
    pub agent: String,
    /// 프로토콜 버전
    pub protocol_version: BoltVersion,
}

// ============================================================================
// Session - 세션
// ============================================================================

struct ExplicitTx<IO: BoltIo> {
    token: u64,
    tx: TxHandle,
    connection: Connection<IO>,
}

struct AutoCommitTx<IO: BoltIo> {
    token: u64,
    stream: StreamHandle,
    connection: Connection<IO>,
}

/// 데이터베이스 세션
pub struct Session<C: Connect> {
    pool: Arc<ConnectionPool<C>>,
    router: Arc<dyn Router>,
    default_mode: AccessMode,
    bookmarks: Vec<String>,
    database: Option<String>,
    resolve_home_db: bool,
    impersonated_user: Option<String>,
    fetch_size: i64,
    acquisition_timeout: Option<Duration>,
    retry_policy: RetryPolicy,
    explicit: Option<ExplicitTx<C::Io>>,
    autocommit: Option<AutoCommitTx<C::Io>>,
    token_counter: u64,
}

impl<C: Connect> Session<C> {
    /// 새 세션 생성
    pub fn new(
        pool: Arc<ConnectionPool<C>>,
        router: Arc<dyn Router>,
        driver_config: &DriverConfig,
        config: SessionConfig,
    ) -> Self {
        let fetch_size = if config.fetch_size != 0 {
            config.fetch_size
        } else {
            driver_config.fetch_size
        };
        let acquisition_timeout = if driver_config.connection_acquisition_timeout.is_zero() {
            None
        } else {
            Some(driver_config.connection_acquisition_timeout)
        };
        tracing::debug!(database = ?config.database, "session created");

        Self {
            pool,
            router,
            default_mode: config.access_mode,
            bookmarks: cleanup_bookmarks(config.bookmarks),
            resolve_home_db: config.database.is_none(),
            database: config.database,
            impersonated_user: config.impersonated_user,
            fetch_size,
            acquisition_timeout,
            retry_policy: RetryPolicy::new(driver_config.max_transaction_retry_time),
            explicit: None,
            autocommit: None,
            token_counter: 0,
        }
    }

    // ------------------------------------------------------------------
    // Auto-commit
    // ------------------------------------------------------------------

    /// 쿼리 실행 (auto-commit)
    ///
    /// Returns a stream token; records are fetched through
    /// [`Session::next`]. Any pending auto-commit stream is discarded
    /// first.
    pub async fn run(
        &mut self,
        query: impl Into<String>,
        parameters: Option<HashMap<String, Value>>,
        config: Option<TransactionConfig>,
    ) -> DriverResult<StreamRef> {
        self.check_no_explicit_tx()?;
        self.finish_autocommit().await;

        let config = config.unwrap_or_default();
        let mut connection = self.acquire(self.default_mode).await?;

        let command = Command::new(query)
            .with_parameters(parameters.unwrap_or_default())
            .with_fetch_size(self.fetch_size);
        match connection
            .run(command, self.tx_config(self.default_mode, &config))
            .await
        {
            Ok(stream) => {
                let token = self.next_token();
                self.autocommit = Some(AutoCommitTx {
                    token,
                    stream,
                    connection,
                });
                Ok(StreamRef {
                    owner: token,
                    handle: stream,
                })
            }
            Err(err) => {
                self.pool.release(connection).await;
                Err(err)
            }
        }
    }

    // ------------------------------------------------------------------
    // Explicit transactions
    // ------------------------------------------------------------------

    /// 트랜잭션 시작
    pub async fn begin_transaction(
        &mut self,
        config: Option<TransactionConfig>,
    ) -> DriverResult<TxRef> {
        self.check_no_explicit_tx()?;
        self.finish_autocommit().await;

        let config = config.unwrap_or_default();
        let mut connection = self.acquire(self.default_mode).await?;

        match connection
            .tx_begin(self.tx_config(self.default_mode, &config))
            .await
        {
            Ok(tx) => {
                let token = self.next_token();
                self.explicit = Some(ExplicitTx {
                    token,
                    tx,
                    connection,
                });
                Ok(TxRef(token))
            }
            Err(err) => {
                self.pool.release(connection).await;
                Err(err)
            }
        }
    }

    /// 트랜잭션 내 쿼리 실행
    pub async fn transaction_run(
        &mut self,
        tx: TxRef,
        query: impl Into<String>,
        parameters: Option<HashMap<String, Value>>,
    ) -> DriverResult<StreamRef> {
        let fetch_size = self.fetch_size;
        let explicit = self.explicit_mut(tx)?;
        let command = Command::new(query)
            .with_parameters(parameters.unwrap_or_default())
            .with_fetch_size(fetch_size);
        let handle = explicit.connection.run_tx(explicit.tx, command).await?;
        Ok(StreamRef {
            owner: explicit.token,
            handle,
        })
    }

    /// 커밋 - 성공 시 북마크 확보
    pub async fn commit_transaction(&mut self, tx: TxRef) -> DriverResult<()> {
        self.explicit_mut(tx)?;
        let mut explicit = self.explicit.take().expect("checked above");
        let result = explicit.connection.tx_commit(explicit.tx).await;
        if result.is_ok() {
            self.retrieve_bookmark(&explicit.connection);
        }
        self.pool.release(explicit.connection).await;
        result
    }

    /// 롤백 - 북마크 없음
    pub async fn rollback_transaction(&mut self, tx: TxRef) -> DriverResult<()> {
        self.explicit_mut(tx)?;
        let mut explicit = self.explicit.take().expect("checked above");
        let result = explicit.connection.tx_rollback(explicit.tx).await;
        self.pool.release(explicit.connection).await;
        result
    }

    /// 트랜잭션 닫기 (열려 있으면 롤백)
    pub async fn close_transaction(&mut self, tx: TxRef) -> DriverResult<()> {
        match &self.explicit {
            Some(explicit) if explicit.token == tx.0 => self.rollback_transaction(tx).await,
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Stream consumption
    // ------------------------------------------------------------------

    /// 다음 레코드 (또는 종료 시 요약)
    pub async fn next(&mut self, stream: StreamRef) -> DriverResult<Fetched> {
        self.stream_connection(stream)?.next(stream.handle).await
    }

    /// 남은 레코드 전부 버퍼링
    pub async fn buffer(&mut self, stream: StreamRef) -> DriverResult<()> {
        self.stream_connection(stream)?.buffer(stream.handle).await
    }

    /// 남은 레코드 버리고 요약 반환
    pub async fn consume(&mut self, stream: StreamRef) -> DriverResult<Summary> {
        self.stream_connection(stream)?.consume(stream.handle).await
    }

    /// 스트림의 컬럼 이름
    pub fn keys(&self, stream: StreamRef) -> DriverResult<Arc<Vec<String>>> {
        match (&self.autocommit, &self.explicit) {
            (Some(ac), _) if ac.token == stream.owner => ac.connection.keys(stream.handle),
            (_, Some(ex)) if ex.token == stream.owner => ex.connection.keys(stream.handle),
            _ => Err(DriverError::usage("stream is no longer open in this session")),
        }
    }

    fn stream_connection(&mut self, stream: StreamRef) -> DriverResult<&mut Connection<C::Io>> {
        if let Some(ac) = &mut self.autocommit {
            if ac.token == stream.owner {
                return Ok(&mut ac.connection);
            }
        }
        if let Some(ex) = &mut self.explicit {
            if ex.token == stream.owner {
                return Ok(&mut ex.connection);
            }
        }
        Err(DriverError::usage("stream is no longer open in this session"))
    }

    // ------------------------------------------------------------------
    // Managed transactions
    // ------------------------------------------------------------------

    /// 읽기 트랜잭션 함수 (재시도 포함)
    pub async fn execute_read<W: TransactionWork<C::Io>>(
        &mut self,
        work: &mut W,
        config: Option<TransactionConfig>,
    ) -> DriverResult<W::Output> {
        self.run_retriable(AccessMode::Read, work, config).await
    }

    /// 쓰기 트랜잭션 함수 (재시도 포함)
    pub async fn execute_write<W: TransactionWork<C::Io>>(
        &mut self,
        work: &mut W,
        config: Option<TransactionConfig>,
    ) -> DriverResult<W::Output> {
        self.run_retriable(AccessMode::Write, work, config).await
    }

    async fn run_retriable<W: TransactionWork<C::Io>>(
        &mut self,
        mode: AccessMode,
        work: &mut W,
        config: Option<TransactionConfig>,
    ) -> DriverResult<W::Output> {
        self.check_no_explicit_tx()?;
        self.finish_autocommit().await;

        let config = config.unwrap_or_default();
        let mut state = RetryState::new(self.retry_policy.clone());
        while state.should_continue() {
            if let Some(value) = self.attempt(mode, work, &config, &mut state).await {
                return Ok(value);
            }
        }
        Err(state.into_error())
    }

    /// One attempt: acquire, begin, run the work, commit. Failures are
    /// recorded on the retry state; a dead connection additionally
    /// invalidates the routing entry for its server.
    async fn attempt<W: TransactionWork<C::Io>>(
        &mut self,
        mode: AccessMode,
        work: &mut W,
        config: &TransactionConfig,
        state: &mut RetryState,
    ) -> Option<W::Output> {
        let mut connection = match self.acquire(mode).await {
            Ok(connection) => connection,
            Err(err) => {
                state.on_failure(err, false).await;
                return None;
            }
        };

        let tx = match connection.tx_begin(self.tx_config(mode, config)).await {
            Ok(tx) => tx,
            Err(err) => {
                self.give_back(mode, connection).await;
                state.on_failure(err, false).await;
                return None;
            }
        };

        let mut managed = ManagedTransaction::new(connection, tx, self.fetch_size);
        match work.execute(&mut managed).await {
            Err(err) => {
                // No explicit rollback: returning the connection resets it,
                // which rolls the server side back.
                let (connection, _) = managed.into_parts();
                self.give_back(mode, connection).await;
                state.on_failure(err, false).await;
                None
            }
            Ok(value) => {
                let (mut connection, tx) = managed.into_parts();
                match connection.tx_commit(tx).await {
                    Ok(()) => {
                        self.retrieve_bookmark(&connection);
                        self.pool.release(connection).await;
                        Some(value)
                    }
                    Err(err) => {
                        self.give_back(mode, connection).await;
                        state.on_failure(err, true).await;
                        None
                    }
                }
            }
        }
    }

    /// Release after a failed attempt; a dead connection invalidates its
    /// routing entry for the access mode first.
    async fn give_back(&mut self, mode: AccessMode, connection: Connection<C::Io>) {
        if !connection.is_alive() {
            let database = self.database.clone().unwrap_or_default();
            let server = connection.server_name().to_string();
            let result = match mode {
                AccessMode::Write => self.router.invalidate_writer(&database, &server).await,
                AccessMode::Read => self.router.invalidate_reader(&database, &server).await,
            };
            if let Err(err) = result {
                tracing::warn!(server = %server, error = %err, "routing invalidation failed");
            }
        }
        self.pool.release(connection).await;
    }

    // ------------------------------------------------------------------
    // Bookmarks and lifecycle
    // ------------------------------------------------------------------

    /// 마지막으로 확보한 북마크들
    ///
    /// A pending auto-commit stream's bookmark is flushed into the session
    /// first, so the answer is current even mid-stream.
    pub fn last_bookmarks(&mut self) -> Vec<String> {
        if let Some(ac) = &self.autocommit {
            let bookmark = ac.connection.bookmark().to_string();
            if !bookmark.is_empty() {
                self.bookmarks = vec![bookmark];
            }
        }
        self.bookmarks.clone()
    }

    /// 서버 정보 조회
    pub async fn server_info(&mut self) -> DriverResult<ServerInfo> {
        self.resolve_home_database().await?;
        let database = self.database.clone().unwrap_or_default();
        let servers = self.router.readers(&self.bookmarks, &database).await?;

        // Liveness threshold zero: probe before trusting the connection
        let connection = self
            .pool
            .borrow(&servers, self.acquisition_timeout, Duration::ZERO)
            .await?;
        let info = ServerInfo {
            address: connection.server_name().to_string(),
            agent: connection.server_agent().unwrap_or_default().to_string(),
            protocol_version: connection.version(),
        };
        self.pool.release(connection).await;
        Ok(info)
    }

    /// 세션 닫기
    ///
    /// Rolls back an open explicit transaction, discards a pending
    /// auto-commit, then runs pool and router cleanup concurrently and
    /// combines every error observed.
    pub async fn close(&mut self) -> DriverResult<()> {
        let mut errors = Vec::new();

        if let Some(mut explicit) = self.explicit.take() {
            if let Err(err) = explicit.connection.tx_rollback(explicit.tx).await {
                errors.push(err);
            }
            self.pool.release(explicit.connection).await;
        }
        self.finish_autocommit().await;

        let (pool_result, router_result) =
            tokio::join!(self.pool.clean_up(), self.router.clean_up());
        if let Err(err) = pool_result {
            errors.push(err);
        }
        if let Err(err) = router_result {
            errors.push(err);
        }

        tracing::debug!("session closed");
        combine_errors(errors)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn check_no_explicit_tx(&self) -> DriverResult<()> {
        if self.explicit.is_some() {
            return Err(DriverError::usage(
                "session already has a pending transaction",
            ));
        }
        Ok(())
    }

    /// Discard the pending auto-commit stream, harvesting its bookmark and
    /// handing the connection back.
    async fn finish_autocommit(&mut self) {
        if let Some(mut ac) = self.autocommit.take() {
            let _ = ac.connection.consume(ac.stream).await;
            self.retrieve_bookmark(&ac.connection);
            self.pool.release(ac.connection).await;
        }
    }

    fn retrieve_bookmark(&mut self, connection: &Connection<C::Io>) {
        let bookmark = connection.bookmark();
        if !bookmark.is_empty() {
            tracing::debug!(bookmark, "bookmark updated");
            self.bookmarks = vec![bookmark.to_string()];
        }
    }

    async fn resolve_home_database(&mut self) -> DriverResult<()> {
        if !self.resolve_home_db {
            return Ok(());
        }
        let name = self
            .router
            .default_database(&self.bookmarks, self.impersonated_user.as_deref())
            .await?;
        tracing::debug!(database = %name, "resolved home database");
        self.database = Some(name);
        self.resolve_home_db = false;
        Ok(())
    }

    async fn acquire(&mut self, mode: AccessMode) -> DriverResult<Connection<C::Io>> {
        self.resolve_home_database().await?;
        let database = self.database.clone().unwrap_or_default();

        let servers = match mode {
            AccessMode::Read => self.router.readers(&self.bookmarks, &database).await?,
            AccessMode::Write => self.router.writers(&self.bookmarks, &database).await?,
        };

        let mut connection = self
            .pool
            .borrow(
                &servers,
                self.acquisition_timeout,
                DEFAULT_LIVENESS_CHECK_THRESHOLD,
            )
            .await?;

        if !database.is_empty() {
            if !connection.supports_multi_database() {
                self.pool.release(connection).await;
                return Err(DriverError::usage(
                    "server does not support multi-database",
                ));
            }
            connection.select_database(database);
        }
        Ok(connection)
    }

    fn tx_config(&self, mode: AccessMode, config: &TransactionConfig) -> TxConfig {
        TxConfig {
            mode,
            bookmarks: self.bookmarks.clone(),
            timeout: config.timeout,
            metadata: config.metadata.clone(),
            impersonated_user: self.impersonated_user.clone(),
        }
    }

    fn explicit_mut(&mut self, tx: TxRef) -> DriverResult<&mut ExplicitTx<C::Io>> {
        match &mut self.explicit {
            Some(explicit) if explicit.token == tx.0 => Ok(explicit),
            _ => Err(DriverError::usage("no open transaction for this handle")),
        }
    }

    fn next_token(&mut self) -> u64 {
        self.token_counter += 1;
        self.token_counter
    }

    #[cfg(test)]
    pub(crate) fn set_retry_policy(&mut self, policy: RetryPolicy) {
        self.retry_policy = policy;
    }
}

impl<C: Connect> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("database", &self.database)
            .field("bookmarks", &self.bookmarks)
            .field("pending_explicit", &self.explicit.is_some())
            .field("pending_autocommit", &self.autocommit.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bolt::message::BoltRequest;
    use crate::driver::testing::{
        failure, record, run_response, success, success_empty, RecordingRouter, ScriptConnect,
    };
    use parking_lot::Mutex;

    fn fixture(
        connector: ScriptConnect,
    ) -> (
        Session<ScriptConnect>,
        Arc<ConnectionPool<ScriptConnect>>,
        Arc<RecordingRouter>,
    ) {
        fixture_with(connector, SessionConfig::default())
    }

    fn fixture_with(
        connector: ScriptConnect,
        config: SessionConfig,
    ) -> (
        Session<ScriptConnect>,
        Arc<ConnectionPool<ScriptConnect>>,
        Arc<RecordingRouter>,
    ) {
        let pool = Arc::new(ConnectionPool::new(connector, Default::default()));
        let router = Arc::new(RecordingRouter::new("srv1"));
        let session = Session::new(
            pool.clone(),
            router.clone(),
            &DriverConfig::default(),
            config,
        );
        (session, pool, router)
    }

    #[tokio::test]
    async fn test_happy_path_auto_commit() {
        let connector = ScriptConnect::new();
        connector.push_script(run_response());
        let (mut session, pool, _router) = fixture(connector);

        let params = crate::params! {"name" => "Alice", "age" => 30i64};
        let stream = session.run("MATCH (n)", Some(params), None).await.unwrap();
        assert_eq!(
            *session.keys(stream).unwrap(),
            vec!["f1".to_string(), "f2".to_string()]
        );

        let mut records = 0;
        loop {
            match session.next(stream).await.unwrap() {
                Fetched::Record(_) => records += 1,
                Fetched::Summary(_) => break,
            }
        }
        assert_eq!(records, 3);
        assert_eq!(session.last_bookmarks(), vec!["bm".to_string()]);

        session.close().await.unwrap();
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_single_pending_work() {
        let connector = ScriptConnect::new();
        connector.push_script(vec![success_empty()]);
        let (mut session, _pool, _router) = fixture(connector);

        let _tx = session.begin_transaction(None).await.unwrap();

        // A second transaction-initiating call observes a usage error
        let err = session.begin_transaction(None).await.unwrap_err();
        assert!(err.is_usage());

        let err = session.run("RETURN 1", None, None).await.unwrap_err();
        assert!(err.is_usage());

        struct Nop;
        impl TransactionWork<crate::driver::testing::ScriptIo> for Nop {
            type Output = ();
            async fn execute(
                &mut self,
                _tx: &mut ManagedTransaction<crate::driver::testing::ScriptIo>,
            ) -> DriverResult<()> {
                Ok(())
            }
        }
        let err = session.execute_write(&mut Nop, None).await.unwrap_err();
        assert!(err.is_usage());
    }

    #[tokio::test]
    async fn test_explicit_transaction_commit_captures_bookmark() {
        let connector = ScriptConnect::new();
        let mut script = vec![success_empty()];
        script.extend(run_response());
        script.push(success(&[("bookmark", "cbm".into())]));
        connector.push_script(script);
        let (mut session, pool, _router) = fixture(connector);

        let tx = session.begin_transaction(None).await.unwrap();
        let stream = session
            .transaction_run(tx, "MATCH (n) RETURN n", None)
            .await
            .unwrap();
        session.buffer(stream).await.unwrap();

        session.commit_transaction(tx).await.unwrap();
        assert_eq!(session.last_bookmarks(), vec!["cbm".to_string()]);
        assert_eq!(pool.in_use(), 0);

        // The transaction token is spent
        let err = session.commit_transaction(tx).await.unwrap_err();
        assert!(err.is_usage());
    }

    #[tokio::test]
    async fn test_rollback_publishes_no_bookmark() {
        let connector = ScriptConnect::new();
        connector.push_script(vec![success_empty(), success_empty()]);
        let (mut session, pool, _router) = fixture(connector);

        let tx = session.begin_transaction(None).await.unwrap();
        session.rollback_transaction(tx).await.unwrap();

        assert!(session.last_bookmarks().is_empty());
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_failed_run_releases_connection() {
        let connector = ScriptConnect::new();
        connector.push_script(vec![failure(
            "Neo.ClientError.Statement.SyntaxError",
            "bad syntax",
        )]);
        let (mut session, pool, _router) = fixture(connector);

        let err = session.run("MATCH (n", None, None).await.unwrap_err();
        assert_eq!(err.code(), Some("Neo.ClientError.Statement.SyntaxError"));
        assert_eq!(pool.in_use(), 0);
        // Bookmarks unchanged after a failure
        assert!(session.last_bookmarks().is_empty());
    }

    #[tokio::test]
    async fn test_run_discards_pending_autocommit() {
        let connector = ScriptConnect::new();
        // One connection serves both queries; the first stream's remainder
        // is discarded in between
        let mut script = run_response();
        script.extend(run_response());
        connector.push_script(script);
        let (mut session, pool, _router) = fixture(connector);

        let first = session.run("MATCH (n)", None, None).await.unwrap();
        // Starting the next query discards the pending stream
        let _second = session.run("MATCH (m)", None, None).await.unwrap();

        // The first stream's bookmark was still harvested
        assert_eq!(session.last_bookmarks(), vec!["bm".to_string()]);
        // The first stream is gone from the session
        let err = session.next(first).await.unwrap_err();
        assert!(err.is_usage());
        assert_eq!(pool.in_use(), 1);

        session.close().await.unwrap();
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_home_database_resolution_cached() {
        let connector = ScriptConnect::new();
        let mut script = run_response();
        script.extend(run_response());
        connector.push_script(script);
        let (mut session, _pool, router) = {
            let pool = Arc::new(ConnectionPool::new(connector, Default::default()));
            let router = Arc::new(RecordingRouter::new("srv1").with_home_database("homedb"));
            let session = Session::new(
                pool.clone(),
                router.clone(),
                &DriverConfig::default(),
                SessionConfig::default(),
            );
            (session, pool, router)
        };

        session.run("RETURN 1", None, None).await.unwrap();
        session.run("RETURN 2", None, None).await.unwrap();

        // Resolved once, cached afterwards
        assert_eq!(router.home_calls(), 1);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_configured_database_skips_resolution() {
        let connector = ScriptConnect::new();
        connector.push_script(run_response());
        let (mut session, _pool, router) = fixture_with(
            connector,
            SessionConfig::builder().with_database("thedb").build(),
        );

        session.run("RETURN 1", None, None).await.unwrap();
        assert_eq!(router.home_calls(), 0);
    }

    #[tokio::test]
    async fn test_bookmarks_sent_with_begin() {
        let connector = ScriptConnect::new();
        connector.push_script(vec![success_empty()]);
        let (mut session, _pool, _router) = fixture_with(
            connector.clone(),
            SessionConfig::builder()
                .with_bookmarks(vec!["bm1".to_string(), String::new()])
                .build(),
        );

        session.begin_transaction(None).await.unwrap();

        let logs = connector.sent_logs();
        let sent = logs[0].lock();
        let BoltRequest::Begin(begin) = &sent[1] else {
            panic!("expected BEGIN after HELLO");
        };
        // Empty bookmark was filtered; the real one went out
        let bookmarks = begin.extra.get("bookmarks").and_then(Value::as_list).unwrap();
        assert_eq!(bookmarks.len(), 1);
        assert_eq!(bookmarks[0].as_str(), Some("bm1"));
    }

    /// Counts invocations; failures come from the scripted server.
    struct CountingWork {
        calls: Arc<Mutex<u32>>,
    }

    impl TransactionWork<crate::driver::testing::ScriptIo> for CountingWork {
        type Output = i64;

        async fn execute(
            &mut self,
            tx: &mut ManagedTransaction<crate::driver::testing::ScriptIo>,
        ) -> DriverResult<i64> {
            let call = {
                let mut calls = self.calls.lock();
                *calls += 1;
                *calls
            };
            let stream = tx.run("CREATE (n) RETURN n", None).await?;
            tx.consume(stream).await?;
            Ok(call as i64)
        }
    }

    #[tokio::test]
    async fn test_managed_retry_succeeds_after_transient_failure() {
        let connector = ScriptConnect::new();
        // First attempt: BEGIN ok, RUN fails with a transient error
        connector.push_script(vec![
            success_empty(),
            failure("Neo.TransientError.General.TemporarilyUnavailable", "busy"),
        ]);
        // Second attempt: BEGIN, RUN, records, summary, COMMIT with bookmark
        let mut script = vec![success_empty()];
        script.push(success(&[(
            "fields",
            Value::List(vec!["n".into()]),
        )]));
        script.push(record(vec!["1".into()]));
        script.push(success(&[("type", "w".into())]));
        script.push(success(&[("bookmark", "bm2".into())]));
        connector.push_script(script);

        let (mut session, pool, _router) = fixture(connector);
        let (policy, _elapsed, sleeps) =
            crate::driver::testing::fake_time_policy(Duration::from_secs(30));
        session.set_retry_policy(policy);

        let calls = Arc::new(Mutex::new(0));
        let mut work = CountingWork {
            calls: calls.clone(),
        };
        let value = session.execute_write(&mut work, None).await.unwrap();

        // The work ran exactly twice and the second result came back
        assert_eq!(*calls.lock(), 2);
        assert_eq!(value, 2);
        // One throttled sleep between the attempts
        assert_eq!(sleeps.lock().len(), 1);
        // Bookmark captured from the successful commit
        assert_eq!(session.last_bookmarks(), vec!["bm2".to_string()]);
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_managed_retry_gives_up_on_fatal_error() {
        let connector = ScriptConnect::new();
        connector.push_script(vec![
            success_empty(),
            failure("Neo.ClientError.Statement.SyntaxError", "bad"),
        ]);
        let (mut session, pool, _router) = fixture(connector);
        let (policy, _elapsed, sleeps) =
            crate::driver::testing::fake_time_policy(Duration::from_secs(30));
        session.set_retry_policy(policy);

        let calls = Arc::new(Mutex::new(0));
        let mut work = CountingWork {
            calls: calls.clone(),
        };
        let err = session.execute_write(&mut work, None).await.unwrap_err();

        assert_eq!(err.code(), Some("Neo.ClientError.Statement.SyntaxError"));
        assert_eq!(*calls.lock(), 1);
        assert!(sleeps.lock().is_empty());
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_managed_retry_invalidates_router_on_dead_connection() {
        let connector = ScriptConnect::new();
        // BEGIN succeeds, then the server hangs up mid-run
        connector.push_script(vec![success_empty()]);
        let (mut session, pool, router) = fixture(connector);
        let (policy, elapsed, _sleeps) =
            crate::driver::testing::fake_time_policy(Duration::from_millis(10));
        // Exhaust the budget after the first failure
        *elapsed.lock() += Duration::from_secs(1);
        session.set_retry_policy(policy);

        let calls = Arc::new(Mutex::new(0));
        let mut work = CountingWork {
            calls: calls.clone(),
        };
        let err = session.execute_write(&mut work, None).await.unwrap_err();

        assert!(matches!(err, DriverError::TransactionExecutionLimit { .. }));
        // The dead writer was reported to the router
        assert_eq!(router.invalidated_writers(), vec!["srv1".to_string()]);
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_close_rolls_back_open_transaction() {
        let connector = ScriptConnect::new();
        connector.push_script(vec![success_empty(), success_empty()]);
        let (mut session, pool, _router) = fixture(connector);

        let _tx = session.begin_transaction(None).await.unwrap();
        session.close().await.unwrap();
        assert_eq!(pool.in_use(), 0);

        // Everything is gone after close
        assert!(session.last_bookmarks().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_bookmarks() {
        assert_eq!(
            cleanup_bookmarks(vec!["a".into(), "".into(), "b".into()]),
            vec!["a".to_string(), "b".to_string()]
        );
        let untouched = vec!["a".to_string(), "b".to_string()];
        assert_eq!(cleanup_bookmarks(untouched.clone()), untouched);
    }

    #[tokio::test]
    async fn test_session_config_builder() {
        let config = SessionConfig::builder()
            .with_read_access()
            .with_database("mydb")
            .with_fetch_size(500)
            .with_bookmark("b1")
            .with_impersonated_user("someone")
            .build();

        assert_eq!(config.access_mode, AccessMode::Read);
        assert_eq!(config.database.as_deref(), Some("mydb"));
        assert_eq!(config.fetch_size, 500);
        assert_eq!(config.bookmarks, vec!["b1".to_string()]);
        assert_eq!(config.impersonated_user.as_deref(), Some("someone"));
    }
}
