//! Transaction API
//!
//! 트랜잭션 관리

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use crate::bolt::{BoltIo, Value};

use super::connection::{Command, Connection, TxHandle, TxTimeout};
use super::error::DriverResult;
use super::stream::{Fetched, StreamHandle, Summary};

// ============================================================================
// TransactionConfig - 트랜잭션 설정
// ============================================================================

/// 트랜잭션 설정
///
/// The timeout is an explicit option: unset means the field is omitted on
/// the wire and the server default applies. Negative timeouts are
/// unrepresentable by construction.
#[derive(Debug, Clone, Default)]
pub struct TransactionConfig {
    /// 타임아웃
    pub timeout: TxTimeout,
    /// 메타데이터
    pub metadata: HashMap<String, Value>,
}

impl TransactionConfig {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 타임아웃 설정
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = TxTimeout::Set(timeout);
        self
    }

    /// 메타데이터 추가
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

// ============================================================================
// ManagedTransaction - 관리 트랜잭션
// ============================================================================

/// A transaction whose lifecycle the retry coordinator owns.
///
/// The work unit only runs queries and reads results; begin, commit,
/// rollback and retries happen outside. The transaction owns its borrowed
/// connection for the duration of one attempt.
pub struct ManagedTransaction<IO: BoltIo> {
    connection: Connection<IO>,
    tx: TxHandle,
    fetch_size: i64,
}

impl<IO: BoltIo> ManagedTransaction<IO> {
    pub(crate) fn new(connection: Connection<IO>, tx: TxHandle, fetch_size: i64) -> Self {
        Self {
            connection,
            tx,
            fetch_size,
        }
    }

    /// 쿼리 실행
    pub async fn run(
        &mut self,
        query: impl Into<String>,
        parameters: Option<HashMap<String, Value>>,
    ) -> DriverResult<StreamHandle> {
        let command = Command::new(query)
            .with_parameters(parameters.unwrap_or_default())
            .with_fetch_size(self.fetch_size);
        self.connection.run_tx(self.tx, command).await
    }

    /// 다음 레코드 (또는 종료 시 요약)
    pub async fn next(&mut self, stream: StreamHandle) -> DriverResult<Fetched> {
        self.connection.next(stream).await
    }

    /// 남은 레코드 전부 버퍼링
    pub async fn buffer(&mut self, stream: StreamHandle) -> DriverResult<()> {
        self.connection.buffer(stream).await
    }

    /// 남은 레코드 버리고 요약 반환
    pub async fn consume(&mut self, stream: StreamHandle) -> DriverResult<Summary> {
        self.connection.consume(stream).await
    }

    /// 스트림의 컬럼 이름
    pub fn keys(&self, stream: StreamHandle) -> DriverResult<std::sync::Arc<Vec<String>>> {
        self.connection.keys(stream)
    }

    /// The coordinator takes the connection back to commit and return it.
    pub(crate) fn into_parts(self) -> (Connection<IO>, TxHandle) {
        (self.connection, self.tx)
    }
}

impl<IO: BoltIo> std::fmt::Debug for ManagedTransaction<IO> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedTransaction")
            .field("fetch_size", &self.fetch_size)
            .finish()
    }
}

// ============================================================================
// TransactionWork - 트랜잭션 작업
// ============================================================================

/// A unit of work executed under managed retry.
///
/// The coordinator may call it several times, so it must be safe to replay
/// its side effects; the driver does not reason about user state.
pub trait TransactionWork<IO: BoltIo>: Send {
    /// 작업 결과 타입
    type Output: Send;

    /// 작업 실행
    fn execute(
        &mut self,
        tx: &mut ManagedTransaction<IO>,
    ) -> impl Future<Output = DriverResult<Self::Output>> + Send;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_config() {
        let config = TransactionConfig::new()
            .with_timeout(Duration::from_secs(30))
            .with_metadata("key", "value");

        assert_eq!(config.timeout, TxTimeout::Set(Duration::from_secs(30)));
        assert!(config.metadata.contains_key("key"));
    }

    #[test]
    fn test_transaction_config_default_is_unset() {
        let config = TransactionConfig::default();
        assert_eq!(config.timeout, TxTimeout::Unset);
        assert!(config.metadata.is_empty());
    }
}
