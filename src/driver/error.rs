//! Driver Error Types
//!
//! 드라이버 에러 정의

use thiserror::Error;

use crate::bolt::BoltError;

// ============================================================================
// DriverError - 드라이버 에러
// ============================================================================

/// 드라이버 에러
#[derive(Error, Debug, Clone)]
pub enum DriverError {
    /// 호출자가 계약을 위반함
    #[error("Usage error: {0}")]
    Usage(String),

    /// 네트워크 오류 또는 예기치 않은 EOF
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// 와이어 레벨 불변식 위반
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// 서버가 보고한 에러 (코드 + 메시지)
    #[error("Database error: {code} - {message}")]
    Database {
        /// 에러 코드
        code: String,
        /// 에러 메시지
        message: String,
    },

    /// 타임아웃
    #[error("Timeout: {0}")]
    Timeout(String),

    /// 재시도 한도 초과 (관찰된 에러들을 집계)
    #[error("Transaction retries exhausted after {} failures: [{}]", errors.len(), errors.join("; "))]
    TransactionExecutionLimit {
        /// 관찰된 에러들
        errors: Vec<String>,
        /// 추론된 원인들
        causes: Vec<String>,
    },
}

impl DriverError {
    /// 사용 에러 생성
    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }

    /// 연결 에러 생성
    pub fn connectivity(msg: impl Into<String>) -> Self {
        Self::Connectivity(msg.into())
    }

    /// 프로토콜 에러 생성
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// 서버 에러 생성
    pub fn database(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Database {
            code: code.into(),
            message: message.into(),
        }
    }

    /// 타임아웃 에러 생성
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// 서버 에러 코드 (서버 에러가 아니면 None)
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Database { code, .. } => Some(code),
            _ => None,
        }
    }

    /// 인증 실패 여부
    pub fn is_authentication_failed(&self) -> bool {
        matches!(self.code(), Some(code) if code == "Neo.ClientError.Security.Unauthorized"
            || code == "Neo.ClientError.Security.AuthenticationRateLimit")
    }

    /// 인가 만료 여부 (연결 폐기 필요)
    pub fn is_authorization_expired(&self) -> bool {
        self.code() == Some("Status.Security.AuthorizationExpired")
    }

    /// 토큰 만료 여부
    pub fn is_token_expired(&self) -> bool {
        self.code() == Some("Neo.ClientError.Security.TokenExpired")
    }

    /// 트랜지언트 에러 여부
    pub fn is_transient(&self) -> bool {
        matches!(self.code(), Some(code) if code.starts_with("Neo.TransientError"))
    }

    /// 재시도 가능 여부
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connectivity(_) | Self::Timeout(_) => true,
            Self::Database { code, .. } => is_retryable_code(code),
            _ => false,
        }
    }

    /// 사용 에러 여부
    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_))
    }

    /// 연결 에러 여부
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }
}

/// 재시도 가능한 서버 에러 코드 확인
fn is_retryable_code(code: &str) -> bool {
    code.starts_with("Neo.TransientError")
        || code == "Neo.ClientError.Cluster.NotALeader"
        || code == "Neo.ClientError.General.ForbiddenOnReadOnlyDatabase"
}

impl From<BoltError> for DriverError {
    fn from(err: BoltError) -> Self {
        match err {
            BoltError::Io(e) => DriverError::Connectivity(e.to_string()),
            BoltError::Handshake(msg) => DriverError::Connectivity(format!("handshake: {}", msg)),
            BoltError::Codec(e) => DriverError::Protocol(e.to_string()),
            BoltError::Protocol(msg) => DriverError::Protocol(msg),
            BoltError::Connection(msg) => DriverError::Connectivity(msg),
            BoltError::Timeout => DriverError::Timeout("read timed out".to_string()),
            BoltError::ConnectionClosed => {
                DriverError::Connectivity("connection closed by server".to_string())
            }
        }
    }
}

// ============================================================================
// Result Type
// ============================================================================

/// 드라이버 결과 타입
pub type DriverResult<T> = Result<T, DriverError>;

/// 여러 에러를 하나로 결합 (첫 에러 우선, 나머지는 메시지에 덧붙임)
pub(crate) fn combine_errors(errors: Vec<DriverError>) -> DriverResult<()> {
    let mut iter = errors.into_iter();
    let Some(first) = iter.next() else {
        return Ok(());
    };
    let rest: Vec<String> = iter.map(|e| e.to_string()).collect();
    if rest.is_empty() {
        return Err(first);
    }
    Err(DriverError::connectivity(format!(
        "{} (additionally: {})",
        first,
        rest.join("; ")
    )))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = DriverError::usage("already pending");
        assert!(matches!(err, DriverError::Usage(_)));

        let err = DriverError::database("Neo.ClientError.Statement.SyntaxError", "bad syntax");
        assert_eq!(err.code(), Some("Neo.ClientError.Statement.SyntaxError"));
    }

    #[test]
    fn test_error_display() {
        let err = DriverError::connectivity("connection refused");
        assert_eq!(err.to_string(), "Connectivity error: connection refused");

        let err = DriverError::database("Neo.ClientError.Statement.SyntaxError", "bad syntax");
        assert_eq!(
            err.to_string(),
            "Database error: Neo.ClientError.Statement.SyntaxError - bad syntax"
        );
    }

    #[test]
    fn test_error_retryable() {
        assert!(DriverError::connectivity("lost").is_retryable());
        assert!(DriverError::timeout("pool").is_retryable());
        assert!(DriverError::database(
            "Neo.TransientError.General.TemporarilyUnavailable",
            "busy"
        )
        .is_retryable());
        assert!(DriverError::database("Neo.ClientError.Cluster.NotALeader", "moved").is_retryable());

        assert!(!DriverError::usage("bad call").is_retryable());
        assert!(
            !DriverError::database("Neo.ClientError.Statement.SyntaxError", "bad").is_retryable()
        );
        assert!(!DriverError::database("Neo.ClientError.Security.TokenExpired", "old")
            .is_retryable());
    }

    #[test]
    fn test_security_classification() {
        let err = DriverError::database("Neo.ClientError.Security.Unauthorized", "nope");
        assert!(err.is_authentication_failed());
        assert!(!err.is_token_expired());

        let err = DriverError::database("Status.Security.AuthorizationExpired", "expired");
        assert!(err.is_authorization_expired());

        let err = DriverError::database("Neo.ClientError.Security.TokenExpired", "expired");
        assert!(err.is_token_expired());
        assert!(!err.is_authorization_expired());
    }

    #[test]
    fn test_bolt_error_conversion() {
        let err: DriverError = BoltError::ConnectionClosed.into();
        assert!(err.is_connectivity());

        let err: DriverError = BoltError::Timeout.into();
        assert!(matches!(err, DriverError::Timeout(_)));

        let err: DriverError = BoltError::protocol("bad tag").into();
        assert!(matches!(err, DriverError::Protocol(_)));
    }

    #[test]
    fn test_execution_limit_display() {
        let err = DriverError::TransactionExecutionLimit {
            errors: vec!["first".into(), "second".into()],
            causes: vec![],
        };
        let text = err.to_string();
        assert!(text.contains("2 failures"));
        assert!(text.contains("first; second"));
    }

    #[test]
    fn test_combine_errors() {
        assert!(combine_errors(vec![]).is_ok());

        let single = combine_errors(vec![DriverError::usage("one")]).unwrap_err();
        assert!(single.is_usage());

        let multi = combine_errors(vec![
            DriverError::connectivity("one"),
            DriverError::usage("two"),
        ])
        .unwrap_err();
        assert!(multi.to_string().contains("additionally"));
    }
}
