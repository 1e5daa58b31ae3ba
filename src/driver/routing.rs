//! Routing interface
//!
//! 클러스터 라우팅 인터페이스
//!
//! The session depends on this contract only: which servers may serve a
//! database in which role, the name of a user's home database, and
//! invalidation when a server turns out to be gone. Implementations may
//! cache a routing table with a TTL; caching is outside this crate.

use futures::future::BoxFuture;

use super::error::DriverResult;

pub use crate::bolt::message::RoutingTable;

// ============================================================================
// Router - 라우터 인터페이스
// ============================================================================

/// 세션이 의존하는 라우팅 계약
pub trait Router: Send + Sync {
    /// 데이터베이스의 읽기 서버 목록
    fn readers<'a>(
        &'a self,
        bookmarks: &'a [String],
        database: &'a str,
    ) -> BoxFuture<'a, DriverResult<Vec<String>>>;

    /// 데이터베이스의 쓰기 서버 목록
    fn writers<'a>(
        &'a self,
        bookmarks: &'a [String],
        database: &'a str,
    ) -> BoxFuture<'a, DriverResult<Vec<String>>>;

    /// 사용자(또는 임퍼서네이션 대상)의 홈 데이터베이스 이름
    fn default_database<'a>(
        &'a self,
        bookmarks: &'a [String],
        impersonated_user: Option<&'a str>,
    ) -> BoxFuture<'a, DriverResult<String>>;

    /// 죽은 읽기 서버 무효화
    fn invalidate_reader<'a>(
        &'a self,
        database: &'a str,
        server: &'a str,
    ) -> BoxFuture<'a, DriverResult<()>>;

    /// 죽은 쓰기 서버 무효화
    fn invalidate_writer<'a>(
        &'a self,
        database: &'a str,
        server: &'a str,
    ) -> BoxFuture<'a, DriverResult<()>>;

    /// 세션 종료 시 정리
    fn clean_up(&self) -> BoxFuture<'_, DriverResult<()>>;
}

// ============================================================================
// DirectRouter - 단일 서버 라우터
// ============================================================================

/// 단일 서버 배포용 라우터: 모든 역할이 같은 주소로 간다
#[derive(Debug, Clone)]
pub struct DirectRouter {
    address: String,
}

impl DirectRouter {
    /// 새 라우터 생성
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

impl Router for DirectRouter {
    fn readers<'a>(
        &'a self,
        _bookmarks: &'a [String],
        _database: &'a str,
    ) -> BoxFuture<'a, DriverResult<Vec<String>>> {
        Box::pin(async move { Ok(vec![self.address.clone()]) })
    }

    fn writers<'a>(
        &'a self,
        _bookmarks: &'a [String],
        _database: &'a str,
    ) -> BoxFuture<'a, DriverResult<Vec<String>>> {
        Box::pin(async move { Ok(vec![self.address.clone()]) })
    }

    fn default_database<'a>(
        &'a self,
        _bookmarks: &'a [String],
        _impersonated_user: Option<&'a str>,
    ) -> BoxFuture<'a, DriverResult<String>> {
        // 단일 서버는 서버 측 기본 데이터베이스를 그대로 쓴다
        Box::pin(async move { Ok(String::new()) })
    }

    fn invalidate_reader<'a>(
        &'a self,
        _database: &'a str,
        server: &'a str,
    ) -> BoxFuture<'a, DriverResult<()>> {
        tracing::debug!(server, "direct router ignores reader invalidation");
        Box::pin(async move { Ok(()) })
    }

    fn invalidate_writer<'a>(
        &'a self,
        _database: &'a str,
        server: &'a str,
    ) -> BoxFuture<'a, DriverResult<()>> {
        tracing::debug!(server, "direct router ignores writer invalidation");
        Box::pin(async move { Ok(()) })
    }

    fn clean_up(&self) -> BoxFuture<'_, DriverResult<()>> {
        Box::pin(async move { Ok(()) })
    }
}

// ============================================================================
// Tests
// ============================================================================
