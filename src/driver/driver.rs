//! Driver
//!
//! 드라이버 인스턴스 및 설정

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::TcpStream;

use crate::bolt::codec::CodecFactory;
use crate::bolt::message::Auth;
use crate::bolt::{handshake, FramedIo};

use super::connection::Connection;
use super::error::{DriverError, DriverResult};
use super::pool::{Connect, ConnectionPool, PoolConfig};
use super::routing::{DirectRouter, Router};
use super::session::{Session, SessionConfig};

// ============================================================================
// AuthToken - 인증 토큰
// ============================================================================

/// 인증 토큰
#[derive(Debug, Clone, Default)]
pub enum AuthToken {
    /// 인증 없음
    #[default]
    None,
    /// Basic 인증 (사용자명/비밀번호)
    Basic {
        /// 사용자명
        username: String,
        /// 비밀번호
        password: String,
        /// Realm
        realm: Option<String>,
    },
    /// Bearer 토큰
    Bearer {
        /// 토큰
        token: String,
    },
    /// Kerberos 인증
    Kerberos {
        /// 티켓
        ticket: String,
    },
    /// 커스텀 인증
    Custom {
        /// 스킴
        scheme: String,
        /// 사용자명
        principal: String,
        /// 자격 증명
        credentials: String,
        /// Realm
        realm: Option<String>,
        /// 추가 파라미터
        parameters: HashMap<String, crate::bolt::Value>,
    },
}

impl AuthToken {
    /// Basic 인증 토큰 생성
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
            realm: None,
        }
    }

    /// Basic 인증 토큰 생성 (realm 포함)
    pub fn basic_with_realm(
        username: impl Into<String>,
        password: impl Into<String>,
        realm: impl Into<String>,
    ) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
            realm: Some(realm.into()),
        }
    }

    /// Bearer 토큰 생성
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer {
            token: token.into(),
        }
    }

    /// Kerberos 토큰 생성
    pub fn kerberos(ticket: impl Into<String>) -> Self {
        Self::Kerberos {
            ticket: ticket.into(),
        }
    }

    /// 인증 없음
    pub fn none() -> Self {
        Self::None
    }

    /// 인증 스킴
    pub fn scheme(&self) -> &str {
        match self {
            Self::None => "none",
            Self::Basic { .. } => "basic",
            Self::Bearer { .. } => "bearer",
            Self::Kerberos { .. } => "kerberos",
            Self::Custom { scheme, .. } => scheme,
        }
    }

    /// HELLO에 실리는 형태로 변환
    pub(crate) fn to_wire(&self) -> Auth {
        match self {
            Self::None => Auth::none(),
            Self::Basic {
                username,
                password,
                realm,
            } => {
                let mut auth = Auth::basic(username.clone(), password.clone());
                auth.realm = realm.clone();
                auth
            }
            Self::Bearer { token } => Auth::bearer(token.clone()),
            Self::Kerberos { ticket } => Auth::kerberos(ticket.clone()),
            Self::Custom {
                scheme,
                principal,
                credentials,
                realm,
                parameters,
            } => Auth {
                scheme: scheme.clone(),
                principal: Some(principal.clone()),
                credentials: Some(credentials.clone()),
                realm: realm.clone(),
                parameters: parameters.clone(),
            },
        }
    }
}

// ============================================================================
// ServerAddress - 서버 주소
// ============================================================================

/// 기본 Bolt 포트
pub const DEFAULT_PORT: u16 = 7687;

/// 서버 주소
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    /// 호스트
    pub host: String,
    /// 포트
    pub port: u16,
}

impl ServerAddress {
    /// 새 서버 주소 생성
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// URI에서 파싱 (bolt:// 또는 grafite:// 계열)
    pub fn from_uri(uri: &str) -> DriverResult<Self> {
        let uri = uri
            .trim_start_matches("bolt://")
            .trim_start_matches("bolt+s://")
            .trim_start_matches("bolt+ssc://")
            .trim_start_matches("grafite://")
            .trim_start_matches("grafite+s://")
            .trim_start_matches("grafite+ssc://");

        let parts: Vec<&str> = uri.split(':').collect();
        match parts.len() {
            1 => Ok(Self::new(parts[0], DEFAULT_PORT)),
            2 => {
                let port = parts[1]
                    .parse()
                    .map_err(|_| DriverError::usage("invalid port in server address"))?;
                Ok(Self::new(parts[0], port))
            }
            _ => Err(DriverError::usage("invalid server address")),
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ============================================================================
// DriverConfig - 드라이버 설정
// ============================================================================

/// 드라이버 설정
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// User Agent
    pub user_agent: String,
    /// 연결 풀 최대 크기
    pub max_connection_pool_size: usize,
    /// 연결 획득 타임아웃 (0 = 무제한)
    pub connection_acquisition_timeout: Duration,
    /// 최대 트랜잭션 재시도 시간
    pub max_transaction_retry_time: Duration,
    /// 소켓 연결 타임아웃
    pub socket_connect_timeout: Duration,
    /// 기본 Fetch Size (-1 = 전부)
    pub fetch_size: i64,
    /// 라우팅 컨텍스트 (있으면, 비어 있어도, 라우팅 인지로 선언)
    pub routing_context: Option<HashMap<String, String>>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("GrafiteDriver/{}", env!("CARGO_PKG_VERSION")),
            max_connection_pool_size: 100,
            connection_acquisition_timeout: Duration::from_secs(60),
            max_transaction_retry_time: Duration::from_secs(30),
            socket_connect_timeout: Duration::from_secs(5),
            fetch_size: 1000,
            routing_context: None,
        }
    }
}

impl DriverConfig {
    /// 빌더 시작
    pub fn builder() -> DriverConfigBuilder {
        DriverConfigBuilder::default()
    }
}

/// 드라이버 설정 빌더
#[derive(Debug, Default)]
pub struct DriverConfigBuilder {
    config: DriverConfig,
}

impl DriverConfigBuilder {
    /// User Agent 설정
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// 연결 풀 크기 설정
    pub fn with_max_connection_pool_size(mut self, size: usize) -> Self {
        self.config.max_connection_pool_size = size;
        self
    }

    /// 연결 획득 타임아웃 설정 (0 = 무제한)
    pub fn with_connection_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_acquisition_timeout = timeout;
        self
    }

    /// 최대 트랜잭션 재시도 시간 설정
    pub fn with_max_transaction_retry_time(mut self, time: Duration) -> Self {
        self.config.max_transaction_retry_time = time;
        self
    }

    /// 소켓 연결 타임아웃 설정
    pub fn with_socket_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.socket_connect_timeout = timeout;
        self
    }

    /// Fetch Size 설정
    pub fn with_fetch_size(mut self, fetch_size: i64) -> Self {
        self.config.fetch_size = fetch_size;
        self
    }

    /// 라우팅 컨텍스트 설정
    pub fn with_routing_context(mut self, context: HashMap<String, String>) -> Self {
        self.config.routing_context = Some(context);
        self
    }

    /// 빌드
    pub fn build(self) -> DriverConfig {
        self.config
    }
}

// ============================================================================
// TcpConnect - TCP 커넥터
// ============================================================================

/// TCP 연결 + 핸드셰이크 + HELLO를 수행하는 프로덕션 커넥터
///
/// The byte codec is an external collaborator, injected as a factory
/// producing one codec per connection.
pub struct TcpConnect {
    auth: AuthToken,
    user_agent: String,
    routing_context: Option<HashMap<String, String>>,
    connect_timeout: Duration,
    codec_factory: CodecFactory,
}

impl TcpConnect {
    /// 새 커넥터 생성
    pub fn new(auth: AuthToken, config: &DriverConfig, codec_factory: CodecFactory) -> Self {
        Self {
            auth,
            user_agent: config.user_agent.clone(),
            routing_context: config.routing_context.clone(),
            connect_timeout: config.socket_connect_timeout,
            codec_factory,
        }
    }
}

impl Connect for TcpConnect {
    type Io = FramedIo<TcpStream>;

    async fn connect(&self, address: &str) -> DriverResult<Connection<Self::Io>> {
        let dial = TcpStream::connect(address);
        let mut stream = tokio::time::timeout(self.connect_timeout, dial)
            .await
            .map_err(|_| {
                DriverError::timeout(format!("connecting to {} timed out", address))
            })?
            .map_err(|e| {
                DriverError::connectivity(format!("failed to connect to {}: {}", address, e))
            })?;
        stream.set_nodelay(true).ok();

        let version = handshake::negotiate(&mut stream).await?;
        let io = FramedIo::new(stream, version, (self.codec_factory)());
        Connection::connect(
            io,
            address,
            self.auth.to_wire(),
            &self.user_agent,
            self.routing_context.as_ref(),
        )
        .await
    }
}

impl fmt::Debug for TcpConnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnect")
            .field("scheme", &self.auth.scheme())
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

// ============================================================================
// Driver - 드라이버
// ============================================================================

/// 그래프 데이터베이스 드라이버
///
/// Owns the pool and the router and hands out sessions. Drivers are safe
/// to share across tasks; sessions are not.
pub struct Driver<C: Connect> {
    config: Arc<DriverConfig>,
    pool: Arc<ConnectionPool<C>>,
    router: Arc<dyn Router>,
    open: RwLock<bool>,
}

impl Driver<TcpConnect> {
    /// 단일 서버 드라이버 생성
    pub fn new(
        uri: &str,
        auth: AuthToken,
        codec_factory: CodecFactory,
    ) -> DriverResult<Driver<TcpConnect>> {
        Self::with_config(uri, auth, DriverConfig::default(), codec_factory)
    }

    /// 설정으로 드라이버 생성
    pub fn with_config(
        uri: &str,
        auth: AuthToken,
        config: DriverConfig,
        codec_factory: CodecFactory,
    ) -> DriverResult<Driver<TcpConnect>> {
        let address = ServerAddress::from_uri(uri)?;
        let connector = TcpConnect::new(auth, &config, codec_factory);
        let router = Arc::new(DirectRouter::new(address.to_string()));
        Ok(Self::with_parts(connector, router, config))
    }
}

impl<C: Connect> Driver<C> {
    /// 커넥터와 라우터를 직접 지정해 드라이버 생성
    pub fn with_parts(connector: C, router: Arc<dyn Router>, config: DriverConfig) -> Self {
        let pool = ConnectionPool::new(
            connector,
            PoolConfig {
                max_size: config.max_connection_pool_size,
            },
        );
        Self {
            config: Arc::new(config),
            pool: Arc::new(pool),
            router,
            open: RwLock::new(true),
        }
    }

    /// 세션 생성
    pub fn session(&self, config: SessionConfig) -> DriverResult<Session<C>> {
        self.ensure_open()?;
        Ok(Session::new(
            self.pool.clone(),
            self.router.clone(),
            &self.config,
            config,
        ))
    }

    /// 기본 설정으로 세션 생성
    pub fn default_session(&self) -> DriverResult<Session<C>> {
        self.session(SessionConfig::default())
    }

    /// 드라이버 설정
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// 드라이버 종료 - 유휴 연결 정리
    pub async fn close(&self) -> DriverResult<()> {
        {
            let mut open = self.open.write();
            if !*open {
                return Ok(());
            }
            *open = false;
        }
        self.pool.clean_up().await
    }

    fn ensure_open(&self) -> DriverResult<()> {
        if *self.open.read() {
            Ok(())
        } else {
            Err(DriverError::usage("driver is closed"))
        }
    }
}

impl<C: Connect> fmt::Debug for Driver<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("open", &*self.open.read())
            .field("pool", &self.pool)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
