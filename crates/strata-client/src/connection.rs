use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use strata_common::auth::Credentials;
use strata_common::protocol::error::{Result, StrataError};
use strata_common::protocol::{AuthResponse, Message, PingRequest, PingResponse, StartTls};
use strata_common::transport::{read_frame, write_frame, Frame, MessageCodec, TlsConnector};

use crate::config::{NodeConfig, SecurityConfig};
use crate::pool::{Lease, ResourceFactory};

/// Byte stream a connection talks over: plain TCP or TLS on top of it.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Lifecycle of a [`Connection`]. `Inactive` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Active,
    Inactive,
}

/// Everything needed to open a connection to one node.
///
/// Shared by all connections of a node; the TLS connector inside is built
/// once so certificate files are read once.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub address: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub tls: Option<TlsConnector>,
    pub credentials: Option<Credentials>,
    pub codec: MessageCodec,
}

impl ConnectionSettings {
    /// Plain, unauthenticated settings with the default timeouts.
    pub fn new(address: impl Into<String>, codec: MessageCodec) -> Self {
        Self {
            address: address.into(),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(4),
            write_timeout: Duration::from_secs(4),
            tls: None,
            credentials: None,
            codec,
        }
    }

    pub fn for_node(node: &NodeConfig, security: &SecurityConfig, codec: MessageCodec) -> Result<Self> {
        let tls = security.tls().map(TlsConnector::new).transpose()?;

        Ok(Self {
            address: node.address(),
            connect_timeout: node.connect_timeout(),
            read_timeout: node.read_timeout(),
            write_timeout: node.write_timeout(),
            tls,
            credentials: security.credentials().cloned(),
            codec,
        })
    }
}

/// One framed session with a node.
///
/// Carries one request/response exchange at a time. Any transport failure
/// during an exchange closes the connection, as does a reply whose message
/// code does not match the expected response; an `ErrorResp` reply leaves
/// it usable.
pub struct Connection {
    settings: Arc<ConnectionSettings>,
    stream: Option<Box<dyn AsyncStream>>,
    state: ConnectionState,
    last_activity: Instant,
    exchange_pending: bool,
}

impl Connection {
    pub fn new(settings: Arc<ConnectionSettings>) -> Self {
        Self {
            settings,
            stream: None,
            state: ConnectionState::Created,
            last_activity: Instant::now(),
            exchange_pending: false,
        }
    }

    /// Creates and connects in one step.
    pub async fn open(settings: Arc<ConnectionSettings>) -> Result<Self> {
        let mut connection = Self::new(settings);
        connection.connect().await?;
        Ok(connection)
    }

    /// Opens the socket, then negotiates TLS and authenticates when
    /// configured. A failure at any step leaves the connection `Inactive`.
    pub async fn connect(&mut self) -> Result<()> {
        if self.state != ConnectionState::Created {
            return Err(StrataError::Connection(format!(
                "connection to {} is {:?} and cannot be reopened",
                self.settings.address, self.state
            )));
        }

        match establish(&self.settings).await {
            Ok(stream) => {
                self.stream = Some(stream);
                self.state = ConnectionState::Active;
                self.last_activity = Instant::now();
                debug!(address = %self.settings.address, "connection established");
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Inactive;
                Err(e)
            }
        }
    }

    /// Sends `request` and decodes the reply as `Resp`.
    pub async fn execute<Req, Resp>(&mut self, request: &Req) -> Result<Resp>
    where
        Req: Message,
        Resp: Message,
    {
        let frame = self.settings.codec.encode(request)?;
        let reply = self.exchange(&frame).await?;

        let decoded = self.settings.codec.decode::<Resp>(&reply);
        if let Err(e @ StrataError::UnexpectedMessage { .. }) = &decoded {
            debug!(address = %self.settings.address, error = %e, "protocol mismatch, closing connection");
            self.close();
        }
        decoded
    }

    /// Writes one frame and reads the reply frame.
    pub async fn exchange(&mut self, request: &Frame) -> Result<Frame> {
        if self.state != ConnectionState::Active {
            return Err(self.not_active());
        }
        let write_timeout = self.settings.write_timeout;
        let read_timeout = self.settings.read_timeout;
        let Some(stream) = self.stream.as_mut() else {
            return Err(self.not_active());
        };

        // Stays set if this future is dropped mid-exchange
        self.exchange_pending = true;
        let result = round_trip(stream, request, write_timeout, read_timeout).await;

        match &result {
            Ok(_) => {
                self.exchange_pending = false;
                self.last_activity = Instant::now();
            }
            Err(e) => {
                debug!(address = %self.settings.address, error = %e, "exchange failed, closing connection");
                self.close();
            }
        }
        result
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.execute::<PingRequest, PingResponse>(&PingRequest).await?;
        Ok(())
    }

    /// Drops the socket. The connection cannot be used afterwards.
    pub fn close(&mut self) {
        if self.state != ConnectionState::Inactive {
            debug!(address = %self.settings.address, "connection closed");
        }
        self.state = ConnectionState::Inactive;
        self.stream = None;
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn address(&self) -> &str {
        &self.settings.address
    }

    pub fn codec(&self) -> &MessageCodec {
        &self.settings.codec
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Active and not left in the middle of an exchange.
    pub fn is_reusable(&self) -> bool {
        self.state == ConnectionState::Active && !self.exchange_pending
    }

    fn not_active(&self) -> StrataError {
        StrataError::Connection(format!(
            "connection to {} is not active ({:?})",
            self.settings.address, self.state
        ))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.settings.address)
            .field("state", &self.state)
            .field("idle_for", &self.idle_for())
            .field("exchange_pending", &self.exchange_pending)
            .finish()
    }
}

async fn establish(settings: &ConnectionSettings) -> Result<Box<dyn AsyncStream>> {
    let tcp = tokio::time::timeout(settings.connect_timeout, TcpStream::connect(&settings.address))
        .await
        .map_err(|_| timeout_error(settings.connect_timeout))?
        .map_err(|e| StrataError::Connection(format!("Failed to connect to {}: {}", settings.address, e)))?;
    tcp.set_nodelay(true)?;

    let mut stream: Box<dyn AsyncStream> = match &settings.tls {
        Some(tls) => {
            let mut tcp = tcp;
            negotiate::<_, StartTls, StartTls>(settings, &mut tcp, &StartTls).await?;
            let tls_stream = tokio::time::timeout(settings.connect_timeout, tls.connect(tcp))
                .await
                .map_err(|_| timeout_error(settings.connect_timeout))??;
            Box::new(tls_stream)
        }
        None => Box::new(tcp),
    };

    if let Some(credentials) = &settings.credentials {
        negotiate::<_, _, AuthResponse>(settings, &mut stream, &credentials.to_request())
            .await
            .map_err(|e| match e {
                StrataError::Server { message, .. } => StrataError::Authentication(message),
                other => other,
            })?;
        debug!(address = %settings.address, user = credentials.username(), "authenticated");
    }

    Ok(stream)
}

/// One request/reply exchange during connection setup.
async fn negotiate<S, Req, Resp>(settings: &ConnectionSettings, stream: &mut S, request: &Req) -> Result<Resp>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    Req: Message,
    Resp: Message,
{
    let frame = settings.codec.encode(request)?;
    let reply = round_trip(stream, &frame, settings.write_timeout, settings.read_timeout).await?;
    settings.codec.decode(&reply)
}

async fn round_trip<S>(stream: &mut S, request: &Frame, write_timeout: Duration, read_timeout: Duration) -> Result<Frame>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    tokio::time::timeout(write_timeout, write_frame(stream, request))
        .await
        .map_err(|_| timeout_error(write_timeout))??;

    tokio::time::timeout(read_timeout, read_frame(stream))
        .await
        .map_err(|_| timeout_error(read_timeout))?
}

fn timeout_error(after: Duration) -> StrataError {
    StrataError::Timeout(after.as_millis() as u64)
}

/// Builds connections for a node's pool.
#[derive(Debug, Clone)]
pub struct ConnectionFactory {
    settings: Arc<ConnectionSettings>,
}

impl ConnectionFactory {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }
}

#[async_trait]
impl ResourceFactory for ConnectionFactory {
    type Resource = Connection;
    type Error = StrataError;

    async fn build(&self) -> Result<Connection> {
        Connection::open(self.settings.clone()).await
    }

    fn destroy(&self, mut connection: Connection) {
        connection.close();
    }

    fn is_reusable(&self, connection: &Connection) -> bool {
        connection.is_reusable()
    }
}

/// A pooled connection checked out past a single call.
pub type ConnectionLease = Lease<ConnectionFactory>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use strata_common::protocol::{AuthRequest, ErrorResponse, GetResponse, MessageCode};
    use strata_common::transport::FrameServer;

    async fn fake_node<F>(reply: F) -> SocketAddr
    where
        F: Fn(Frame) -> Option<Frame> + Send + Sync + 'static,
    {
        let server = FrameServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let reply = Arc::new(reply);
        server.spawn_with_handler(move |frame| {
            let reply = reply.clone();
            async move { reply(frame) }
        });
        addr
    }

    fn settings(addr: SocketAddr) -> Arc<ConnectionSettings> {
        Arc::new(ConnectionSettings::new(addr.to_string(), MessageCodec::standard()))
    }

    fn pong(frame: Frame) -> Option<Frame> {
        assert_eq!(frame.code, MessageCode::PingReq.as_u8());
        Some(Frame::empty(MessageCode::PingResp))
    }

    #[tokio::test]
    async fn test_connect_and_ping() {
        let addr = fake_node(pong).await;
        let mut connection = Connection::new(settings(addr));
        assert_eq!(connection.state(), ConnectionState::Created);

        connection.connect().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Active);

        connection.ping().await.unwrap();
        connection.ping().await.unwrap();
        assert!(connection.is_reusable());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut connection = Connection::new(settings(addr));
        let err = connection.connect().await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(connection.state(), ConnectionState::Inactive);
    }

    #[tokio::test]
    async fn test_connection_cannot_be_reopened() {
        let addr = fake_node(pong).await;
        let mut connection = Connection::open(settings(addr)).await.unwrap();
        assert!(connection.connect().await.is_err());

        connection.close();
        assert_eq!(connection.state(), ConnectionState::Inactive);
        assert!(connection.connect().await.is_err());
        assert!(connection.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_unexpected_message_closes_connection() {
        let addr = fake_node(|_| {
            let codec = MessageCodec::standard();
            codec.encode(&GetResponse { value: None }).ok()
        })
        .await;

        let mut connection = Connection::open(settings(addr)).await.unwrap();
        let err = connection.ping().await.unwrap_err();

        assert!(matches!(err, StrataError::UnexpectedMessage { expected: MessageCode::PingResp, .. }));
        assert_eq!(connection.state(), ConnectionState::Inactive);
    }

    #[tokio::test]
    async fn test_error_response_keeps_connection() {
        let addr = fake_node(|_| {
            let codec = MessageCodec::standard();
            codec.encode(&ErrorResponse::new(404, "not found")).ok()
        })
        .await;

        let mut connection = Connection::open(settings(addr)).await.unwrap();
        let err = connection.ping().await.unwrap_err();

        assert!(matches!(err, StrataError::Server { code: 404, .. }));
        assert!(!err.is_transport());
        assert!(connection.is_reusable());
    }

    #[tokio::test]
    async fn test_peer_close_marks_inactive() {
        let addr = fake_node(|_| None).await;

        let mut connection = Connection::open(settings(addr)).await.unwrap();
        let err = connection.ping().await.unwrap_err();

        assert!(err.is_transport());
        assert_eq!(connection.state(), ConnectionState::Inactive);
        assert!(!connection.is_reusable());
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let server = FrameServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        server.spawn_with_handler(|_| async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Some(Frame::empty(MessageCode::PingResp))
        });

        let mut settings = ConnectionSettings::new(addr.to_string(), MessageCodec::standard());
        settings.read_timeout = Duration::from_millis(50);
        let mut connection = Connection::open(Arc::new(settings)).await.unwrap();

        let err = connection.ping().await.unwrap_err();
        assert!(matches!(err, StrataError::Timeout(50)));
        assert_eq!(connection.state(), ConnectionState::Inactive);
    }

    #[tokio::test]
    async fn test_interrupted_exchange_is_not_reusable() {
        let server = FrameServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        server.spawn_with_handler(|_| async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Some(Frame::empty(MessageCode::PingResp))
        });

        let mut connection = Connection::open(settings(addr)).await.unwrap();
        let interrupted = tokio::time::timeout(Duration::from_millis(50), connection.ping()).await;

        assert!(interrupted.is_err());
        assert_eq!(connection.state(), ConnectionState::Active);
        assert!(!connection.is_reusable());
    }

    fn auth_node(expected: Credentials) -> impl Fn(Frame) -> Option<Frame> + Send + Sync + 'static {
        move |frame| {
            let codec = MessageCodec::standard();
            match frame.message_code().ok()? {
                MessageCode::AuthReq => {
                    let request: AuthRequest = codec.decode(&frame).ok()?;
                    if expected.verify(&request.user, &request.password) {
                        Some(Frame::empty(MessageCode::AuthResp))
                    } else {
                        codec.encode(&ErrorResponse::new(401, "bad credentials")).ok()
                    }
                }
                MessageCode::PingReq => Some(Frame::empty(MessageCode::PingResp)),
                _ => None,
            }
        }
    }

    #[tokio::test]
    async fn test_authentication_exchange() {
        let addr = fake_node(auth_node(Credentials::new("riak", "secret"))).await;

        let mut good = ConnectionSettings::new(addr.to_string(), MessageCodec::standard());
        good.credentials = Some(Credentials::new("riak", "secret"));
        let mut connection = Connection::open(Arc::new(good)).await.unwrap();
        connection.ping().await.unwrap();

        let mut bad = ConnectionSettings::new(addr.to_string(), MessageCodec::standard());
        bad.credentials = Some(Credentials::new("riak", "wrong"));
        let err = Connection::open(Arc::new(bad)).await.unwrap_err();
        assert!(matches!(err, StrataError::Authentication(ref msg) if msg == "bad credentials"));
    }

    #[tokio::test]
    async fn test_factory_builds_and_destroys() {
        let addr = fake_node(pong).await;
        let factory = ConnectionFactory::new(ConnectionSettings::new(addr.to_string(), MessageCodec::standard()));

        let connection = factory.build().await.unwrap();
        assert!(factory.is_reusable(&connection));
        factory.destroy(connection);
    }
}
