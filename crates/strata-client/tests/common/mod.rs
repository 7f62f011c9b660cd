//! Fake Strata nodes for integration tests.
//!
//! Each fake node is a real loopback `FrameServer` answering the standard
//! message set from an in-memory store. It can be switched "down", in which
//! case it closes the connection on the next frame it receives.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use strata_client::{NodeConfig, NodeConfigBuilder};
use strata_common::protocol::{
    DeleteRequest, DeleteResponse, ErrorResponse, GetRequest, GetResponse, MessageCode, PutRequest,
    PutResponse, ServerInfoResponse,
};
use strata_common::transport::{CodecFormat, Frame, FrameServer, MessageCodec, MessageRegistry};

type Store = Mutex<HashMap<(String, Vec<u8>), Vec<u8>>>;

pub struct FakeNode {
    pub addr: SocketAddr,
    up: Arc<AtomicBool>,
    frames: Arc<AtomicUsize>,
}

impl FakeNode {
    /// Fake node speaking postcard bodies.
    pub async fn start() -> Self {
        Self::start_with_format(CodecFormat::Postcard).await
    }

    pub async fn start_with_format(format: CodecFormat) -> Self {
        let codec = MessageCodec::new(Arc::new(MessageRegistry::standard()), format);
        let store: Arc<Store> = Arc::new(Mutex::new(HashMap::new()));
        Self::with_handler(move |frame| respond(&codec, &store, frame)).await
    }

    /// Fake node answering every frame with `handler`.
    pub async fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(Frame) -> Option<Frame> + Send + Sync + 'static,
    {
        init_tracing();
        let server = FrameServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let up = Arc::new(AtomicBool::new(true));
        let frames = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(handler);

        {
            let up = up.clone();
            let frames = frames.clone();
            server.spawn_with_handler(move |frame| {
                frames.fetch_add(1, Ordering::SeqCst);
                let reply = if up.load(Ordering::SeqCst) { handler(frame) } else { None };
                async move { reply }
            });
        }

        Self { addr, up, frames }
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    /// Frames received so far, across all connections.
    pub fn frames(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }

    /// Node config pointing at this fake, with a health interval long enough
    /// to stay out of the way unless a test shortens it.
    pub fn config(&self) -> NodeConfigBuilder {
        node_config(self.addr)
    }
}

pub fn node_config(addr: SocketAddr) -> NodeConfigBuilder {
    NodeConfig::builder(addr.ip().to_string(), addr.port())
        .min_connections(1)
        .max_connections(1)
        .connect_timeout(Duration::from_secs(1))
        .read_timeout(Duration::from_secs(1))
        .write_timeout(Duration::from_secs(1))
        .acquire_timeout(Duration::from_millis(500))
        .health_check_interval(Duration::from_secs(60))
        .health_check_timeout(Duration::from_millis(500))
}

/// Routes client logs to the test harness; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_test_writer()
        .try_init();
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Polls `check` every 10ms until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

fn respond(codec: &MessageCodec, store: &Store, frame: Frame) -> Option<Frame> {
    match frame.message_code().ok()? {
        MessageCode::PingReq => Some(Frame::empty(MessageCode::PingResp)),
        MessageCode::GetServerInfoReq => codec
            .encode(&ServerInfoResponse {
                node: Some("fake@127.0.0.1".to_string()),
                server_version: Some("2.1.0".to_string()),
            })
            .ok(),
        MessageCode::GetReq => {
            let request: GetRequest = codec.decode(&frame).ok()?;
            let value = store.lock().get(&(request.bucket, request.key)).cloned();
            codec.encode(&GetResponse { value }).ok()
        }
        MessageCode::PutReq => {
            let request: PutRequest = codec.decode(&frame).ok()?;
            if request.bucket.is_empty() {
                return codec.encode(&ErrorResponse::new(400, "bucket must not be empty")).ok();
            }
            store.lock().insert((request.bucket, request.key), request.value);
            codec.encode(&PutResponse).ok()
        }
        MessageCode::DelReq => {
            let request: DeleteRequest = codec.decode(&frame).ok()?;
            store.lock().remove(&(request.bucket, request.key));
            codec.encode(&DeleteResponse).ok()
        }
        _ => codec.encode(&ErrorResponse::new(1, "unsupported message")).ok(),
    }
}
