use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::error::{Result, StrataError};
use crate::transport::frame::{read_frame, write_frame, Frame};

/// Minimal frame-level TCP server.
///
/// Each accepted connection is served on its own task: every incoming frame
/// is passed to the handler and the returned frame is written back. A
/// handler returning `None` closes the connection without replying, which
/// is how fake nodes in tests simulate a peer dropping the socket.
pub struct FrameServer {
    listener: TcpListener,
}

impl FrameServer {
    /// Binds a server to the given address (e.g. `"127.0.0.1:0"`).
    pub async fn bind(bind_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| StrataError::Connection(format!("Failed to bind to {}: {}", bind_addr, e)))?;

        Ok(Self { listener })
    }

    /// Gets the actual bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| StrataError::Connection(format!("Failed to get local addr: {}", e)))
    }

    /// Accepts connections forever, answering frames with `handler`.
    pub async fn run_with_handler<F, Fut>(self, handler: F) -> Result<()>
    where
        F: Fn(Frame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Frame>> + Send + 'static,
    {
        let handler = Arc::new(handler);

        loop {
            let (stream, peer_addr) = self
                .listener
                .accept()
                .await
                .map_err(|e| StrataError::Connection(format!("Failed to accept connection: {}", e)))?;

            debug!(peer = %peer_addr, "accepted connection");

            let handler = handler.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, handler).await {
                    debug!(peer = %peer_addr, error = %e, "connection ended with error");
                }
            });
        }
    }

    /// Runs the server on a background task.
    pub fn spawn_with_handler<F, Fut>(self, handler: F) -> JoinHandle<Result<()>>
    where
        F: Fn(Frame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Frame>> + Send + 'static,
    {
        tokio::spawn(async move {
            let result = self.run_with_handler(handler).await;
            if let Err(e) = &result {
                warn!(error = %e, "frame server stopped");
            }
            result
        })
    }
}

/// Serves frames on one connection until the peer leaves or the handler
/// asks to close.
async fn handle_connection<F, Fut>(mut stream: TcpStream, handler: Arc<F>) -> Result<()>
where
    F: Fn(Frame) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Frame>> + Send + 'static,
{
    loop {
        let request = match read_frame(&mut stream).await {
            Ok(frame) => frame,
            // Peer closed between frames
            Err(StrataError::Connection(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        match handler(request).await {
            Some(response) => write_frame(&mut stream, &response).await?,
            None => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageCode;

    #[tokio::test]
    async fn test_frame_server_bind() {
        let server = FrameServer::bind("127.0.0.1:0").await.unwrap();
        assert!(server.local_addr().is_ok());
    }

    #[tokio::test]
    async fn test_frame_server_echoes_ping() {
        let server = FrameServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        server.spawn_with_handler(|frame| async move {
            assert_eq!(frame.code, MessageCode::PingReq.as_u8());
            Some(Frame::empty(MessageCode::PingResp))
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut stream, &Frame::empty(MessageCode::PingReq))
            .await
            .unwrap();
        let reply = read_frame(&mut stream).await.unwrap();
        assert_eq!(reply, Frame::empty(MessageCode::PingResp));
    }

    #[tokio::test]
    async fn test_frame_server_closes_on_none() {
        let server = FrameServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        server.spawn_with_handler(|_| async move { None });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut stream, &Frame::empty(MessageCode::PingReq))
            .await
            .unwrap();
        let err = read_frame(&mut stream).await.unwrap_err();
        assert!(err.is_transport());
    }
}
