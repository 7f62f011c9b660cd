use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::codes::MessageCode;
use crate::protocol::error::{Result, StrataError};

/// Largest frame accepted from the wire (64 MB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// One protocol frame: a message code plus its opaque body.
///
/// # Wire Format
///
/// ```text
/// [4-byte length, u32 big-endian] [1-byte message code] [body]
/// ```
///
/// The length covers the code byte and the body, so a tag-only message such
/// as a ping is sent with a length of 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u8,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(code: MessageCode, body: Vec<u8>) -> Self {
        Self {
            code: code.as_u8(),
            body,
        }
    }

    /// A frame with no body.
    pub fn empty(code: MessageCode) -> Self {
        Self::new(code, Vec::new())
    }

    /// Parses the code byte, failing on codes this client does not know.
    pub fn message_code(&self) -> Result<MessageCode> {
        MessageCode::try_from(self.code)
    }

    /// Value of the length prefix for this frame.
    pub fn wire_len(&self) -> usize {
        self.body.len() + 1
    }

    /// Serializes the frame including its length prefix.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.wire_len());
        buf.extend_from_slice(&(self.wire_len() as u32).to_be_bytes());
        buf.push(self.code);
        buf.extend_from_slice(&self.body);
        buf
    }
}

/// Writes one frame and flushes the stream.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if frame.wire_len() > MAX_FRAME_SIZE {
        return Err(StrataError::FrameTooLarge {
            size: frame.wire_len(),
            max: MAX_FRAME_SIZE,
        });
    }

    // Single write keeps the prefix and body in one segment for small frames
    writer
        .write_all(&frame.to_bytes())
        .await
        .map_err(|e| map_io_error(e, "writing frame"))?;

    writer
        .flush()
        .await
        .map_err(|e| map_io_error(e, "flushing stream"))?;

    Ok(())
}

/// Reads one frame.
///
/// # Errors
///
/// - `MalformedFrame` if the length prefix is zero
/// - `FrameTooLarge` if the length prefix exceeds [`MAX_FRAME_SIZE`]
/// - `Connection` / `Timeout` / `Io` if the stream fails mid-frame
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| map_io_error(e, "reading length prefix"))?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(StrataError::MalformedFrame(
            "length prefix of zero has no room for a message code".to_string(),
        ));
    }
    if len > MAX_FRAME_SIZE {
        return Err(StrataError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| map_io_error(e, "reading frame body"))?;

    let body = buf.split_off(1);
    Ok(Frame { code: buf[0], body })
}

/// Map IO errors to the matching `StrataError` variant
///
/// - Socket timeouts/would block -> `Connection` (no known duration for `Timeout`)
/// - Peer went away -> `Connection`
/// - Other IO errors -> `Io`
pub fn map_io_error(err: std::io::Error, context: &str) -> StrataError {
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            StrataError::Connection(format!("{}: timed out", context))
        }
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::UnexpectedEof => {
            StrataError::Connection(format!("{}: connection lost", context))
        }
        _ => StrataError::Io(err),
    }
}
