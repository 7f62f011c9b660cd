use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::protocol::codes::MessageCode;
use crate::protocol::error::{Result, StrataError};
use crate::protocol::messages::*;
use crate::transport::frame::Frame;

/// Mapping from message body types to the code they travel under.
///
/// Built once with [`MessageRegistry::builder`] and shared (behind an `Arc`)
/// by every codec that needs it. [`MessageRegistry::standard`] registers all
/// bodies defined in [`crate::protocol::messages`].
///
/// # Example
///
/// ```
/// use strata_common::protocol::{MessageCode, PingRequest, PingResponse};
/// use strata_common::transport::MessageRegistry;
///
/// let registry = MessageRegistry::builder()
///     .register::<PingRequest>(MessageCode::PingReq)
///     .register::<PingResponse>(MessageCode::PingResp)
///     .build();
///
/// assert_eq!(registry.code_of::<PingResponse>().unwrap(), MessageCode::PingResp);
/// ```
#[derive(Debug, Clone)]
pub struct MessageRegistry {
    codes: HashMap<TypeId, MessageCode>,
}

impl MessageRegistry {
    pub fn builder() -> MessageRegistryBuilder {
        MessageRegistryBuilder {
            codes: HashMap::new(),
        }
    }

    /// Registry containing every built-in message body.
    pub fn standard() -> Self {
        Self::builder()
            .register::<ErrorResponse>(MessageCode::ErrorResp)
            .register::<PingRequest>(MessageCode::PingReq)
            .register::<PingResponse>(MessageCode::PingResp)
            .register::<ServerInfoRequest>(MessageCode::GetServerInfoReq)
            .register::<ServerInfoResponse>(MessageCode::GetServerInfoResp)
            .register::<GetRequest>(MessageCode::GetReq)
            .register::<GetResponse>(MessageCode::GetResp)
            .register::<PutRequest>(MessageCode::PutReq)
            .register::<PutResponse>(MessageCode::PutResp)
            .register::<DeleteRequest>(MessageCode::DelReq)
            .register::<DeleteResponse>(MessageCode::DelResp)
            .register::<AuthRequest>(MessageCode::AuthReq)
            .register::<AuthResponse>(MessageCode::AuthResp)
            .register::<StartTls>(MessageCode::StartTls)
            .build()
    }

    /// Looks up the code registered for `M`.
    pub fn code_of<M: Message>(&self) -> Result<MessageCode> {
        self.codes
            .get(&TypeId::of::<M>())
            .copied()
            .ok_or(StrataError::UnregisteredMessage(type_name::<M>()))
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Accumulates registrations for a [`MessageRegistry`].
#[derive(Debug, Default)]
pub struct MessageRegistryBuilder {
    codes: HashMap<TypeId, MessageCode>,
}

impl MessageRegistryBuilder {
    /// Registers `M` under `code`. A later registration of the same type wins.
    pub fn register<M: Message>(mut self, code: MessageCode) -> Self {
        self.codes.insert(TypeId::of::<M>(), code);
        self
    }

    pub fn build(self) -> MessageRegistry {
        MessageRegistry { codes: self.codes }
    }
}

/// Body serialization format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CodecFormat {
    /// Compact binary encoding (default)
    #[default]
    Postcard,
    /// JSON, handy when inspecting traffic
    Json,
}

/// Encodes typed messages into frames and back.
///
/// Decoding checks the frame's code against the code registered for the
/// requested type; a mismatch is reported as `UnexpectedMessage`, except for
/// an `ErrorResp` frame which is turned into `StrataError::Server`.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    registry: Arc<MessageRegistry>,
    format: CodecFormat,
}

impl MessageCodec {
    pub fn new(registry: Arc<MessageRegistry>, format: CodecFormat) -> Self {
        Self { registry, format }
    }

    /// Codec over the standard registry using postcard.
    pub fn standard() -> Self {
        Self::new(Arc::new(MessageRegistry::standard()), CodecFormat::Postcard)
    }

    pub fn format(&self) -> CodecFormat {
        self.format
    }

    pub fn registry(&self) -> &MessageRegistry {
        &self.registry
    }

    pub fn code_of<M: Message>(&self) -> Result<MessageCode> {
        self.registry.code_of::<M>()
    }

    /// Encodes `message` into a frame tagged with its registered code.
    pub fn encode<M: Message>(&self, message: &M) -> Result<Frame> {
        let code = self.registry.code_of::<M>()?;
        let body = match self.format {
            CodecFormat::Postcard => postcard::to_allocvec(message)?,
            CodecFormat::Json => {
                let body = serde_json::to_vec(message)?;
                // Field-less bodies travel as tag-only frames in both formats
                if body == b"null" {
                    Vec::new()
                } else {
                    body
                }
            }
        };
        Ok(Frame::new(code, body))
    }

    /// Decodes `frame` as an `M`.
    pub fn decode<M: Message>(&self, frame: &Frame) -> Result<M> {
        let expected = self.registry.code_of::<M>()?;
        if frame.code != expected.as_u8() {
            if frame.code == MessageCode::ErrorResp.as_u8() && expected != MessageCode::ErrorResp {
                return Err(self.decode_error(frame));
            }
            return Err(StrataError::UnexpectedMessage {
                expected,
                actual: frame.code,
            });
        }
        self.decode_body(&frame.body)
    }

    /// Turns an `ErrorResp` frame into `StrataError::Server`.
    ///
    /// A body that cannot be decoded still yields a server error carrying
    /// the decode failure as its message.
    pub fn decode_error(&self, frame: &Frame) -> StrataError {
        match self.decode_body::<ErrorResponse>(&frame.body) {
            Ok(err) => StrataError::Server {
                code: err.code,
                message: err.message,
            },
            Err(e) => StrataError::Server {
                code: 0,
                message: format!("undecodable error response: {}", e),
            },
        }
    }

    fn decode_body<M: Message>(&self, body: &[u8]) -> Result<M> {
        match self.format {
            CodecFormat::Postcard => Ok(postcard::from_bytes(body)?),
            CodecFormat::Json if body.is_empty() => Ok(serde_json::from_slice(b"null")?),
            CodecFormat::Json => Ok(serde_json::from_slice(body)?),
        }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::standard()
    }
}
