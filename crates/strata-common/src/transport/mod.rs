//! Strata Transport Layer
//!
//! Framing, message codec and TLS for talking to a node.
//!
//! # Wire Format
//!
//! ```text
//! [4-byte length, u32 big-endian] [1-byte message code] [body]
//! ```
//!
//! # Components
//!
//! - **[`Frame`]**, [`read_frame`], [`write_frame`]: length-prefixed framing
//! - **[`MessageRegistry`]** / **[`MessageCodec`]**: typed bodies to frames and back
//! - **[`TlsConfig`]** / **[`TlsConnector`]**: rustls client handshake
//! - **[`FrameServer`]**: frame-level TCP server used as a fake node

pub mod codec;
pub mod frame;
pub mod server;
pub mod tls;

pub use codec::{CodecFormat, MessageCodec, MessageRegistry, MessageRegistryBuilder};
pub use frame::{map_io_error, read_frame, write_frame, Frame, MAX_FRAME_SIZE};
pub use server::FrameServer;
pub use tls::{ClientCertificate, TlsConfig, TlsConfigBuilder, TlsConnector};
