//! Strata Common Types and Transport
//!
//! Protocol definitions and the framed TCP transport shared by the Strata
//! client and its tooling.
//!
//! # Architecture
//!
//! Nodes speak a length-prefixed binary protocol:
//! - **Transport**: TCP, optionally upgraded to TLS after a `StartTls` exchange
//! - **Message Format**: `[4-byte length as u32 big-endian] [1-byte message code] [body]`
//! - **Serialization**: postcard by default, JSON as an alternative codec
//! - **Max Frame Size**: 64 MiB
//!
//! # Components
//!
//! - [`protocol`] - message codes, message bodies and the error type
//! - [`transport`] - framing, codec, TLS and a small frame server
//! - [`auth`] - credentials sent during connection setup
//!
//! # Example
//!
//! ```
//! use strata_common::{MessageCode, PingRequest};
//! use strata_common::transport::MessageCodec;
//!
//! let codec = MessageCodec::standard();
//! let frame = codec.encode(&PingRequest).unwrap();
//! assert_eq!(frame.message_code().unwrap(), MessageCode::PingReq);
//! assert_eq!(frame.wire_len(), 1);
//! ```

pub mod auth;
pub mod protocol;
pub mod transport;

pub use protocol::*;
