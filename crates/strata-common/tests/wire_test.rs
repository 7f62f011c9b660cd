//! Wire Integration Tests
//!
//! Typed request/response exchanges over loopback TCP, for both body
//! formats, through `FrameServer`.

use std::sync::Arc;

use strata_common::protocol::error::StrataError;
use strata_common::protocol::{ErrorResponse, GetRequest, GetResponse};
use strata_common::transport::{read_frame, write_frame, CodecFormat, FrameServer, MessageCodec, MessageRegistry};
use tokio::net::TcpStream;

async fn echo_value_server(codec: MessageCodec) -> std::net::SocketAddr {
    let server = FrameServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    server.spawn_with_handler(move |frame| {
        let codec = codec.clone();
        async move {
            let request: GetRequest = match codec.decode(&frame) {
                Ok(request) => request,
                Err(e) => return codec.encode(&ErrorResponse::new(2, e.to_string())).ok(),
            };
            if request.bucket == "missing" {
                return codec.encode(&ErrorResponse::new(404, "no such bucket")).ok();
            }
            codec.encode(&GetResponse { value: Some(request.key) }).ok()
        }
    });
    addr
}

async fn get(codec: &MessageCodec, stream: &mut TcpStream, bucket: &str) -> Result<GetResponse, StrataError> {
    let request = GetRequest {
        bucket: bucket.to_string(),
        key: b"alice".to_vec(),
    };
    write_frame(stream, &codec.encode(&request)?).await?;
    let reply = read_frame(stream).await?;
    codec.decode(&reply)
}

#[tokio::test]
async fn test_typed_exchange_postcard() {
    let codec = MessageCodec::standard();
    let addr = echo_value_server(codec.clone()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let response = get(&codec, &mut stream, "users").await.unwrap();
    assert_eq!(response.value, Some(b"alice".to_vec()));

    // Same connection, second exchange
    let response = get(&codec, &mut stream, "users").await.unwrap();
    assert_eq!(response.value, Some(b"alice".to_vec()));
}

#[tokio::test]
async fn test_typed_exchange_json() {
    let codec = MessageCodec::new(Arc::new(MessageRegistry::standard()), CodecFormat::Json);
    let addr = echo_value_server(codec.clone()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let response = get(&codec, &mut stream, "users").await.unwrap();
    assert_eq!(response.value, Some(b"alice".to_vec()));
}

#[tokio::test]
async fn test_error_reply_decodes_to_server_error() {
    let codec = MessageCodec::standard();
    let addr = echo_value_server(codec.clone()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let err = get(&codec, &mut stream, "missing").await.unwrap_err();
    assert!(matches!(err, StrataError::Server { code: 404, ref message } if message == "no such bucket"));
    assert!(!err.is_transport());
}

#[tokio::test]
async fn test_mismatched_formats_fail_to_decode() {
    let server_codec = MessageCodec::new(Arc::new(MessageRegistry::standard()), CodecFormat::Json);
    let addr = echo_value_server(server_codec).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // The server cannot read the body and answers with an error frame the
    // client cannot decode either; it still surfaces as a server error
    let err = get(&MessageCodec::standard(), &mut stream, "users").await.unwrap_err();
    assert!(matches!(err, StrataError::Server { .. }));
}
