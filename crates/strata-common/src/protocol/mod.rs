pub mod codes;
pub mod error;
pub mod messages;


pub use codes::MessageCode;
pub use error::{Result, StrataError};
pub use messages::{
    AuthRequest, AuthResponse, DeleteRequest, DeleteResponse, ErrorResponse, GetRequest,
    GetResponse, Message, PingRequest, PingResponse, PutRequest, PutResponse, ServerInfoRequest,
    ServerInfoResponse, StartTls,
};
