use std::fmt;

use super::error::StrataError;

/// One-byte message type tag carried by every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageCode {
    ErrorResp = 0,
    PingReq = 1,
    PingResp = 2,
    GetServerInfoReq = 7,
    GetServerInfoResp = 8,
    GetReq = 9,
    GetResp = 10,
    PutReq = 11,
    PutResp = 12,
    DelReq = 13,
    DelResp = 14,
    AuthReq = 253,
    AuthResp = 254,
    StartTls = 255,
}

impl MessageCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageCode {
    type Error = StrataError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let code = match value {
            0 => MessageCode::ErrorResp,
            1 => MessageCode::PingReq,
            2 => MessageCode::PingResp,
            7 => MessageCode::GetServerInfoReq,
            8 => MessageCode::GetServerInfoResp,
            9 => MessageCode::GetReq,
            10 => MessageCode::GetResp,
            11 => MessageCode::PutReq,
            12 => MessageCode::PutResp,
            13 => MessageCode::DelReq,
            14 => MessageCode::DelResp,
            253 => MessageCode::AuthReq,
            254 => MessageCode::AuthResp,
            255 => MessageCode::StartTls,
            other => {
                return Err(StrataError::MalformedFrame(format!(
                    "unknown message code {}",
                    other
                )))
            }
        };
        Ok(code)
    }
}

impl fmt::Display for MessageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_u8())
    }
}
