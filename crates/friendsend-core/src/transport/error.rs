//! 传输层错误类型

use std::fmt;

use crate::transport::native::NativeError;

/// 可注册的事件处理器种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Friend,
    File,
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerKind::Friend => f.write_str("friend events"),
            HandlerKind::File => f.write_str("file events"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// 底层传输调用失败，携带原生错误码
    #[error("{message}, errc = {code}")]
    Protocol { code: i32, message: String },

    #[error("Transport bridge has shut down")]
    Shutdown,

    #[error("{0} handler already registered")]
    AlreadyRegistered(HandlerKind),

    #[error("{0} handler not registered")]
    NotRegistered(HandlerKind),

    #[error("Trying to unregister an unrelated {0} handler")]
    HandlerMismatch(HandlerKind),

    #[error("Incompatible transport: {what} size is {actual}, expected {expected}")]
    Incompatible {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("No save file configured")]
    NoSaveFile,

    #[error("Transport construction failed: {0}")]
    Construction(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// 原生错误码（仅协议错误有）
    pub fn code(&self) -> Option<i32> {
        match self {
            TransportError::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<NativeError> for TransportError {
    fn from(err: NativeError) -> Self {
        TransportError::Protocol {
            code: err.code,
            message: err.message,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("Address is unexpected length: expected {expected} characters, but got {actual}")]
    Length { expected: usize, actual: usize },

    #[error("Address contains non-hex characters: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("Address checksum mismatch")]
    Checksum,
}
