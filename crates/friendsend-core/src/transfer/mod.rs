//! 文件传输模块
//!
//! 包含:
//! - 传输协调引擎（单一变更线程持有所有传输状态）
//! - 发送路径校验与目录遍历
//! - 进度跟踪

pub mod engine;
pub mod error;
pub mod path;
pub mod progress;
pub mod state;

#[cfg(test)]
mod tests;

pub use engine::{
    EngineConfig, FailedOffer, OfferedFile, SendReport, TransferCommands, TransferEngine,
};
pub use error::TransferError;
pub use progress::Progress;
pub use state::{Activity, Direction, TransferSummary};
