//! Friendsend Core Library
//!
//! 基于好友网络的可靠文件/目录传输核心库
//!
//! # 模块
//!
//! - **transport**: 原生传输接口、桥接层（泵线程 + 调度线程）、流控窗口、进程内传输
//! - **transfer**: 传输协调引擎、路径校验、进度跟踪
//! - **config**: 设置的加载与保存
//! - **logging**: 日志级别与进程级开关
//!
//! # 使用示例
//!
//! ## 发送目录
//!
//! ```ignore
//! use friendsend_core::{Bridge, BridgeConfig, EngineConfig, MemoryNetwork, NativeError, PeerId, TransferEngine};
//!
//! // 1. 在泵线程上构造传输并启动桥接层
//! let network = MemoryNetwork::new(Duration::from_millis(20));
//! let node = network.node("nas");
//! let bridge = Bridge::spawn(move || Ok::<_, NativeError>(node), BridgeConfig::default())?;
//!
//! // 2. 启动传输引擎并注册为文件事件处理器
//! let engine = TransferEngine::attach(bridge.handle(), EngineConfig::new("/srv/share"))?;
//!
//! // 3. 把目录发给好友
//! let report = engine.send_path(PeerId(0), "photos").await?;
//! ```
//!
//! ## 接收文件
//!
//! ```ignore
//! // 引擎注册后自动接受好友提供的文件，保存到接收目录
//! let config = EngineConfig {
//!     receive_dir: Some("/srv/inbox".into()),
//!     ..EngineConfig::new("/srv/share")
//! };
//! let engine = TransferEngine::attach(bridge.handle(), config)?;
//! ```

pub mod config;
pub mod logging;
pub mod transfer;
pub mod transport;
mod util;

// Config re-exports
pub use config::{Settings, WindowSettings};

// Logging re-exports
pub use logging::LogLevel;

// Transport re-exports
pub use transport::{
    Address, Bridge, BridgeConfig, BridgeHandle, Connection, FileControl, FileEvents, FileInfo,
    FriendEvents, MemoryNetwork, MemoryTransport, NativeError, Pending, PeerId, PublicKey,
    TransferId, Transport, TransportError,
};

// Transfer re-exports
pub use transfer::{
    EngineConfig, SendReport, TransferCommands, TransferEngine, TransferError, TransferSummary,
};
