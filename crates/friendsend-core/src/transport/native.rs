//! 原生传输边界
//!
//! 底层好友网络（发现、握手、加密）被视为一个不可重入的事件源:
//! 只能在单一线程上调用，通过 [`Transport::pump_once`] 驱动回调。
//! 桥接层 ([`crate::transport::Bridge`]) 是唯一调用这些接口的地方。

use std::time::Duration;

use crate::transport::types::{
    Address, ChunkRequest, Connection, FileChunk, FileControl, FileInfo, MessageId, PeerId,
    PublicKey, TransferId,
};

/// 原生调用失败时返回的错误码和描述
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}, errc = {code}")]
pub struct NativeError {
    pub code: i32,
    pub message: String,
}

impl NativeError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// 事件泵回调产生的原生事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeEvent {
    FriendRequest { key: PublicKey, message: String },
    FriendMessage { peer: PeerId, text: String },
    FriendName { peer: PeerId, name: String },
    FriendStatus { peer: PeerId, status: String },
    FileOffered { id: TransferId, info: FileInfo },
    FileControl { id: TransferId, control: FileControl },
    ChunkRequested { id: TransferId, request: ChunkRequest },
    ChunkReceived { id: TransferId, chunk: FileChunk },
}

/// 底层传输接口
///
/// 实现不需要是 `Send` 的: 桥接层在泵线程上通过工厂闭包构造它，
/// 之后它再也不会离开该线程。
pub trait Transport {
    /// 编译进传输实现的公钥长度，启动时与本库的常量比对
    const PUBLIC_KEY_SIZE: usize;
    /// 编译进传输实现的地址长度
    const ADDRESS_SIZE: usize;

    /// 两次 `pump_once` 之间的建议间隔
    fn iteration_interval(&self) -> Duration;

    /// 执行一次事件泵，事件通过 `sink` 同步交付。
    ///
    /// `sink` 内不得回调传输本身。
    fn pump_once(&mut self, sink: &mut dyn FnMut(NativeEvent));

    fn self_address(&self) -> Address;

    fn connection_status(&self) -> Connection;

    /// 不发送请求直接添加好友（用于接受好友请求）
    fn add_friend_norequest(&mut self, key: &PublicKey) -> Result<PeerId, NativeError>;

    /// 好友编号当前对应的公钥
    fn friend_public_key(&self, peer: PeerId) -> Result<PublicKey, NativeError>;

    fn send_text(&mut self, peer: PeerId, text: &str) -> Result<MessageId, NativeError>;

    fn offer_file(&mut self, peer: PeerId, name: &str, size: u64)
    -> Result<TransferId, NativeError>;

    fn set_file_control(&mut self, id: TransferId, control: FileControl)
    -> Result<(), NativeError>;

    fn send_chunk(&mut self, id: TransferId, offset: u64, data: &[u8]) -> Result<(), NativeError>;

    /// 导出可持久化的传输状态（身份、好友列表）
    fn save_state(&self) -> Result<Vec<u8>, NativeError>;
}
