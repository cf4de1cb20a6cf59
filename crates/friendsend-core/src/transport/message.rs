//! 桥接层消息信封
//!
//! 出站请求 ([`Request`]) 经发送队列交给泵线程执行；
//! 入站事件 ([`InboundEvent`]) 经接收队列交给调度线程分发。

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::transport::error::TransportError;
use crate::transport::native::NativeEvent;
use crate::transport::types::{
    ChunkRequest, Connection, FileChunk, FileControl, FileInfo, MessageId, PeerId, PublicKey,
    TransferId,
};

/// 单次结算的响应槽
pub(crate) type Reply<T> = oneshot::Sender<Result<T, TransportError>>;

/// 出站请求，只在泵线程上执行
pub(crate) enum Request {
    ConnectionStatus {
        reply: Reply<Connection>,
    },
    AcceptFriend {
        key: PublicKey,
        reply: Option<Reply<PeerId>>,
    },
    FriendKey {
        peer: PeerId,
        reply: Reply<PublicKey>,
    },
    SendMessage {
        peer: PeerId,
        text: String,
        reply: Reply<MessageId>,
    },
    OfferFile {
        peer: PeerId,
        info: FileInfo,
        reply: Reply<TransferId>,
    },
    /// 失败时以 `FileError` 事件上报
    FileControl {
        id: TransferId,
        control: FileControl,
    },
    /// 失败时以 `FileError` 事件上报；执行后释放一个流控窗口名额
    SendChunk {
        id: TransferId,
        chunk: FileChunk,
    },
    SaveState {
        reply: Reply<usize>,
    },
}

impl Request {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Request::ConnectionStatus { .. } => "connection_status",
            Request::AcceptFriend { .. } => "accept_friend",
            Request::FriendKey { .. } => "friend_public_key",
            Request::SendMessage { .. } => "send_message",
            Request::OfferFile { .. } => "offer_file",
            Request::FileControl { .. } => "file_control",
            Request::SendChunk { .. } => "send_chunk",
            Request::SaveState { .. } => "save_state",
        }
    }
}

/// 入站事件，由调度线程按到达顺序分发
#[derive(Debug)]
pub enum InboundEvent {
    FriendRequest { key: PublicKey, message: String },
    FriendMessage { peer: PeerId, text: String },
    FriendName { peer: PeerId, name: String },
    FriendStatus { peer: PeerId, status: String },
    FileOffered { id: TransferId, info: FileInfo },
    FileControl { id: TransferId, control: FileControl },
    ChunkRequested { id: TransferId, request: ChunkRequest },
    ChunkReceived { id: TransferId, chunk: FileChunk },
    FileError { id: TransferId, error: TransportError },
}

impl From<NativeEvent> for InboundEvent {
    fn from(event: NativeEvent) -> Self {
        match event {
            NativeEvent::FriendRequest { key, message } => {
                InboundEvent::FriendRequest { key, message }
            }
            NativeEvent::FriendMessage { peer, text } => InboundEvent::FriendMessage { peer, text },
            NativeEvent::FriendName { peer, name } => InboundEvent::FriendName { peer, name },
            NativeEvent::FriendStatus { peer, status } => {
                InboundEvent::FriendStatus { peer, status }
            }
            NativeEvent::FileOffered { id, info } => InboundEvent::FileOffered { id, info },
            NativeEvent::FileControl { id, control } => InboundEvent::FileControl { id, control },
            NativeEvent::ChunkRequested { id, request } => {
                InboundEvent::ChunkRequested { id, request }
            }
            NativeEvent::ChunkReceived { id, chunk } => InboundEvent::ChunkReceived { id, chunk },
        }
    }
}

/// 一个出站请求的结果
///
/// 可以 `.await`，也可以在非异步线程上用 [`Pending::wait`] 阻塞等待。
/// 桥接层关闭后未结算的请求得到 [`TransportError::Shutdown`]。
#[derive(Debug)]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T, TransportError>>,
}

impl<T> Pending<T> {
    pub(crate) fn channel() -> (Reply<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// 已经结算的结果（用于立即失败或测试替身）
    pub fn ready(result: Result<T, TransportError>) -> Self {
        let (tx, pending) = Self::channel();
        let _ = tx.send(result);
        pending
    }

    /// 阻塞等待结果；不能在异步运行时内调用
    pub fn wait(self) -> Result<T, TransportError> {
        match self.rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(TransportError::Shutdown),
        }
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T, TransportError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(TransportError::Shutdown)))
    }
}
