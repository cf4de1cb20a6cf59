//! 传输桥接层
//!
//! 将单线程、回调驱动的原生传输包装成线程安全的异步接口:
//!
//! - **泵线程**: 唯一调用原生传输的线程，执行事件泵、流控窗口和出站请求
//! - **调度线程**: 从接收队列取出入站事件，按到达顺序调用已注册的处理器
//!
//! 两个线程之间只通过有界队列通信。
//!
//! # 示例
//!
//! ```ignore
//! let network = MemoryNetwork::new(Duration::from_millis(20));
//! let node = network.node("alice");
//! let bridge = Bridge::spawn(move || Ok::<_, NativeError>(node), BridgeConfig::default())?;
//! let id = bridge.handle().offer_file(PeerId(0), "a.bin", 10).await?;
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use log::{debug, error, info, warn};

use crate::transport::error::{HandlerKind, TransportError};
use crate::transport::message::{InboundEvent, Pending, Request};
use crate::transport::native::{NativeEvent, Transport};
use crate::transport::types::{
    self, Address, ChunkRequest, Connection, FileChunk, FileControl, FileInfo, MessageId, PeerId,
    PublicKey, TransferId,
};
use crate::transport::window::{WindowConfig, WindowTable};
use crate::util::panic_message;

/// 调度线程检查停止标志的间隔，也是接收队列满时泵线程的重试间隔
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// 好友相关事件处理器
pub trait FriendEvents: Send + Sync {
    /// 收到好友请求，返回是否接受
    fn on_friend_request(&self, key: &PublicKey, message: &str) -> bool;

    fn on_friend_message(&self, peer: PeerId, text: &str);

    fn on_friend_name(&self, _peer: PeerId, _name: &str) {}

    fn on_friend_status(&self, _peer: PeerId, _status: &str) {}
}

/// 文件传输事件处理器
pub trait FileEvents: Send + Sync {
    fn on_file_offered(&self, id: TransferId, info: FileInfo);

    fn on_file_control(&self, id: TransferId, control: FileControl);

    /// 已经过流控窗口放行的拉取请求
    fn on_chunk_requested(&self, id: TransferId, request: ChunkRequest);

    fn on_chunk_received(&self, id: TransferId, chunk: FileChunk);

    /// 针对该传输的出站命令被原生传输拒绝
    fn on_file_error(&self, id: TransferId, error: TransportError);
}

/// 桥接层参数
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// 发送队列和接收队列各自的容量
    pub queue_capacity: usize,
    pub window: WindowConfig,
    /// 传输状态的保存位置；为空时 `save_state` 返回 `NoSaveFile`
    pub save_file: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 512,
            window: WindowConfig::default(),
            save_file: None,
        }
    }
}

#[derive(Default)]
struct Registry {
    friend: Option<Arc<dyn FriendEvents>>,
    file: Option<Arc<dyn FileEvents>>,
}

fn register<H: ?Sized>(
    slot: &mut Option<Arc<H>>,
    handler: Arc<H>,
    kind: HandlerKind,
) -> Result<(), TransportError> {
    if slot.is_some() {
        return Err(TransportError::AlreadyRegistered(kind));
    }
    *slot = Some(handler);
    Ok(())
}

fn unregister<H: ?Sized>(
    slot: &mut Option<Arc<H>>,
    handler: &Arc<H>,
    kind: HandlerKind,
) -> Result<(), TransportError> {
    match slot {
        None => Err(TransportError::NotRegistered(kind)),
        Some(current) if !Arc::ptr_eq(current, handler) => {
            Err(TransportError::HandlerMismatch(kind))
        }
        Some(_) => {
            *slot = None;
            Ok(())
        }
    }
}

struct Shared {
    requests: Sender<Request>,
    registry: Mutex<Registry>,
    running: AtomicBool,
    address: Address,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn friend_handler(&self) -> Option<Arc<dyn FriendEvents>> {
        self.registry().friend.clone()
    }

    fn file_handler(&self) -> Option<Arc<dyn FileEvents>> {
        self.registry().file.clone()
    }
}

/// 桥接层的可克隆句柄，所有出站操作都经由它提交
#[derive(Clone)]
pub struct BridgeHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeHandle")
            .field("address", &self.shared.address)
            .field("running", &self.shared.is_running())
            .finish()
    }
}

impl BridgeHandle {
    /// 本节点地址（启动时读取）
    pub fn self_address(&self) -> Address {
        self.shared.address
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// 提交请求；队列已满时阻塞。桥接层已关闭时请求被丢弃，
    /// 其响应槽随之关闭，调用方得到 `Shutdown`。
    fn submit(&self, request: Request) {
        if !self.shared.is_running() {
            debug!("Dropping {} request: bridge stopped", request.name());
            return;
        }
        if let Err(err) = self.shared.requests.send(request) {
            debug!("Dropping {} request: pump has exited", err.0.name());
        }
    }

    pub fn get_connection_status(&self) -> Pending<Connection> {
        let (reply, pending) = Pending::channel();
        self.submit(Request::ConnectionStatus { reply });
        pending
    }

    pub fn accept_friend(&self, key: PublicKey) -> Pending<PeerId> {
        let (reply, pending) = Pending::channel();
        self.submit(Request::AcceptFriend {
            key,
            reply: Some(reply),
        });
        pending
    }

    /// 查询好友编号当前对应的公钥
    pub fn friend_public_key(&self, peer: PeerId) -> Pending<PublicKey> {
        let (reply, pending) = Pending::channel();
        self.submit(Request::FriendKey { peer, reply });
        pending
    }

    pub fn send_message(&self, peer: PeerId, text: impl Into<String>) -> Pending<MessageId> {
        let (reply, pending) = Pending::channel();
        self.submit(Request::SendMessage {
            peer,
            text: text.into(),
            reply,
        });
        pending
    }

    /// 向好友提供一个文件，得到本次传输的 ID
    pub fn offer_file(&self, peer: PeerId, name: impl Into<String>, size: u64) -> Pending<TransferId> {
        let (reply, pending) = Pending::channel();
        self.submit(Request::OfferFile {
            peer,
            info: FileInfo {
                name: name.into(),
                size,
            },
            reply,
        });
        pending
    }

    /// 失败以 `on_file_error` 回调上报
    pub fn send_file_control(&self, id: TransferId, control: FileControl) {
        self.submit(Request::FileControl { id, control });
    }

    /// 失败以 `on_file_error` 回调上报
    pub fn send_chunk(&self, id: TransferId, offset: u64, data: Vec<u8>) {
        self.submit(Request::SendChunk {
            id,
            chunk: FileChunk { offset, data },
        });
    }

    /// 将传输状态写入保存文件，得到写入的字节数
    pub fn save_state(&self) -> Pending<usize> {
        let (reply, pending) = Pending::channel();
        self.submit(Request::SaveState { reply });
        pending
    }

    pub fn register_friend_events(&self, handler: Arc<dyn FriendEvents>) -> Result<(), TransportError> {
        register(&mut self.shared.registry().friend, handler, HandlerKind::Friend)
    }

    pub fn unregister_friend_events(
        &self,
        handler: &Arc<dyn FriendEvents>,
    ) -> Result<(), TransportError> {
        unregister(&mut self.shared.registry().friend, handler, HandlerKind::Friend)
    }

    pub fn register_file_events(&self, handler: Arc<dyn FileEvents>) -> Result<(), TransportError> {
        register(&mut self.shared.registry().file, handler, HandlerKind::File)
    }

    pub fn unregister_file_events(&self, handler: &Arc<dyn FileEvents>) -> Result<(), TransportError> {
        unregister(&mut self.shared.registry().file, handler, HandlerKind::File)
    }
}

/// 运行中的桥接层；丢弃时自动关闭
pub struct Bridge {
    handle: BridgeHandle,
    pump: Option<JoinHandle<()>>,
    dispatch: Option<JoinHandle<()>>,
}

impl Bridge {
    /// 启动泵线程和调度线程
    ///
    /// 传输在泵线程上由 `factory` 构造，构造失败同步返回。
    pub fn spawn<T, F, E>(factory: F, config: BridgeConfig) -> Result<Self, TransportError>
    where
        T: Transport + 'static,
        F: FnOnce() -> Result<T, E> + Send + 'static,
        E: fmt::Display,
    {
        check_size("public key", types::PUBLIC_KEY_SIZE, T::PUBLIC_KEY_SIZE)?;
        check_size("address", types::ADDRESS_SIZE, T::ADDRESS_SIZE)?;

        let capacity = config.queue_capacity.max(1);
        let (request_tx, request_rx) = crossbeam_channel::bounded(capacity);
        let (event_tx, event_rx) = crossbeam_channel::bounded(capacity);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

        // 共享状态要等传输构造完成、拿到地址后才能创建
        let (shared_tx, shared_rx) = crossbeam_channel::bounded::<Arc<Shared>>(1);

        let pump = thread::Builder::new()
            .name("friendsend-pump".to_string())
            .spawn(move || {
                let transport = match factory() {
                    Ok(transport) => transport,
                    Err(e) => {
                        let _ = ready_tx.send(Err(TransportError::Construction(e.to_string())));
                        return;
                    }
                };
                if ready_tx.send(Ok(transport.self_address())).is_err() {
                    return;
                }
                let Ok(shared) = shared_rx.recv() else {
                    return;
                };
                Pump {
                    transport,
                    windows: WindowTable::new(config.window),
                    requests: request_rx,
                    events: event_tx,
                    shared,
                    save_file: config.save_file,
                }
                .run();
            })?;

        let address = match ready_rx.recv() {
            Ok(Ok(address)) => address,
            Ok(Err(err)) => {
                let _ = pump.join();
                return Err(err);
            }
            Err(_) => {
                let _ = pump.join();
                return Err(TransportError::Construction(
                    "pump thread exited during construction".to_string(),
                ));
            }
        };

        let shared = Arc::new(Shared {
            requests: request_tx,
            registry: Mutex::new(Registry::default()),
            running: AtomicBool::new(true),
            address,
        });
        if shared_tx.send(shared.clone()).is_err() {
            let _ = pump.join();
            return Err(TransportError::Construction(
                "pump thread exited during construction".to_string(),
            ));
        }

        let dispatcher = Dispatcher {
            events: event_rx,
            shared: shared.clone(),
        };
        let dispatch = match thread::Builder::new()
            .name("friendsend-dispatch".to_string())
            .spawn(move || dispatcher.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                shared.running.store(false, Ordering::Release);
                let _ = pump.join();
                return Err(e.into());
            }
        };

        info!("Transport bridge started, address {}", address);
        Ok(Self {
            handle: BridgeHandle { shared },
            pump: Some(pump),
            dispatch: Some(dispatch),
        })
    }

    pub fn handle(&self) -> &BridgeHandle {
        &self.handle
    }

    /// 停止两个线程并等待退出；未结算的请求得到 `Shutdown`
    ///
    /// 不能在事件处理器内调用（调度线程无法等待自己退出）。
    pub fn shutdown(&mut self) {
        let shared = &self.handle.shared;
        if shared.running.swap(false, Ordering::AcqRel) {
            info!("Stopping transport bridge");
        }
        for (name, handle) in [("pump", self.pump.take()), ("dispatch", self.dispatch.take())] {
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    error!("Bridge {} thread panicked", name);
                }
            }
        }
        // 处理器通常持有句柄，清空注册以打破引用环
        let registry = std::mem::take(&mut *shared.registry());
        drop(registry);
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn check_size(what: &'static str, expected: usize, actual: usize) -> Result<(), TransportError> {
    if expected == actual {
        Ok(())
    } else {
        Err(TransportError::Incompatible {
            what,
            expected,
            actual,
        })
    }
}

struct Pump<T: Transport> {
    transport: T,
    windows: WindowTable,
    requests: Receiver<Request>,
    events: Sender<InboundEvent>,
    shared: Arc<Shared>,
    save_file: Option<PathBuf>,
}

impl<T: Transport> Pump<T> {
    fn run(mut self) {
        debug!("Pump thread started");
        let interval = self.transport.iteration_interval();
        let mut native = Vec::new();

        while self.shared.is_running() {
            let started = Instant::now();

            // 回调期间只缓冲事件，不重入原生传输
            self.transport.pump_once(&mut |event| native.push(event));

            let mut inbound = Vec::with_capacity(native.len());
            for event in native.drain(..) {
                match event {
                    NativeEvent::ChunkRequested { id, request } => {
                        let released = self.windows.admit(id, request, started);
                        inbound.extend(
                            released
                                .into_iter()
                                .map(|request| InboundEvent::ChunkRequested { id, request }),
                        );
                    }
                    other => inbound.push(other.into()),
                }
            }
            inbound.extend(
                self.windows
                    .sweep(started)
                    .into_iter()
                    .map(|(id, request)| InboundEvent::ChunkRequested { id, request }),
            );
            self.deliver(inbound);

            let deadline = started + interval;
            loop {
                match self.requests.recv_deadline(deadline) {
                    Ok(request) => {
                        let mut produced = Vec::new();
                        self.execute(request, &mut produced);
                        self.deliver(produced);
                    }
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        }

        // 丢弃剩余请求，让等待方得到 Shutdown
        let dropped = self.requests.try_iter().count();
        if dropped > 0 {
            debug!("Dropped {} queued requests on shutdown", dropped);
        }
        debug!("Pump thread stopped");
    }

    /// 将事件送入接收队列；队列满时继续执行出站请求，
    /// 以免调度线程因等待发送队列而与泵线程互相阻塞
    fn deliver(&mut self, events: Vec<InboundEvent>) {
        let mut backlog: VecDeque<InboundEvent> = events.into();
        while let Some(event) = backlog.pop_front() {
            match self.events.send_timeout(event, POLL_INTERVAL) {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(event)) => {
                    backlog.push_front(event);
                    if !self.shared.is_running() {
                        warn!(
                            "Dropping {} inbound events: bridge stopped",
                            backlog.len()
                        );
                        return;
                    }
                    let mut produced = Vec::new();
                    while let Ok(request) = self.requests.try_recv() {
                        self.execute(request, &mut produced);
                    }
                    backlog.extend(produced);
                }
                Err(SendTimeoutError::Disconnected(_)) => return,
            }
        }
    }

    fn execute(&mut self, request: Request, out: &mut Vec<InboundEvent>) {
        match request {
            Request::ConnectionStatus { reply } => {
                let _ = reply.send(Ok(self.transport.connection_status()));
            }
            Request::AcceptFriend { key, reply } => {
                let result = self
                    .transport
                    .add_friend_norequest(&key)
                    .map_err(TransportError::from);
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => match result {
                        Ok(peer) => info!("Accepted friend {} as {}", key, peer),
                        Err(e) => warn!("Failed to accept friend {}: {}", key, e),
                    },
                }
            }
            Request::FriendKey { peer, reply } => {
                let result = self
                    .transport
                    .friend_public_key(peer)
                    .map_err(TransportError::from);
                let _ = reply.send(result);
            }
            Request::SendMessage { peer, text, reply } => {
                let result = self
                    .transport
                    .send_text(peer, &text)
                    .map_err(TransportError::from);
                let _ = reply.send(result);
            }
            Request::OfferFile { peer, info, reply } => {
                let result = self
                    .transport
                    .offer_file(peer, &info.name, info.size)
                    .map_err(TransportError::from);
                if let Err(e) = &result {
                    debug!("Offer of '{}' to {} failed: {}", info.name, peer, e);
                }
                let _ = reply.send(result);
            }
            Request::FileControl { id, control } => {
                if let Err(e) = self.transport.set_file_control(id, control) {
                    out.push(InboundEvent::FileError {
                        id,
                        error: e.into(),
                    });
                }
            }
            Request::SendChunk { id, chunk } => {
                if let Err(e) = self.transport.send_chunk(id, chunk.offset, &chunk.data) {
                    out.push(InboundEvent::FileError {
                        id,
                        error: e.into(),
                    });
                }
                let released = self.windows.release_one(id, Instant::now());
                out.extend(
                    released
                        .into_iter()
                        .map(|request| InboundEvent::ChunkRequested { id, request }),
                );
            }
            Request::SaveState { reply } => {
                let _ = reply.send(self.save_state());
            }
        }
    }

    fn save_state(&self) -> Result<usize, TransportError> {
        let path = self.save_file.as_deref().ok_or(TransportError::NoSaveFile)?;
        let bytes = self.transport.save_state()?;
        write_atomically(path, &bytes)?;
        info!("Saved transport state ({} bytes) to {:?}", bytes.len(), path);
        Ok(bytes.len())
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

struct Dispatcher {
    events: Receiver<InboundEvent>,
    shared: Arc<Shared>,
}

impl Dispatcher {
    fn run(self) {
        debug!("Dispatch thread started");
        while self.shared.is_running() {
            match self.events.recv_timeout(POLL_INTERVAL) {
                Ok(event) => self.dispatch(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("Dispatch thread stopped");
    }

    fn dispatch(&self, event: InboundEvent) {
        match event {
            InboundEvent::FriendRequest { key, message } => {
                let accepted = self
                    .with_friend("friend request", |h| h.on_friend_request(&key, &message))
                    .unwrap_or(false);
                if accepted {
                    let _ = self.shared.requests.send(Request::AcceptFriend { key, reply: None });
                } else {
                    info!("Ignoring friend request from {}", key);
                }
            }
            InboundEvent::FriendMessage { peer, text } => {
                self.with_friend("friend message", |h| h.on_friend_message(peer, &text));
            }
            InboundEvent::FriendName { peer, name } => {
                self.with_friend("friend name", |h| h.on_friend_name(peer, &name));
            }
            InboundEvent::FriendStatus { peer, status } => {
                self.with_friend("friend status", |h| h.on_friend_status(peer, &status));
            }
            InboundEvent::FileOffered { id, info } => {
                self.with_file("file offer", |h| h.on_file_offered(id, info));
            }
            InboundEvent::FileControl { id, control } => {
                self.with_file("file control", |h| h.on_file_control(id, control));
            }
            InboundEvent::ChunkRequested { id, request } => {
                self.with_file("chunk request", |h| h.on_chunk_requested(id, request));
            }
            InboundEvent::ChunkReceived { id, chunk } => {
                self.with_file("chunk", |h| h.on_chunk_received(id, chunk));
            }
            InboundEvent::FileError { id, error } => {
                self.with_file("file error", |h| h.on_file_error(id, error));
            }
        }
    }

    fn with_friend<R>(&self, what: &str, f: impl FnOnce(&dyn FriendEvents) -> R) -> Option<R> {
        let Some(handler) = self.shared.friend_handler() else {
            debug!("No friend events handler, dropping {}", what);
            return None;
        };
        guarded(what, || f(handler.as_ref()))
    }

    fn with_file<R>(&self, what: &str, f: impl FnOnce(&dyn FileEvents) -> R) -> Option<R> {
        let Some(handler) = self.shared.file_handler() else {
            debug!("No file events handler, dropping {}", what);
            return None;
        };
        guarded(what, || f(handler.as_ref()))
    }
}

fn guarded<R>(what: &str, f: impl FnOnce() -> R) -> Option<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            error!(
                "Handler panicked while handling {}: {}",
                what,
                panic_message(payload.as_ref())
            );
            None
        }
    }
}
