//! 传输协调引擎
//!
//! 所有传输状态由单一的变更线程持有。桥接层的文件事件和 `send_path`
//! 的收尾步骤都被打包成 [`Work`] 送入有界工作队列，按顺序在变更线程上执行，
//! 文件读写也只发生在该线程上。

use std::collections::HashMap;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use futures_util::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::oneshot;

use crate::transfer::error::TransferError;
use crate::transfer::path::{self, SourceFile};
use crate::transfer::state::{Activity, Direction, TransferState, TransferSummary};
use crate::transport::{
    BridgeHandle, ChunkRequest, FileChunk, FileControl, FileEvents, FileInfo, Pending, PeerId,
    TransferId, TransportError,
};
use crate::util::panic_message;

/// 同时等待应答的提供数
const OFFER_CONCURRENCY: usize = 16;

/// 传输登记之前到达的控制和拉取请求的保留时间
const EARLY_EVENT_TTL: Duration = Duration::from_secs(30);

/// 最多保留的早到事件数
const MAX_EARLY_EVENTS: usize = 4096;

/// 引擎向传输层发出的命令
pub trait TransferCommands: Send + Sync {
    fn offer_file(&self, peer: PeerId, info: FileInfo) -> Pending<TransferId>;

    fn send_file_control(&self, id: TransferId, control: FileControl);

    fn send_chunk(&self, id: TransferId, chunk: FileChunk);
}

impl TransferCommands for BridgeHandle {
    fn offer_file(&self, peer: PeerId, info: FileInfo) -> Pending<TransferId> {
        BridgeHandle::offer_file(self, peer, info.name, info.size)
    }

    fn send_file_control(&self, id: TransferId, control: FileControl) {
        BridgeHandle::send_file_control(self, id, control);
    }

    fn send_chunk(&self, id: TransferId, chunk: FileChunk) {
        BridgeHandle::send_chunk(self, id, chunk.offset, chunk.data);
    }
}

/// 引擎参数
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// 发送路径的根目录
    pub root_dir: PathBuf,
    /// 接收文件的保存目录，默认与根目录相同
    pub receive_dir: Option<PathBuf>,
    /// 工作队列容量
    pub queue_capacity: usize,
}

impl EngineConfig {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            receive_dir: None,
            queue_capacity: 256,
        }
    }
}

/// 已提供给对方的文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferedFile {
    pub id: TransferId,
    pub path: PathBuf,
    pub size: u64,
}

/// 提供失败的文件
#[derive(Debug)]
pub struct FailedOffer {
    pub path: PathBuf,
    pub error: TransportError,
}

/// `send_path` 的结果
#[derive(Debug, Default)]
pub struct SendReport {
    pub offered: Vec<OfferedFile>,
    pub failed: Vec<FailedOffer>,
}

enum Work {
    CreateOutbound {
        id: TransferId,
        path: PathBuf,
        size: u64,
    },
    Offered {
        id: TransferId,
        info: FileInfo,
    },
    Control {
        id: TransferId,
        control: FileControl,
    },
    ChunkRequested {
        id: TransferId,
        request: ChunkRequest,
    },
    ChunkReceived {
        id: TransferId,
        chunk: FileChunk,
    },
    Error {
        id: TransferId,
        error: TransportError,
    },
    Snapshot(oneshot::Sender<Vec<TransferSummary>>),
    Stop,
}

pub struct TransferEngine {
    work: Sender<Work>,
    commands: Arc<dyn TransferCommands>,
    root: PathBuf,
    receive_dir: PathBuf,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TransferEngine {
    /// 启动变更线程
    ///
    /// 根目录在此规范化；接收目录不存在时创建。
    pub fn start(
        commands: Arc<dyn TransferCommands>,
        config: EngineConfig,
    ) -> Result<Arc<Self>, TransferError> {
        let root = fs::canonicalize(&config.root_dir)?;
        let receive_dir = config.receive_dir.unwrap_or_else(|| root.clone());
        fs::create_dir_all(&receive_dir)?;

        let (work_tx, work_rx) = crossbeam_channel::bounded(config.queue_capacity.max(1));
        let worker = Worker {
            work: work_rx,
            commands: commands.clone(),
            receive_dir: receive_dir.clone(),
            transfers: HashMap::new(),
            early: HashMap::new(),
        };
        let handle = thread::Builder::new()
            .name("friendsend-transfer".to_string())
            .spawn(move || worker.run())?;

        info!(
            "Transfer engine started, root {:?}, receiving into {:?}",
            root, receive_dir
        );
        Ok(Arc::new(Self {
            work: work_tx,
            commands,
            root,
            receive_dir,
            worker: Mutex::new(Some(handle)),
        }))
    }

    /// 启动引擎并注册为桥接层的文件事件处理器
    pub fn attach(bridge: &BridgeHandle, config: EngineConfig) -> Result<Arc<Self>, TransferError> {
        let engine = Self::start(Arc::new(bridge.clone()), config)?;
        if let Err(e) = bridge.register_file_events(engine.clone()) {
            engine.shutdown();
            return Err(e.into());
        }
        Ok(engine)
    }

    /// 取消注册并停止引擎
    pub fn detach(self: &Arc<Self>, bridge: &BridgeHandle) -> Result<(), TransferError> {
        let handler: Arc<dyn FileEvents> = self.clone();
        bridge.unregister_file_events(&handler)?;
        self.shutdown();
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn receive_dir(&self) -> &Path {
        &self.receive_dir
    }

    fn submit(&self, work: Work) -> Result<(), TransferError> {
        self.work.send(work).map_err(|_| TransferError::Stopped)
    }

    /// 异步上下文中提交；队列已满时在阻塞线程池上等待
    async fn submit_async(&self, work: Work) -> Result<(), TransferError> {
        match self.work.try_send(work) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(work)) => {
                let queue = self.work.clone();
                unblock(move || queue.send(work))
                    .await?
                    .map_err(|_| TransferError::Stopped)
            }
            Err(TrySendError::Disconnected(_)) => Err(TransferError::Stopped),
        }
    }

    fn enqueue(&self, work: Work) {
        if self.submit(work).is_err() {
            debug!("Transfer engine stopped, dropping file event");
        }
    }

    /// 发送根目录下的文件或目录
    ///
    /// 目录会递归展开；任何一个条目不合法时不发出任何提供。
    /// 各文件的提供并发等待，单个失败不影响其他文件。
    /// 每个提供得到应答后立即登记发送状态，不等其他文件。
    /// 需要在 tokio 运行时中调用。
    pub async fn send_path(
        &self,
        peer: PeerId,
        path: impl AsRef<Path>,
    ) -> Result<SendReport, TransferError> {
        let path = path::resolve(&self.root, path.as_ref())?;
        let files = path::collect_files(&path)?;
        if path.is_dir() {
            info!(
                "Sending a directory to {} with {} files",
                peer,
                files.len()
            );
        }

        let mut offers = stream::iter(files.into_iter().enumerate())
            .map(|(index, SourceFile { path, size })| {
                let name = path::offer_name(&path);
                info!("Sending a file to {} with name {} size {}", peer, name, size);
                let commands = self.commands.clone();
                async move {
                    // 发送队列已满时提交会阻塞
                    let pending =
                        unblock(move || commands.offer_file(peer, FileInfo { name, size })).await?;
                    let result = pending.await;
                    if let Ok(id) = result {
                        self.submit_async(Work::CreateOutbound {
                            id,
                            path: path.clone(),
                            size,
                        })
                        .await?;
                    }
                    Ok::<_, TransferError>((index, path, size, result))
                }
            })
            .buffer_unordered(OFFER_CONCURRENCY);

        let mut offered = Vec::new();
        let mut failed = Vec::new();
        while let Some(outcome) = offers.next().await {
            let (index, path, size, result) = outcome?;
            match result {
                Ok(id) => offered.push((index, OfferedFile { id, path, size })),
                Err(error) => {
                    warn!("Failed to offer {:?} to {}: {}", path, peer, error);
                    failed.push((index, FailedOffer { path, error }));
                }
            }
        }

        offered.sort_by_key(|(index, _)| *index);
        failed.sort_by_key(|(index, _)| *index);
        Ok(SendReport {
            offered: offered.into_iter().map(|(_, file)| file).collect(),
            failed: failed.into_iter().map(|(_, file)| file).collect(),
        })
    }

    /// 所有进行中的传输，按 ID 排序
    pub async fn snapshot(&self) -> Result<Vec<TransferSummary>, TransferError> {
        let (tx, rx) = oneshot::channel();
        self.submit_async(Work::Snapshot(tx)).await?;
        rx.await.map_err(|_| TransferError::Stopped)
    }

    /// 停止变更线程；此前已入队的工作仍会执行
    pub fn shutdown(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = self.work.send(Work::Stop);
            if handle.join().is_err() {
                error!("Transfer thread panicked");
            }
        }
    }
}

/// 在阻塞线程池上执行可能因有界队列已满而阻塞的调用
async fn unblock<R, F>(f: F) -> Result<R, TransferError>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await?)
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl FileEvents for TransferEngine {
    fn on_file_offered(&self, id: TransferId, info: FileInfo) {
        self.enqueue(Work::Offered { id, info });
    }

    fn on_file_control(&self, id: TransferId, control: FileControl) {
        self.enqueue(Work::Control { id, control });
    }

    fn on_chunk_requested(&self, id: TransferId, request: ChunkRequest) {
        self.enqueue(Work::ChunkRequested { id, request });
    }

    fn on_chunk_received(&self, id: TransferId, chunk: FileChunk) {
        self.enqueue(Work::ChunkReceived { id, chunk });
    }

    fn on_file_error(&self, id: TransferId, error: TransportError) {
        self.enqueue(Work::Error { id, error });
    }
}

/// 发送状态登记之前就到达的事件
///
/// 对方可能在本地处理提供应答之前就恢复传输并开始拉取。
struct EarlyEvents {
    since: Instant,
    work: Vec<Work>,
}

struct Worker {
    work: Receiver<Work>,
    commands: Arc<dyn TransferCommands>,
    receive_dir: PathBuf,
    transfers: HashMap<TransferId, TransferState>,
    early: HashMap<TransferId, EarlyEvents>,
}

impl Worker {
    fn run(mut self) {
        debug!("Transfer thread started");
        while let Ok(work) = self.work.recv() {
            if matches!(work, Work::Stop) {
                break;
            }
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.handle(work))) {
                error!(
                    "Error while running transfer work: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
        if !self.transfers.is_empty() {
            info!(
                "Transfer thread stopping with {} unfinished transfers",
                self.transfers.len()
            );
        }
        debug!("Transfer thread stopped");
    }

    fn handle(&mut self, work: Work) {
        match work {
            Work::CreateOutbound { id, path, size } => self.create_outbound(id, path, size),
            Work::Offered { id, info } => self.file_offered(id, info),
            Work::Control { id, control } => self.file_control(id, control),
            Work::ChunkRequested { id, request } => self.chunk_requested(id, request),
            Work::ChunkReceived { id, chunk } => self.chunk_received(id, chunk),
            Work::Error { id, error } => self.file_error(id, error),
            Work::Snapshot(reply) => {
                let mut summaries: Vec<_> = self
                    .transfers
                    .iter()
                    .map(|(id, state)| state.summary(*id))
                    .collect();
                summaries.sort_by_key(|s| s.id);
                let _ = reply.send(summaries);
            }
            Work::Stop => {}
        }
    }

    fn create_outbound(&mut self, id: TransferId, path: PathBuf, size: u64) {
        if self.transfers.contains_key(&id) {
            error!("Transfer already exists: {}", id);
            return;
        }
        match TransferState::outbound(&path, size) {
            Ok(state) => {
                debug!("Transfer {} waiting for peer to accept {:?}", id, path);
                self.transfers.insert(id, state);
                if let Some(early) = self.early.remove(&id) {
                    debug!("Replaying {} early events for {}", early.work.len(), id);
                    for work in early.work {
                        self.handle(work);
                    }
                }
            }
            Err(e) => {
                error!("Failed to open {:?} for {}: {}", path, id, e);
                self.early.remove(&id);
            }
        }
    }

    /// 暂存未知传输的事件，等待发送状态登记
    fn hold(&mut self, id: TransferId, work: Work) {
        let now = Instant::now();
        self.early.retain(|stale, early| {
            let keep = now.duration_since(early.since) < EARLY_EVENT_TTL;
            if !keep {
                warn!(
                    "Dropping {} events for {}: this transfer does not exist!",
                    early.work.len(),
                    stale
                );
            }
            keep
        });

        let held: usize = self.early.values().map(|early| early.work.len()).sum();
        if held >= MAX_EARLY_EVENTS {
            warn!("Event received for {} but this transfer does not exist!", id);
            return;
        }
        debug!("Holding event for {} until the transfer is created", id);
        self.early
            .entry(id)
            .or_insert_with(|| EarlyEvents {
                since: now,
                work: Vec::new(),
            })
            .work
            .push(work);
    }

    fn file_offered(&mut self, id: TransferId, info: FileInfo) {
        info!(
            "Received a file {} with name {} size {}",
            id, info.name, info.size
        );

        let Some(name) = path::sanitize_name(&info.name) else {
            warn!("Refusing {} with unusable name {:?}", id, info.name);
            self.commands.send_file_control(id, FileControl::Cancel);
            return;
        };
        if self.transfers.contains_key(&id) {
            error!("Transfer already exists: {}", id);
            return;
        }

        let dest = self.receive_dir.join(name);
        if dest.exists() {
            warn!("Overwriting existing file: {:?}", dest);
        } else {
            info!("Saving file to: {:?}", dest);
        }

        match TransferState::inbound(&dest, info.size) {
            Ok(state) => {
                self.transfers.insert(id, state);
                self.commands.send_file_control(id, FileControl::Resume);
            }
            Err(e) => {
                error!("Failed to create {:?} for {}: {}", dest, id, e);
                self.commands.send_file_control(id, FileControl::Cancel);
            }
        }
    }

    fn file_control(&mut self, id: TransferId, control: FileControl) {
        let Some(state) = self.transfers.get_mut(&id) else {
            self.hold(id, Work::Control { id, control });
            return;
        };
        match control {
            FileControl::Cancel => {
                info!("Transfer {} has been cancelled", id);
                self.transfers.remove(&id);
            }
            FileControl::Pause => {
                debug!("Transfer {} {}", id, control);
                state.activity = Activity::Paused;
            }
            FileControl::Resume => {
                debug!("Transfer {} {}", id, control);
                state.activity = Activity::Active;
            }
        }
    }

    fn chunk_requested(&mut self, id: TransferId, request: ChunkRequest) {
        let Some(state) = self.transfers.get_mut(&id) else {
            self.hold(id, Work::ChunkRequested { id, request });
            return;
        };
        if state.direction != Direction::Outbound {
            error!("Chunk requested for non-send transfer {}", id);
            return;
        }
        if !state.is_active() {
            error!("Chunk requested for inactive transfer {}", id);
            return;
        }

        if request.length == 0 {
            if !state.progress.is_complete() {
                warn!("Send transfer {} ended before all bytes were read", id);
            }
            info!(
                "End of send transfer {} ({} of {} bytes)",
                id,
                state.progress.progress(),
                state.progress.total()
            );
            self.transfers.remove(&id);
            return;
        }

        match state.read_chunk(request) {
            Ok(data) => self.commands.send_chunk(
                id,
                FileChunk {
                    offset: request.offset,
                    data,
                },
            ),
            Err(e) => error!(
                "Error reading stream of {} at {} size {}: {}",
                id, request.offset, request.length, e
            ),
        }
    }

    fn chunk_received(&mut self, id: TransferId, chunk: FileChunk) {
        let Some(state) = self.transfers.get_mut(&id) else {
            warn!(
                "Chunk received for {} but this transfer does not exist!",
                id
            );
            return;
        };
        if state.direction != Direction::Inbound {
            error!("Received chunk for non-recv transfer {}", id);
            return;
        }
        if !state.is_active() {
            error!("Received chunk for inactive transfer {}", id);
            return;
        }

        if chunk.is_end() {
            if !state.progress.is_complete() {
                warn!("Recv transfer {} ended before all bytes arrived", id);
            }
            info!(
                "End of recv transfer {} ({} of {} bytes)",
                id,
                state.progress.progress(),
                state.progress.total()
            );
            self.transfers.remove(&id);
            return;
        }

        if let Err(e) = state.write_chunk(&chunk) {
            error!(
                "Error writing to stream of {} at {}: {}",
                id, chunk.offset, e
            );
        }
    }

    fn file_error(&mut self, id: TransferId, error: TransportError) {
        error!("{} file error: {}", id, error);
        if self.transfers.remove(&id).is_some() {
            info!("Dropped transfer {} after file error", id);
        }
    }
}
