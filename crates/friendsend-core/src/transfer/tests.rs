//! 传输引擎测试
//!
//! 用记录命令的替身代替桥接层，直接调用引擎的文件事件接口。
//! 引擎的工作是异步执行的，`snapshot()` 排在之前的工作之后，可作为同步点。

use super::*;
use crate::transport::{
    ChunkRequest, FileChunk, FileControl, FileEvents, FileInfo, FileNumber, Pending, PeerId,
    TransferId, TransportError,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

// ============================================================================
// 测试替身
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Offer(PeerId, FileInfo),
    Control(TransferId, FileControl),
    Chunk(TransferId, FileChunk),
}

#[derive(Default)]
struct Recorder {
    next_file: AtomicU32,
    /// 以此名字提供的文件会失败
    reject_name: Option<String>,
    calls: Mutex<Vec<Call>>,
}

impl Recorder {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn offers(&self) -> Vec<FileInfo> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Offer(_, info) => Some(info),
                _ => None,
            })
            .collect()
    }

    fn chunks(&self) -> Vec<FileChunk> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Chunk(_, chunk) => Some(chunk),
                _ => None,
            })
            .collect()
    }

    fn controls(&self) -> Vec<(TransferId, FileControl)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Control(id, control) => Some((id, control)),
                _ => None,
            })
            .collect()
    }
}

impl TransferCommands for Recorder {
    fn offer_file(&self, peer: PeerId, info: FileInfo) -> Pending<TransferId> {
        let rejected = self.reject_name.as_deref() == Some(info.name.as_str());
        self.calls.lock().unwrap().push(Call::Offer(peer, info));
        if rejected {
            return Pending::ready(Err(TransportError::Protocol {
                code: 2,
                message: "tox_file_send failed".to_string(),
            }));
        }
        let file = self.next_file.fetch_add(1, Ordering::SeqCst);
        Pending::ready(Ok(TransferId::new(peer, FileNumber(file))))
    }

    fn send_file_control(&self, id: TransferId, control: FileControl) {
        self.calls.lock().unwrap().push(Call::Control(id, control));
    }

    fn send_chunk(&self, id: TransferId, chunk: FileChunk) {
        self.calls.lock().unwrap().push(Call::Chunk(id, chunk));
    }
}

struct Fixture {
    engine: Arc<TransferEngine>,
    recorder: Arc<Recorder>,
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self::with_recorder(Recorder::default())
    }

    fn with_recorder(recorder: Recorder) -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("root")).unwrap();
        let recorder = Arc::new(recorder);
        let config = EngineConfig {
            receive_dir: Some(dir.path().join("inbox")),
            ..EngineConfig::new(dir.path().join("root"))
        };
        let engine = TransferEngine::start(recorder.clone(), config).unwrap();
        Self {
            engine,
            recorder,
            dir,
        }
    }

    fn root(&self) -> PathBuf {
        self.dir.path().join("root")
    }

    fn inbox(&self) -> PathBuf {
        self.dir.path().join("inbox")
    }

    fn write(&self, rel: &str, data: &[u8]) {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, data).unwrap();
    }

    async fn transfers(&self) -> Vec<TransferSummary> {
        self.engine.snapshot().await.unwrap()
    }
}

const PEER: PeerId = PeerId(0);
const INBOUND: TransferId = TransferId::new(PeerId(1), FileNumber(9));

fn pull(offset: u64, length: usize) -> ChunkRequest {
    ChunkRequest { offset, length }
}

fn chunk(offset: u64, data: &[u8]) -> FileChunk {
    FileChunk {
        offset,
        data: data.to_vec(),
    }
}

fn file_name(path: &Path) -> &str {
    path.file_name().unwrap().to_str().unwrap()
}

// ============================================================================
// send_path 测试
// ============================================================================

/// 目录会递归展开，每个文件一个提供，只发送文件名
#[tokio::test]
async fn test_send_directory() {
    let fx = Fixture::new();
    fx.write("a.bin", &[1u8; 10]);
    fx.write("sub/b.bin", &[2u8; 5]);

    let report = fx.engine.send_path(PEER, ".").await.unwrap();
    assert_eq!(report.offered.len(), 2);
    assert!(report.failed.is_empty());

    let mut offers = fx.recorder.offers();
    offers.sort_by(|a, b| a.name.cmp(&b.name));
    assert_eq!(
        offers,
        vec![
            FileInfo {
                name: "a.bin".to_string(),
                size: 10
            },
            FileInfo {
                name: "b.bin".to_string(),
                size: 5
            },
        ]
    );

    // 结果按遍历顺序排列
    assert_eq!(file_name(&report.offered[0].path), "a.bin");
    assert_eq!(file_name(&report.offered[1].path), "b.bin");

    let transfers = fx.transfers().await;
    assert_eq!(transfers.len(), 2);
    let total_of = |name: &str| {
        transfers
            .iter()
            .find(|t| file_name(&t.path) == name)
            .map(|t| t.total)
    };
    assert_eq!(total_of("a.bin"), Some(10));
    assert_eq!(total_of("b.bin"), Some(5));
    assert!(transfers.iter().all(|t| t.direction == Direction::Outbound));
    assert!(transfers.iter().all(|t| t.activity == Activity::Paused));
}

#[tokio::test]
async fn test_send_outside_root_is_refused() {
    let fx = Fixture::new();
    fs::create_dir(fx.dir.path().join("outside")).unwrap();
    fs::write(fx.dir.path().join("outside").join("x.bin"), b"x").unwrap();

    let err = fx.engine.send_path(PEER, "../outside").await.unwrap_err();
    assert!(matches!(err, TransferError::OutsideRoot { .. }));
    assert!(fx.recorder.offers().is_empty());

    let absolute = fx.dir.path().join("outside").join("x.bin");
    let err = fx.engine.send_path(PEER, &absolute).await.unwrap_err();
    assert!(matches!(err, TransferError::OutsideRoot { .. }));
}

#[tokio::test]
async fn test_send_missing_path() {
    let fx = Fixture::new();
    let err = fx.engine.send_path(PEER, "nope.bin").await.unwrap_err();
    assert!(matches!(err, TransferError::NotFound(_)));
    assert!(fx.recorder.offers().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn test_send_symlink_is_refused() {
    let fx = Fixture::new();
    fx.write("dir/a.bin", b"data");
    std::os::unix::fs::symlink(fx.root().join("dir/a.bin"), fx.root().join("link")).unwrap();

    let err = fx.engine.send_path(PEER, "link").await.unwrap_err();
    assert!(matches!(err, TransferError::SymlinkRefused(_)));

    // 目录中的符号链接让整个请求失败，不发出任何提供
    std::os::unix::fs::symlink(fx.root().join("dir/a.bin"), fx.root().join("dir/z.lnk")).unwrap();
    let err = fx.engine.send_path(PEER, "dir").await.unwrap_err();
    assert!(matches!(err, TransferError::SymlinkRefused(_)));
    assert!(fx.recorder.offers().is_empty());
}

/// 单个提供失败只记录在结果中，不影响其他文件
#[tokio::test]
async fn test_failed_offer_is_reported() {
    let fx = Fixture::with_recorder(Recorder {
        reject_name: Some("bad.bin".to_string()),
        ..Default::default()
    });
    fx.write("dir/bad.bin", b"bad");
    fx.write("dir/good.bin", b"good");

    let report = fx.engine.send_path(PEER, "dir").await.unwrap();
    assert_eq!(report.offered.len(), 1);
    assert_eq!(file_name(&report.offered[0].path), "good.bin");
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].error.code(), Some(2));

    assert_eq!(fx.transfers().await.len(), 1);
}

// ============================================================================
// 发送方向
// ============================================================================

#[tokio::test]
async fn test_outbound_chunks_follow_pulls() {
    let fx = Fixture::new();
    fx.write("a.bin", b"0123456789");
    let report = fx.engine.send_path(PEER, "a.bin").await.unwrap();
    let id = report.offered[0].id;

    fx.engine.on_file_control(id, FileControl::Resume);
    fx.engine.on_chunk_requested(id, pull(0, 4));
    fx.engine.on_chunk_requested(id, pull(4, 4));
    fx.engine.on_chunk_requested(id, pull(8, 2));

    let transfers = fx.transfers().await;
    assert_eq!(transfers[0].activity, Activity::Active);
    assert_eq!(transfers[0].progress, 10);
    assert_eq!(
        fx.recorder.chunks(),
        vec![chunk(0, b"0123"), chunk(4, b"4567"), chunk(8, b"89")]
    );

    // 长度为 0 的拉取请求表示结束
    fx.engine.on_chunk_requested(id, pull(10, 0));
    assert!(fx.transfers().await.is_empty());
}

/// 对方的恢复和拉取可能早于本地登记发送状态，登记后按顺序补上
#[tokio::test]
async fn test_events_before_creation_are_replayed() {
    let fx = Fixture::new();
    fx.write("a.bin", b"0123456789");
    // 替身的第一个提供得到 file#0
    let id = TransferId::new(PEER, FileNumber(0));

    fx.engine.on_file_control(id, FileControl::Resume);
    fx.engine.on_chunk_requested(id, pull(0, 4));
    assert!(fx.transfers().await.is_empty());
    assert!(fx.recorder.chunks().is_empty());

    let report = fx.engine.send_path(PEER, "a.bin").await.unwrap();
    assert_eq!(report.offered[0].id, id);

    let transfers = fx.transfers().await;
    assert_eq!(transfers[0].activity, Activity::Active);
    assert_eq!(transfers[0].progress, 4);
    assert_eq!(fx.recorder.chunks(), vec![chunk(0, b"0123")]);

    fx.engine.on_chunk_requested(id, pull(4, 6));
    fx.transfers().await;
    assert_eq!(
        fx.recorder.chunks(),
        vec![chunk(0, b"0123"), chunk(4, b"456789")]
    );
}

#[tokio::test]
async fn test_paused_transfer_ignores_pulls() {
    let fx = Fixture::new();
    fx.write("a.bin", b"0123456789");
    let id = fx.engine.send_path(PEER, "a.bin").await.unwrap().offered[0].id;

    // 对方尚未恢复
    fx.engine.on_chunk_requested(id, pull(0, 4));
    assert_eq!(fx.transfers().await[0].progress, 0);
    assert!(fx.recorder.chunks().is_empty());

    fx.engine.on_file_control(id, FileControl::Resume);
    fx.engine.on_file_control(id, FileControl::Pause);
    fx.engine.on_chunk_requested(id, pull(0, 4));
    assert_eq!(fx.transfers().await[0].activity, Activity::Paused);
    assert!(fx.recorder.chunks().is_empty());
}

#[tokio::test]
async fn test_short_read_sends_nothing() {
    let fx = Fixture::new();
    fx.write("a.bin", b"0123");
    let id = fx.engine.send_path(PEER, "a.bin").await.unwrap().offered[0].id;
    fx.engine.on_file_control(id, FileControl::Resume);

    fx.engine.on_chunk_requested(id, pull(2, 8));
    fx.engine.on_chunk_requested(id, pull(0, 2));

    fx.transfers().await;
    assert_eq!(fx.recorder.chunks(), vec![chunk(0, b"01")]);
}

#[tokio::test]
async fn test_cancel_removes_transfer() {
    let fx = Fixture::new();
    fx.write("a.bin", b"0123");
    let id = fx.engine.send_path(PEER, "a.bin").await.unwrap().offered[0].id;

    fx.engine.on_file_control(id, FileControl::Cancel);
    assert!(fx.transfers().await.is_empty());
}

// ============================================================================
// 接收方向
// ============================================================================

#[tokio::test]
async fn test_inbound_transfer() {
    let fx = Fixture::new();
    fx.engine.on_file_offered(
        INBOUND,
        FileInfo {
            name: "x.bin".to_string(),
            size: 10,
        },
    );

    let transfers = fx.transfers().await;
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].direction, Direction::Inbound);
    assert_eq!(transfers[0].activity, Activity::Active);
    assert_eq!(transfers[0].path, fx.inbox().join("x.bin"));
    assert_eq!(fx.recorder.controls(), vec![(INBOUND, FileControl::Resume)]);

    fx.engine.on_chunk_received(INBOUND, chunk(0, b"0123"));
    fx.engine.on_chunk_received(INBOUND, chunk(4, b"4567"));
    fx.engine.on_chunk_received(INBOUND, chunk(8, b"89"));
    assert_eq!(fx.transfers().await[0].progress, 10);

    fx.engine.on_chunk_received(INBOUND, chunk(10, b""));
    assert!(fx.transfers().await.is_empty());
    assert_eq!(fs::read(fx.inbox().join("x.bin")).unwrap(), b"0123456789");
}

#[tokio::test]
async fn test_offered_name_is_sanitised() {
    let fx = Fixture::new();
    fx.engine.on_file_offered(
        INBOUND,
        FileInfo {
            name: "../../etc/passwd".to_string(),
            size: 1,
        },
    );
    let transfers = fx.transfers().await;
    assert_eq!(transfers[0].path, fx.inbox().join("passwd"));

    let other = TransferId::new(PeerId(1), FileNumber(10));
    fx.engine.on_file_offered(
        other,
        FileInfo {
            name: "..".to_string(),
            size: 1,
        },
    );
    assert_eq!(fx.transfers().await.len(), 1);
    assert_eq!(
        fx.recorder.controls(),
        vec![
            (INBOUND, FileControl::Resume),
            (other, FileControl::Cancel)
        ]
    );
}

#[tokio::test]
async fn test_duplicate_offer_is_rejected() {
    let fx = Fixture::new();
    let info = FileInfo {
        name: "x.bin".to_string(),
        size: 4,
    };
    fx.engine.on_file_offered(INBOUND, info.clone());
    fx.engine.on_chunk_received(INBOUND, chunk(0, b"01"));
    fx.engine.on_file_offered(INBOUND, info);

    let transfers = fx.transfers().await;
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].progress, 2);
    assert_eq!(fx.recorder.controls().len(), 1);
}

#[tokio::test]
async fn test_chunk_for_wrong_direction_is_dropped() {
    let fx = Fixture::new();
    fx.engine.on_file_offered(
        INBOUND,
        FileInfo {
            name: "x.bin".to_string(),
            size: 4,
        },
    );
    fx.engine.on_chunk_requested(INBOUND, pull(0, 4));
    fx.transfers().await;
    assert!(fx.recorder.chunks().is_empty());
}

// ============================================================================
// 一致性错误
// ============================================================================

#[tokio::test]
async fn test_unknown_transfer_is_ignored() {
    let fx = Fixture::new();
    let unknown = TransferId::new(PeerId(7), FileNumber(7));

    fx.engine.on_file_control(unknown, FileControl::Resume);
    fx.engine.on_chunk_requested(unknown, pull(0, 4));
    fx.engine.on_chunk_received(unknown, chunk(0, b"0123"));

    assert!(fx.transfers().await.is_empty());
    assert!(fx.recorder.calls().is_empty());
}

/// 传输层报告的文件错误会丢弃该传输，不向对方发送控制
#[tokio::test]
async fn test_file_error_drops_transfer() {
    let fx = Fixture::new();
    fx.write("a.bin", b"0123");
    let id = fx.engine.send_path(PEER, "a.bin").await.unwrap().offered[0].id;
    let calls_before = fx.recorder.calls().len();

    fx.engine.on_file_error(
        id,
        TransportError::Protocol {
            code: 2,
            message: "tox_file_send_chunk failed".to_string(),
        },
    );

    assert!(fx.transfers().await.is_empty());
    assert_eq!(fx.recorder.calls().len(), calls_before);
}

#[tokio::test]
async fn test_shutdown_stops_engine() {
    let fx = Fixture::new();
    fx.engine.shutdown();

    assert!(matches!(
        fx.engine.snapshot().await,
        Err(TransferError::Stopped)
    ));
    assert!(matches!(
        fx.engine.send_path(PEER, ".").await,
        Ok(report) if report.offered.is_empty()
    ));
}
