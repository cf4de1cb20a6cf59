//! 单个传输的状态

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::transfer::progress::Progress;
use crate::transport::{ChunkRequest, FileChunk, TransferId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Activity {
    Active,
    Paused,
}

/// 传输快照（用于状态查询）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferSummary {
    pub id: TransferId,
    pub direction: Direction,
    pub activity: Activity,
    pub progress: u64,
    pub total: u64,
    /// 0.0 ~ 1.0
    pub fraction: f64,
    pub path: PathBuf,
}

impl fmt::Display for TransferSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = match self.direction {
            Direction::Outbound => "send",
            Direction::Inbound => "recv",
        };
        let activity = match self.activity {
            Activity::Active => "active",
            Activity::Paused => "paused",
        };
        write!(
            f,
            "{} {} {} {}/{} ({:.0}%) {}",
            self.id,
            direction,
            activity,
            self.progress,
            self.total,
            self.fraction * 100.0,
            self.path.display()
        )
    }
}

/// 只由变更线程访问
#[derive(Debug)]
pub(crate) struct TransferState {
    pub direction: Direction,
    pub activity: Activity,
    file: File,
    /// 文件读写头位置；`None` 表示未知，下次读写前必须定位
    cursor: Option<u64>,
    pub progress: Progress,
    pub path: PathBuf,
}

impl TransferState {
    /// 发送方: 只读打开，等待对方恢复后开始
    pub fn outbound(path: &Path, size: u64) -> io::Result<Self> {
        Ok(Self {
            direction: Direction::Outbound,
            activity: Activity::Paused,
            file: File::open(path)?,
            cursor: Some(0),
            progress: Progress::new(size),
            path: path.to_path_buf(),
        })
    }

    /// 接收方: 创建或截断目标文件
    pub fn inbound(path: &Path, size: u64) -> io::Result<Self> {
        Ok(Self {
            direction: Direction::Inbound,
            activity: Activity::Active,
            file: File::create(path)?,
            cursor: Some(0),
            progress: Progress::new(size),
            path: path.to_path_buf(),
        })
    }

    pub fn is_active(&self) -> bool {
        self.activity == Activity::Active
    }

    fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        if self.cursor != Some(offset) {
            self.file.seek(SeekFrom::Start(offset))?;
            self.cursor = Some(offset);
        }
        Ok(())
    }

    /// 读取恰好 `request.length` 字节；失败时读写头回到文件的实际位置
    pub fn read_chunk(&mut self, request: ChunkRequest) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; request.length];
        let result = self
            .seek_to(request.offset)
            .and_then(|()| self.file.read_exact(&mut buf));
        match result {
            Ok(()) => {
                self.cursor = Some(request.offset + request.length as u64);
                self.progress.update(request.offset, request.length as u64);
                Ok(buf)
            }
            Err(e) => {
                self.cursor = self.file.stream_position().ok();
                Err(e)
            }
        }
    }

    /// 在数据块偏移处写入；失败时读写头位置未知
    pub fn write_chunk(&mut self, chunk: &FileChunk) -> io::Result<()> {
        let result = self
            .seek_to(chunk.offset)
            .and_then(|()| self.file.write_all(&chunk.data));
        match result {
            Ok(()) => {
                self.cursor = Some(chunk.offset + chunk.data.len() as u64);
                self.progress.update(chunk.offset, chunk.data.len() as u64);
                Ok(())
            }
            Err(e) => {
                self.cursor = None;
                Err(e)
            }
        }
    }

    pub fn summary(&self, id: TransferId) -> TransferSummary {
        TransferSummary {
            id,
            direction: self.direction,
            activity: self.activity,
            progress: self.progress.progress(),
            total: self.progress.total(),
            fraction: self.progress.fraction(),
            path: self.path.clone(),
        }
    }
}
