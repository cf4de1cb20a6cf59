//! 传输进度
//!
//! 记录从 0 开始连续确认的字节数（高水位）。数据块通常按顺序到达，
//! 乱序到达的数据块不会被重组，超前的数据块直接把高水位推到其末尾。

use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    total: u64,
    mark: u64,
}

impl Progress {
    pub fn new(total: u64) -> Self {
        Self { total, mark: 0 }
    }

    /// 确认 `[offset, offset + length)` 范围内的字节
    pub fn update(&mut self, offset: u64, length: u64) {
        let end = offset.saturating_add(length);
        if offset <= self.mark && end > self.mark {
            self.mark = end;
        } else if offset > self.mark {
            debug!("Progress jumped from {} to {}", self.mark, offset);
            self.mark = end;
        }
    }

    pub fn progress(&self) -> u64 {
        self.mark
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_complete(&self) -> bool {
        self.mark >= self.total
    }

    /// 0.0 ~ 1.0；空文件视为已完成
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            (self.mark.min(self.total) as f64) / (self.total as f64)
        }
    }
}
