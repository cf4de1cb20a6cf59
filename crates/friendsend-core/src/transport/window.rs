//! 数据块拉取流控窗口
//!
//! 底层传输自身没有窗口机制: 接收方可以一次性发出任意多个拉取请求。
//! 每个传输维护一个窗口，限制同时交给传输引擎处理的拉取请求数，
//! 在需求持续而窗口空闲时成倍扩大上限（类似慢启动），
//! 长时间无活动的窗口会被丢弃，下次有需求时重新创建。
//!
//! 窗口表只由泵线程持有，不需要加锁。

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use log::debug;

use crate::transport::types::{ChunkRequest, TransferId};

/// 窗口参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    /// 新窗口的初始上限
    pub initial_cap: usize,
    /// 上限的硬性最大值
    pub max_cap: usize,
    /// 超过该时长无活动的窗口会被丢弃
    pub idle_timeout: Duration,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            initial_cap: 16,
            max_cap: 64,
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// 单个传输的流控窗口
#[derive(Debug)]
pub struct FlowWindow {
    pending: VecDeque<ChunkRequest>,
    in_flight: usize,
    cap: usize,
    last_active: Instant,
}

impl FlowWindow {
    pub fn new(cap: usize, now: Instant) -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: 0,
            cap,
            last_active: now,
        }
    }

    /// 加入一个拉取请求，返回本次放行的请求（按到达顺序）
    pub fn admit(&mut self, request: ChunkRequest, now: Instant) -> Vec<ChunkRequest> {
        self.pending.push_back(request);
        self.last_active = now;
        self.drain()
    }

    /// 一个已放行的请求完成，返回因此新放行的请求
    pub fn release_one(&mut self, now: Instant) -> Vec<ChunkRequest> {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.last_active = now;
        self.drain()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_active) > timeout
    }

    /// 需求积压但没有在途请求时扩大上限
    fn grow(&mut self, max_cap: usize) -> bool {
        if self.in_flight == 0 && !self.pending.is_empty() && self.cap < max_cap {
            self.cap = (self.cap.max(1) * 2).min(max_cap);
            true
        } else {
            false
        }
    }

    fn drain(&mut self) -> Vec<ChunkRequest> {
        let mut released = Vec::new();
        while self.in_flight < self.cap {
            let Some(request) = self.pending.pop_front() else {
                break;
            };
            self.in_flight += 1;
            released.push(request);
        }
        released
    }
}

/// 所有传输的窗口
#[derive(Debug)]
pub struct WindowTable {
    config: WindowConfig,
    windows: HashMap<TransferId, FlowWindow>,
}

impl WindowTable {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
        }
    }

    /// 加入拉取请求；窗口不存在时按初始上限创建
    pub fn admit(
        &mut self,
        id: TransferId,
        request: ChunkRequest,
        now: Instant,
    ) -> Vec<ChunkRequest> {
        let initial_cap = self.config.initial_cap;
        self.windows
            .entry(id)
            .or_insert_with(|| FlowWindow::new(initial_cap, now))
            .admit(request, now)
    }

    /// 数据块发送完成；窗口已过期时什么都不做
    pub fn release_one(&mut self, id: TransferId, now: Instant) -> Vec<ChunkRequest> {
        match self.windows.get_mut(&id) {
            Some(window) => window.release_one(now),
            None => Vec::new(),
        }
    }

    /// 周期维护: 丢弃过期窗口、扩大饥饿窗口、放行积压请求
    pub fn sweep(&mut self, now: Instant) -> Vec<(TransferId, ChunkRequest)> {
        let WindowConfig {
            max_cap,
            idle_timeout,
            ..
        } = self.config;

        self.windows.retain(|id, window| {
            let keep = !window.is_stale(now, idle_timeout);
            if !keep {
                debug!(
                    "Dropping stale flow window of {} ({} pending, {} in flight)",
                    id,
                    window.pending(),
                    window.in_flight()
                );
            }
            keep
        });

        let mut released = Vec::new();
        for (id, window) in &mut self.windows {
            if window.grow(max_cap) {
                debug!("Flow window of {} grew to {}", id, window.cap());
            }
            released.extend(window.drain().into_iter().map(|request| (*id, request)));
        }
        released
    }

    pub fn get(&self, id: &TransferId) -> Option<&FlowWindow> {
        self.windows.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::types::{FileNumber, PeerId};

    const ID: TransferId = TransferId::new(PeerId(0), FileNumber(1));

    fn request(i: u64) -> ChunkRequest {
        ChunkRequest {
            offset: i * 100,
            length: 100,
        }
    }

    fn table(initial_cap: usize) -> WindowTable {
        WindowTable::new(WindowConfig {
            initial_cap,
            ..Default::default()
        })
    }

    #[test]
    fn test_admit_releases_up_to_cap() {
        let now = Instant::now();
        let mut windows = table(4);

        let mut released = Vec::new();
        for i in 0..10 {
            released.extend(windows.admit(ID, request(i), now));
        }

        assert_eq!(released, (0..4).map(request).collect::<Vec<_>>());
        let window = windows.get(&ID).unwrap();
        assert_eq!(window.in_flight(), 4);
        assert_eq!(window.pending(), 6);
    }

    #[test]
    fn test_release_one_admits_exactly_one() {
        let now = Instant::now();
        let mut windows = table(4);
        for i in 0..10 {
            windows.admit(ID, request(i), now);
        }

        let released = windows.release_one(ID, now);
        assert_eq!(released, vec![request(4)]);

        let window = windows.get(&ID).unwrap();
        assert_eq!(window.in_flight(), 4);
        assert_eq!(window.pending(), 5);
    }

    #[test]
    fn test_release_on_missing_window_is_noop() {
        let mut windows = table(4);
        assert!(windows.release_one(ID, Instant::now()).is_empty());
        assert!(windows.get(&ID).is_none());
    }

    #[test]
    fn test_sweep_doubles_starved_window() {
        let now = Instant::now();
        let mut windows = table(4);
        for i in 0..20 {
            windows.admit(ID, request(i), now);
        }
        // 模拟所有在途请求都已结算但积压未被放行
        windows.windows.get_mut(&ID).unwrap().in_flight = 0;

        let released = windows.sweep(now);

        let window = windows.get(&ID).unwrap();
        assert_eq!(window.cap(), 8);
        assert_eq!(released.len(), 8);
        assert_eq!(released[0], (ID, request(4)));
        assert_eq!(window.in_flight(), 8);
        assert_eq!(window.pending(), 8);
    }

    #[test]
    fn test_sweep_growth_is_bounded() {
        let now = Instant::now();
        let mut windows = WindowTable::new(WindowConfig {
            initial_cap: 48,
            max_cap: 64,
            idle_timeout: Duration::from_secs(60),
        });
        for i in 0..100 {
            windows.admit(ID, request(i), now);
        }
        windows.windows.get_mut(&ID).unwrap().in_flight = 0;

        windows.sweep(now);
        assert_eq!(windows.get(&ID).unwrap().cap(), 64);

        windows.windows.get_mut(&ID).unwrap().in_flight = 0;
        windows.sweep(now);
        assert_eq!(windows.get(&ID).unwrap().cap(), 64);
    }

    #[test]
    fn test_sweep_keeps_busy_window_cap() {
        let now = Instant::now();
        let mut windows = table(4);
        for i in 0..10 {
            windows.admit(ID, request(i), now);
        }

        assert!(windows.sweep(now).is_empty());
        assert_eq!(windows.get(&ID).unwrap().cap(), 4);
    }

    #[test]
    fn test_sweep_drops_stale_window_with_pending() {
        let start = Instant::now();
        let mut windows = table(2);
        for i in 0..5 {
            windows.admit(ID, request(i), start);
        }
        assert_eq!(windows.get(&ID).unwrap().pending(), 3);

        let later = start + Duration::from_secs(61);
        assert!(windows.sweep(later).is_empty());
        assert!(windows.get(&ID).is_none());

        // 下次需求时重新创建
        let released = windows.admit(ID, request(9), later);
        assert_eq!(released, vec![request(9)]);
    }
}
