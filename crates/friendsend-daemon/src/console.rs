//! 回环控制台
//!
//! 进程内的第二个节点，把标准输入的每一行作为消息发给守护节点，
//! 并把守护节点的回复打印到标准输出。

use anyhow::Result;
use friendsend_core::{BridgeHandle, FriendEvents, PeerId, PublicKey};
use std::sync::{Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, BufReader};

/// 控制台节点的好友事件处理器
#[derive(Default)]
pub struct ConsolePeer {
    daemon: Mutex<Option<PeerId>>,
}

impl ConsolePeer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 守护节点在控制台好友列表中的编号，连接建立前为 `None`
    pub fn daemon(&self) -> Option<PeerId> {
        *self.daemon.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FriendEvents for ConsolePeer {
    fn on_friend_request(&self, key: &PublicKey, _message: &str) -> bool {
        tracing::debug!("控制台忽略好友请求: {}", key);
        false
    }

    fn on_friend_message(&self, peer: PeerId, text: &str) {
        for line in text.lines() {
            println!("[{}] {}", peer, line);
        }
    }

    fn on_friend_name(&self, peer: PeerId, name: &str) {
        *self.daemon.lock().unwrap_or_else(PoisonError::into_inner) = Some(peer);
        tracing::info!("已连接到守护节点 {} ({})", name, peer);
    }
}

/// 读取标准输入直到 EOF 或收到 Ctrl+C
pub async fn run(bridge: &BridgeHandle, console: &ConsolePeer) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("收到中断信号");
                return Ok(());
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    tracing::info!("标准输入已关闭");
                    return Ok(());
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match console.daemon() {
                    Some(daemon) => {
                        if let Err(e) = bridge.send_message(daemon, line).await {
                            tracing::warn!("发送命令失败: {}", e);
                        }
                    }
                    None => tracing::warn!("尚未连接到守护节点，忽略输入: {}", line),
                }
            }
        }
    }
}
