//! 好友消息命令
//!
//! 信任的好友通过文本消息控制守护进程，每行一条命令:
//! `send <path>`、`save`、`status`、`help`。

use friendsend_core::{
    BridgeHandle, FriendEvents, PeerId, PublicKey, SendReport, TransferEngine,
};
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tokio::sync::mpsc;

static COMMAND_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\S+)(?:\s+(.*?))?\s*$").unwrap());

const HELP: &str = "commands:
  send <path>  send a file or directory under the shared root
  save         persist the node state
  status       list active transfers
  help         show this message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    Save,
    Status,
    Help,
    Unknown(String),
}

impl Command {
    /// 解析一行文本，空行返回 `None`
    pub fn parse(line: &str) -> Option<Self> {
        let caps = COMMAND_PATTERN.captures(line)?;
        let verb = caps.get(1)?.as_str();
        let arg = caps.get(2).map(|m| m.as_str()).filter(|s| !s.is_empty());

        let command = match (verb.to_lowercase().as_str(), arg) {
            ("send", Some(path)) => Command::Send(path.to_string()),
            ("save", None) => Command::Save,
            ("status", None) => Command::Status,
            ("help", None) => Command::Help,
            _ => Command::Unknown(line.trim().to_string()),
        };
        Some(command)
    }
}

/// 来自某个好友的一条命令
#[derive(Debug)]
pub struct Request {
    pub peer: PeerId,
    pub command: Command,
}

/// 守护节点的好友事件处理器
///
/// 运行在调度线程上，不能阻塞：命令只入队，由 [`serve`] 异步执行。
pub struct CommandHandler {
    trusted: PublicKey,
    requests: mpsc::Sender<Request>,
}

impl CommandHandler {
    pub fn new(trusted: PublicKey, requests: mpsc::Sender<Request>) -> Self {
        Self { trusted, requests }
    }
}

impl FriendEvents for CommandHandler {
    fn on_friend_request(&self, key: &PublicKey, message: &str) -> bool {
        if *key == self.trusted {
            tracing::info!("接受信任好友的请求: {}", key);
            true
        } else {
            tracing::warn!("拒绝未知公钥的好友请求: {} ({})", key, message);
            false
        }
    }

    fn on_friend_message(&self, peer: PeerId, text: &str) {
        for command in text.lines().filter_map(Command::parse) {
            tracing::debug!("收到命令 {:?} 来自 {}", command, peer);
            if let Err(e) = self.requests.try_send(Request { peer, command }) {
                tracing::warn!("命令队列不可用，丢弃来自 {} 的命令: {}", peer, e);
            }
        }
    }

    fn on_friend_name(&self, peer: PeerId, name: &str) {
        tracing::info!("好友 {} 的名字: {}", peer, name);
    }
}

/// 依次执行命令并把结果回复给发送者
///
/// 好友编号可能来自旧的保存文件，每条命令执行前都重新核对发送者的公钥，
/// 不是 `trusted` 的命令直接丢弃且不回复。
pub async fn serve(
    mut requests: mpsc::Receiver<Request>,
    bridge: BridgeHandle,
    engine: Arc<TransferEngine>,
    trusted: PublicKey,
) {
    while let Some(Request { peer, command }) = requests.recv().await {
        match bridge.friend_public_key(peer).await {
            Ok(key) if key == trusted => {}
            Ok(key) => {
                tracing::warn!("忽略非信任好友 {} ({}) 的命令 {:?}", peer, key, command);
                continue;
            }
            Err(e) => {
                tracing::warn!("无法确认 {} 的公钥，忽略命令 {:?}: {}", peer, command, e);
                continue;
            }
        }
        let reply = execute(&command, peer, &bridge, &engine).await;
        if let Err(e) = bridge.send_message(peer, reply).await {
            tracing::warn!("回复 {} 失败: {}", peer, e);
        }
    }
    tracing::debug!("命令队列已关闭");
}

pub async fn execute(
    command: &Command,
    peer: PeerId,
    bridge: &BridgeHandle,
    engine: &TransferEngine,
) -> String {
    match command {
        Command::Send(path) => match engine.send_path(peer, path).await {
            Ok(report) => describe_report(&report),
            Err(e) => format!("error: {}", e),
        },
        Command::Save => match bridge.save_state().await {
            Ok(written) => format!("saved {} bytes", written),
            Err(e) => format!("error: {}", e),
        },
        Command::Status => match engine.snapshot().await {
            Ok(transfers) if transfers.is_empty() => "no active transfers".to_string(),
            Ok(transfers) => transfers
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("\n"),
            Err(e) => format!("error: {}", e),
        },
        Command::Help => HELP.to_string(),
        Command::Unknown(text) => format!("error: unknown command '{}'", text),
    }
}

fn describe_report(report: &SendReport) -> String {
    let mut reply = format!("offered {} files", report.offered.len());
    for failed in &report.failed {
        reply.push_str(&format!("\nfailed {}: {}", failed.path.display(), failed.error));
    }
    reply
}
