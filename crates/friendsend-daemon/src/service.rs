//! Core Service - 节点、桥接层与传输引擎的组装

use anyhow::{Context, Result};
use friendsend_core::{
    Address, Bridge, BridgeConfig, EngineConfig, MemoryNetwork, NativeError, Settings,
    TransferEngine,
};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::command::{self, CommandHandler};
use crate::console::{self, ConsolePeer};

/// 命令队列容量
const COMMAND_QUEUE: usize = 32;

pub async fn run_service(settings: Settings, download_dir: PathBuf) -> Result<()> {
    tracing::info!("核心服务初始化...");
    let network = MemoryNetwork::new(settings.pump_interval());

    // 守护节点：有保存文件时恢复原来的身份和好友列表
    let saved = match &settings.save_file {
        Some(path) if path.exists() => {
            Some(fs::read(path).with_context(|| format!("无法读取保存文件 {:?}", path))?)
        }
        _ => None,
    };
    let node_name = settings.node_name.clone();
    let factory = network.clone();
    let mut daemon = Bridge::spawn(
        move || match saved {
            Some(state) => factory.restore(&node_name, &state),
            None => Ok(factory.node(&node_name)),
        },
        settings.bridge_config(),
    )
    .context("无法启动守护节点")?;
    let address = daemon.handle().self_address();
    tracing::info!("守护节点地址: {}", address);

    let console_node = network.node("console");
    let console_key = console_node.public_key();
    let mut console = Bridge::spawn(
        move || Ok::<_, NativeError>(console_node),
        BridgeConfig {
            save_file: None,
            ..settings.bridge_config()
        },
    )
    .context("无法启动控制台节点")?;

    let trusted = match &settings.friend_address {
        Some(text) => {
            text.parse::<Address>()
                .with_context(|| format!("好友地址无效: {}", text))?
                .public_key
        }
        None => console_key,
    };
    if trusted != console_key {
        tracing::warn!("控制台不是信任的好友，只有 {} 可以发送命令", trusted);
    }

    let engine = TransferEngine::attach(daemon.handle(), settings.engine_config())
        .context("无法启动传输引擎")?;
    tracing::info!("从目录提供文件: {:?}", engine.root());

    fs::create_dir_all(&download_dir)
        .with_context(|| format!("无法创建下载目录 {:?}", download_dir))?;
    let downloads = TransferEngine::attach(console.handle(), EngineConfig::new(&download_dir))
        .context("无法启动控制台的传输引擎")?;
    tracing::info!("控制台下载目录: {:?}", downloads.receive_dir());

    let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
    daemon
        .handle()
        .register_friend_events(Arc::new(CommandHandler::new(trusted, tx)))?;
    let peer = Arc::new(ConsolePeer::new());
    console.handle().register_friend_events(peer.clone())?;
    let executor = tokio::spawn(command::serve(
        rx,
        daemon.handle().clone(),
        engine.clone(),
        trusted,
    ));

    network
        .request_friend(&console_key, &address, "friendsend console")
        .context("控制台无法发送好友请求")?;
    tracing::info!("等待命令，输入 help 查看可用命令");

    let result = console::run(console.handle(), &peer).await;

    tracing::info!("正在停止...");
    executor.abort();
    tokio::task::spawn_blocking(move || {
        engine.shutdown();
        downloads.shutdown();
        daemon.shutdown();
        console.shutdown();
    })
    .await?;
    tracing::info!("已停止");

    result
}
