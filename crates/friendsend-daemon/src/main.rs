//! Friendsend Daemon
//!
//! 后台守护进程，负责：
//! - 加载设置并应用命令行覆盖
//! - 启动节点的桥接层和传输引擎
//! - 执行信任好友通过消息发来的命令
//! - 在同一进程内运行一个回环控制台节点

mod command;
mod console;
mod service;

use anyhow::Result;
use clap::Parser;
use friendsend_core::{LogLevel, Settings};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "friendsend-daemon", version, about = "通过好友网络共享目录的守护进程")]
struct Args {
    /// 设置文件路径（默认在用户配置目录下）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 发送路径的根目录
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// 接收目录
    #[arg(long)]
    receive_dir: Option<PathBuf>,

    /// 信任的好友地址（76 位十六进制）
    #[arg(short, long)]
    friend: Option<String>,

    /// 节点状态保存文件
    #[arg(long)]
    save_file: Option<PathBuf>,

    /// 节点名称
    #[arg(short, long)]
    name: Option<String>,

    /// 控制台节点的下载目录
    #[arg(long, default_value = "downloads")]
    download_dir: PathBuf,

    /// 核心库日志级别 (error/warn/info/debug/trace)
    #[arg(short, long)]
    log_level: Option<LogLevel>,
}

impl Args {
    fn apply(&self, settings: &mut Settings) {
        if let Some(root) = &self.root {
            settings.root_dir = root.clone();
        }
        if let Some(dir) = &self.receive_dir {
            settings.receive_dir = Some(dir.clone());
        }
        if let Some(friend) = &self.friend {
            settings.friend_address = Some(friend.clone());
        }
        if let Some(file) = &self.save_file {
            settings.save_file = Some(file.clone());
        }
        if let Some(name) = &self.name {
            settings.node_name = name.clone();
        }
        if let Some(level) = self.log_level {
            settings.log_level = level;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 桥接 log crate（friendsend-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    // 初始化日志
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,friendsend_core=debug")),
        )
        .try_init();

    tracing::info!("Friendsend Daemon starting...");

    let mut settings = match &args.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    };
    args.apply(&mut settings);
    friendsend_core::logging::set_level(settings.log_level);
    tracing::debug!("设置: {:?}", settings);

    let result = service::run_service(settings, args.download_dir).await;
    if let Err(e) = &result {
        tracing::error!("核心服务退出: {:#}", e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_override_settings() {
        let args = Args::parse_from([
            "friendsend-daemon",
            "--root",
            "/srv/share",
            "--name",
            "nas",
            "--log-level",
            "debug",
        ]);
        let mut settings = Settings {
            node_name: "box".to_string(),
            save_file: Some(PathBuf::from("node.json")),
            ..Default::default()
        };
        args.apply(&mut settings);

        assert_eq!(settings.root_dir, PathBuf::from("/srv/share"));
        assert_eq!(settings.node_name, "nas");
        assert_eq!(settings.log_level, LogLevel::Debug);
        // 未指定的选项保持文件中的值
        assert_eq!(settings.save_file, Some(PathBuf::from("node.json")));
        assert_eq!(args.download_dir, PathBuf::from("downloads"));
    }

    #[test]
    fn test_rejects_bad_log_level() {
        assert!(Args::try_parse_from(["friendsend-daemon", "--log-level", "loud"]).is_err());
    }
}
