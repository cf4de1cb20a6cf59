//! 应用配置和持久化
//!
//! 节点名称、目录、信任的好友地址、队列和流控参数等设置的存储和读取。

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::logging::LogLevel;
use crate::transfer::EngineConfig;
use crate::transport::{BridgeConfig, WindowConfig};

/// 流控窗口设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowSettings {
    /// 新窗口的初始上限
    pub initial_cap: usize,
    /// 上限的最大值
    pub max_cap: usize,
    /// 空闲多少秒后丢弃窗口
    pub idle_timeout_secs: u64,
}

impl Default for WindowSettings {
    fn default() -> Self {
        let window = WindowConfig::default();
        Self {
            initial_cap: window.initial_cap,
            max_cap: window.max_cap,
            idle_timeout_secs: window.idle_timeout.as_secs(),
        }
    }
}

impl WindowSettings {
    pub fn to_config(&self) -> WindowConfig {
        WindowConfig {
            initial_cap: self.initial_cap.max(1),
            max_cap: self.max_cap.max(self.initial_cap).max(1),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }
}

/// 应用设置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// 节点名称（好友看到的名字）
    pub node_name: String,
    /// 发送路径的根目录
    pub root_dir: PathBuf,
    /// 接收目录，为空时与根目录相同
    pub receive_dir: Option<PathBuf>,
    /// 传输状态保存位置
    pub save_file: Option<PathBuf>,
    /// 信任的好友地址（只接受该好友的请求和命令）
    pub friend_address: Option<String>,
    pub log_level: LogLevel,
    /// 事件泵迭代间隔（毫秒）
    pub pump_interval_ms: u64,
    /// 桥接层发送/接收队列容量
    pub queue_capacity: usize,
    /// 传输引擎工作队列容量
    pub work_queue_capacity: usize,
    pub window: WindowSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            node_name: get_default_node_name(),
            root_dir: PathBuf::from("."),
            receive_dir: None,
            save_file: None,
            friend_address: None,
            log_level: LogLevel::Info,
            pump_interval_ms: 50,
            queue_capacity: 512,
            work_queue_capacity: 256,
            window: WindowSettings::default(),
        }
    }
}

impl Settings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("friendsend");
        config_dir.join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &std::path::Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &std::path::Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn pump_interval(&self) -> Duration {
        Duration::from_millis(self.pump_interval_ms.max(1))
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            queue_capacity: self.queue_capacity,
            window: self.window.to_config(),
            save_file: self.save_file.clone(),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            root_dir: self.root_dir.clone(),
            receive_dir: self.receive_dir.clone(),
            queue_capacity: self.work_queue_capacity,
        }
    }
}

/// 获取默认节点名称（主机名）
fn get_default_node_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "friendsend".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.queue_capacity, 512);
        assert_eq!(settings.work_queue_capacity, 256);
        assert_eq!(settings.window.initial_cap, 16);
        assert_eq!(settings.window.max_cap, 64);
        assert_eq!(settings.window.idle_timeout_secs, 60);
        assert!(!settings.node_name.is_empty());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            node_name = "nas"
            log_level = "debug"

            [window]
            max_cap = 128
            "#,
        )
        .unwrap();

        assert_eq!(settings.node_name, "nas");
        assert_eq!(settings.log_level, LogLevel::Debug);
        assert_eq!(settings.window.max_cap, 128);
        assert_eq!(settings.window.initial_cap, 16);
        assert_eq!(settings.pump_interval_ms, 50);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("friendsend").join("settings.toml");

        let settings = Settings {
            node_name: "box".to_string(),
            save_file: Some(PathBuf::from("/var/lib/friendsend/node.json")),
            ..Default::default()
        };
        settings.save_to(&path).unwrap();

        let loaded = Settings::load_from(&path);
        assert_eq!(loaded.node_name, "box");
        assert_eq!(loaded.save_file, settings.save_file);
    }

    #[test]
    fn test_broken_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "queue_capacity = \"lots\"").unwrap();

        let loaded = Settings::load_from(&path);
        assert_eq!(loaded.queue_capacity, 512);
    }

    #[test]
    fn test_window_settings_are_clamped() {
        let window = WindowSettings {
            initial_cap: 0,
            max_cap: 0,
            idle_timeout_secs: 5,
        };
        let config = window.to_config();
        assert_eq!(config.initial_cap, 1);
        assert_eq!(config.max_cap, 1);
        assert_eq!(config.idle_timeout, Duration::from_secs(5));
    }
}
