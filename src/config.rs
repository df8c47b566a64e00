use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// 配置文件名（位于程序目录）
pub const CONFIG_FILE: &str = "config.json";

/// 单次搜索结果数上限
pub const MAX_RESULT_CEILING: usize = 500;

/// 未指定数量时的默认结果数
pub const DEFAULT_MAX_RESULTS: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub search: SearchConfig,
    pub backends: BackendSwitches,
    pub instance: InstanceConfig,
    /// 启动后是否自动打开浏览器
    pub open_browser: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub max_result_ceiling: usize,
    pub default_max_results: usize,
    /// 可用性探测子进程超时（秒）
    pub probe_timeout_secs: u64,
    /// 单个目录遍历子进程超时（秒）
    pub enumeration_timeout_secs: u64,
    /// 优先尝试的 Everything SDK 路径
    pub native_library: Option<String>,
}

/// 按层级禁用后端，用于验证降级链路
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSwitches {
    pub disable_native: bool,
    pub disable_os_index: bool,
    pub disable_fs_tool: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// 锁文件路径，相对路径基于程序目录
    pub lock_file: String,
    pub lock_timeout_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            search: SearchConfig::default(),
            backends: BackendSwitches::default(),
            instance: InstanceConfig::default(),
            open_browser: true,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_result_ceiling: MAX_RESULT_CEILING,
            default_max_results: DEFAULT_MAX_RESULTS,
            probe_timeout_secs: 5,
            enumeration_timeout_secs: 30,
            native_library: None,
        }
    }
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            lock_file: "everysearch.lock".to_string(),
            lock_timeout_ms: 1000,
        }
    }
}

impl AppConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn base_url(&self) -> String {
        // 0.0.0.0 无法直接在浏览器打开
        let host = match self.server.host.as_str() {
            "0.0.0.0" | "::" => "127.0.0.1",
            h => h,
        };
        format!("http://{}:{}", host, self.server.port)
    }

    /// 把请求的结果数限制在上限以内，0 视为默认值
    pub fn clamp_max_results(&self, requested: Option<usize>) -> usize {
        let requested = match requested {
            Some(0) | None => self.search.default_max_results,
            Some(n) => n,
        };
        requested.min(self.search.max_result_ceiling)
    }

    pub fn lock_path(&self) -> PathBuf {
        let p = PathBuf::from(&self.instance.lock_file);
        if p.is_absolute() {
            p
        } else {
            install_dir().join(p)
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.search.probe_timeout_secs)
    }

    pub fn enumeration_timeout(&self) -> Duration {
        Duration::from_secs(self.search.enumeration_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.instance.lock_timeout_ms)
    }

    /// 环境变量覆盖：DISABLE_* 关闭对应后端，EVERYSEARCH_HOST/PORT 覆盖监听地址
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let flag = |key: &str| lookup(key).map(|v| v.trim() == "1").unwrap_or(false);

        if flag("DISABLE_EVERYTHING") {
            self.backends.disable_native = true;
        }
        if flag("DISABLE_WINDOWS_SEARCH") {
            self.backends.disable_os_index = true;
        }
        if flag("DISABLE_SIMPLE_SEARCH") {
            self.backends.disable_fs_tool = true;
        }
        if let Some(host) = lookup("EVERYSEARCH_HOST").filter(|h| !h.trim().is_empty()) {
            self.server.host = host.trim().to_string();
        }
        if let Some(port) = lookup("EVERYSEARCH_PORT") {
            match port.trim().parse::<u16>() {
                Ok(p) => self.server.port = p,
                Err(_) => warn!("忽略无效的 EVERYSEARCH_PORT: {}", port),
            }
        }
    }
}

/// 程序所在目录；取不到时退回当前目录
pub fn install_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default())
}

pub fn default_config_path() -> PathBuf {
    install_dir().join(CONFIG_FILE)
}

/// 读取配置文件。文件不存在时写出默认配置；解析失败时使用默认值
pub fn load_config(path: &Path) -> AppConfig {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<AppConfig>(&content) {
            Ok(config) => {
                info!("已加载配置文件: {}", path.display());
                config
            }
            Err(e) => {
                warn!("配置文件 {} 解析失败，使用默认配置: {}", path.display(), e);
                AppConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let config = AppConfig::default();
            if let Err(e) = save_config(path, &config) {
                warn!("无法写入默认配置 {}: {}", path.display(), e);
            } else {
                info!("已创建默认配置文件: {}", path.display());
            }
            config
        }
        Err(e) => {
            warn!("无法读取配置文件 {}，使用默认配置: {}", path.display(), e);
            AppConfig::default()
        }
    }
}

pub fn save_config(path: &Path, config: &AppConfig) -> std::io::Result<()> {
    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(path, content)
}
