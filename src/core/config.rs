//! 运行时配置
//!
//! 定义插件运行时的配置结构和加载逻辑。配置文件按扩展名选择 JSON 或 YAML。

use crate::utils::{PluginError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 插件目录与管理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// 插件包所在目录
    #[serde(default = "default_plugins_dir")]
    pub plugins_dir: PathBuf,

    /// 插件数据目录（每个插件一个子目录）
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// 临时目录（解码副本、提取的原生库）
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,

    /// 变更检测间隔（毫秒），0 表示关闭周期扫描
    #[serde(default = "default_check_frequency_ms")]
    pub check_frequency_ms: u64,

    /// 是否允许远程管理（安装、启用、禁用）
    #[serde(default)]
    pub allow_remote_admin: bool,

    /// 必需插件列表
    #[serde(default)]
    pub mandatory: Vec<String>,

    /// 单个代码单元的大小上限（字节）
    #[serde(default = "default_max_unit_size")]
    pub max_unit_size: u64,

    /// 名称冲突时优先的包格式（按提供者 ID）
    #[serde(default = "default_format_priority")]
    pub format_priority: Vec<String>,
}

fn default_plugins_dir() -> PathBuf {
    PathBuf::from("plugins")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_tmp_dir() -> PathBuf {
    std::env::temp_dir().join("chips-plugins")
}

fn default_check_frequency_ms() -> u64 {
    60_000
}

fn default_max_unit_size() -> u64 {
    1024 * 1024
}

fn default_format_priority() -> Vec<String> {
    vec!["zip".to_string(), "directory".to_string()]
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            plugins_dir: default_plugins_dir(),
            data_dir: default_data_dir(),
            tmp_dir: default_tmp_dir(),
            check_frequency_ms: default_check_frequency_ms(),
            allow_remote_admin: false,
            mandatory: vec![],
            max_unit_size: default_max_unit_size(),
            format_priority: default_format_priority(),
        }
    }
}

impl PluginsConfig {
    /// 变更检测间隔，关闭时返回 None
    pub fn check_frequency(&self) -> Option<Duration> {
        (self.check_frequency_ms > 0).then(|| Duration::from_millis(self.check_frequency_ms))
    }

    /// 是否为必需插件
    pub fn is_mandatory(&self, name: &str) -> bool {
        self.mandatory.iter().any(|m| m == name)
    }
}

/// 回收器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// 首次重试延迟（毫秒）
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// 最大重试延迟（毫秒）
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// 每隔多少次尝试输出一次警告
    #[serde(default = "default_warn_every")]
    pub warn_every: u32,

    /// 停止时等待回收完成的最长时间（毫秒）
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_warn_every() -> u32 {
    10
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            warn_every: default_warn_every(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 是否输出到文件
    #[serde(default)]
    pub file_output: bool,

    /// 日志文件目录
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// 是否输出 JSON 格式
    #[serde(default)]
    pub json_format: bool,

    /// 日志轮转策略
    #[serde(default = "default_rotation")]
    pub rotation: String,

    /// 保留日志文件数
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

fn default_max_files() -> usize {
    7
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: false,
            log_dir: None,
            json_format: false,
            rotation: default_rotation(),
            max_files: default_max_files(),
        }
    }
}

/// 运行时配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// 配置文件路径
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    /// 插件管理配置
    #[serde(default)]
    pub plugins: PluginsConfig,

    /// 回收器配置
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// 日志配置
    #[serde(default)]
    pub logging: LogConfig,
}

impl RuntimeConfig {
    /// 创建配置构建器
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// 从文件加载配置
    pub async fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| PluginError::ConfigLoadFailed(format!("{}: {}", path.display(), e)))?;

        let mut config: RuntimeConfig = if path.extension().map(|e| e == "json").unwrap_or(false) {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        config.config_path = Some(path);
        Ok(config)
    }

    /// 校验配置取值
    pub fn validate(&self) -> Result<()> {
        if self.plugins.plugins_dir.as_os_str().is_empty() {
            return Err(PluginError::InvalidConfigValue {
                key: "plugins.plugins_dir".to_string(),
                reason: "不能为空".to_string(),
            });
        }
        if self.plugins.max_unit_size == 0 {
            return Err(PluginError::InvalidConfigValue {
                key: "plugins.max_unit_size".to_string(),
                reason: "必须大于 0".to_string(),
            });
        }
        if self.cleanup.initial_delay_ms == 0 {
            return Err(PluginError::InvalidConfigValue {
                key: "cleanup.initial_delay_ms".to_string(),
                reason: "必须大于 0".to_string(),
            });
        }
        if self.cleanup.max_delay_ms < self.cleanup.initial_delay_ms {
            return Err(PluginError::InvalidConfigValue {
                key: "cleanup.max_delay_ms".to_string(),
                reason: format!("不能小于 initial_delay_ms ({})", self.cleanup.initial_delay_ms),
            });
        }
        if self.cleanup.warn_every == 0 {
            return Err(PluginError::InvalidConfigValue {
                key: "cleanup.warn_every".to_string(),
                reason: "必须大于 0".to_string(),
            });
        }
        Ok(())
    }

    /// 合并另一个配置（用于覆盖）
    pub fn merge(&mut self, other: RuntimeConfig) {
        // 只覆盖非默认值的配置
        if other.plugins.plugins_dir != default_plugins_dir() {
            self.plugins.plugins_dir = other.plugins.plugins_dir;
        }
        if other.plugins.data_dir != default_data_dir() {
            self.plugins.data_dir = other.plugins.data_dir;
        }
        if other.plugins.tmp_dir != default_tmp_dir() {
            self.plugins.tmp_dir = other.plugins.tmp_dir;
        }
        if other.plugins.check_frequency_ms != default_check_frequency_ms() {
            self.plugins.check_frequency_ms = other.plugins.check_frequency_ms;
        }
        if other.plugins.allow_remote_admin {
            self.plugins.allow_remote_admin = true;
        }
        for name in other.plugins.mandatory {
            if !self.plugins.mandatory.contains(&name) {
                self.plugins.mandatory.push(name);
            }
        }
        if other.logging.level != default_log_level() {
            self.logging.level = other.logging.level;
        }
        if other.logging.file_output {
            self.logging.file_output = true;
            self.logging.log_dir = other.logging.log_dir;
        }
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置插件目录
    pub fn plugins_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.plugins.plugins_dir = dir.into();
        self
    }

    /// 设置数据目录
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.plugins.data_dir = dir.into();
        self
    }

    /// 设置临时目录
    pub fn tmp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.plugins.tmp_dir = dir.into();
        self
    }

    /// 设置变更检测间隔（毫秒）
    pub fn check_frequency_ms(mut self, ms: u64) -> Self {
        self.config.plugins.check_frequency_ms = ms;
        self
    }

    /// 允许远程管理
    pub fn allow_remote_admin(mut self, allow: bool) -> Self {
        self.config.plugins.allow_remote_admin = allow;
        self
    }

    /// 添加必需插件
    pub fn mandatory(mut self, name: impl Into<String>) -> Self {
        self.config.plugins.mandatory.push(name.into());
        self
    }

    /// 设置代码单元大小上限
    pub fn max_unit_size(mut self, bytes: u64) -> Self {
        self.config.plugins.max_unit_size = bytes;
        self
    }

    /// 设置回收重试延迟（毫秒）
    pub fn cleanup_delays(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.config.cleanup.initial_delay_ms = initial_ms;
        self.config.cleanup.max_delay_ms = max_ms;
        self
    }

    /// 设置日志级别
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// 启用文件日志
    pub fn file_logging(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.config.logging.file_output = true;
        self.config.logging.log_dir = Some(log_dir.into());
        self
    }

    /// 构建配置
    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}
