//! 日志系统模块
//!
//! 基于 tracing 生态实现运行时日志：
//!
//! - `EnvFilter` 过滤（`RUST_LOG` 优先于配置的级别）
//! - 控制台与滚动文件两路输出，写入均为非阻塞
//! - 可选 JSON 格式，便于宿主统一采集插件事件
//!
//! 插件事件统一携带 `plugin` 与 `generation` 字段，例如：
//!
//! ```rust,no_run
//! use chips_plugins::utils::logger::{Logger, LoggerConfig, RotationStrategy};
//!
//! let config = LoggerConfig::builder()
//!     .level("debug")
//!     .file_output("./logs")
//!     .rotation(RotationStrategy::Daily)
//!     .build();
//! let _guard = Logger::init(config).unwrap();
//!
//! tracing::info!(plugin = "reviewers", generation = 3, "插件已加载");
//! ```

use crate::core::config::LogConfig;
use crate::utils::{PluginError, Result};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

// ============================================================================
// 日志轮转策略
// ============================================================================

/// 日志文件轮转策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationStrategy {
    /// 单个日志文件
    Never,
    /// 每小时轮转
    Hourly,
    /// 每天轮转（默认）
    #[default]
    Daily,
}

impl RotationStrategy {
    /// 从配置字符串解析，无法识别时回退为每天轮转
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "never" | "none" => RotationStrategy::Never,
            "hourly" | "hour" => RotationStrategy::Hourly,
            _ => RotationStrategy::Daily,
        }
    }

    fn rotation(self) -> Rotation {
        match self {
            RotationStrategy::Never => Rotation::NEVER,
            RotationStrategy::Hourly => Rotation::HOURLY,
            RotationStrategy::Daily => Rotation::DAILY,
        }
    }
}

// ============================================================================
// 日志配置
// ============================================================================

/// 日志系统配置
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// 默认日志级别
    pub level: String,
    /// 是否使用 JSON 格式输出
    pub json_format: bool,
    /// 是否输出到控制台
    pub console_output: bool,
    /// 文件输出目录（None 表示不写文件）
    pub file_output: Option<PathBuf>,
    /// 日志文件名前缀
    pub file_prefix: String,
    /// 轮转策略
    pub rotation: RotationStrategy,
    /// 保留的历史日志文件数
    pub max_files: usize,
    /// 额外的过滤指令（EnvFilter 格式），例如 "chips_plugins::plugin::reaper=debug"
    pub filter_directives: Option<String>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            console_output: true,
            file_output: None,
            file_prefix: "chips-plugins".to_string(),
            rotation: RotationStrategy::Daily,
            max_files: 7,
            filter_directives: None,
        }
    }
}

impl LoggerConfig {
    /// 创建配置构建器
    pub fn builder() -> LoggerConfigBuilder {
        LoggerConfigBuilder::default()
    }

    /// 从运行时配置的 `logging` 段创建
    pub fn from_log_config(log_config: &LogConfig) -> Self {
        Self {
            level: log_config.level.clone(),
            json_format: log_config.json_format,
            file_output: log_config
                .log_dir
                .clone()
                .filter(|_| log_config.file_output),
            rotation: RotationStrategy::parse(&log_config.rotation),
            max_files: log_config.max_files,
            ..Default::default()
        }
    }

    fn parse_level(&self) -> Level {
        self.level.trim().parse().unwrap_or(Level::INFO)
    }

    /// debug 及以下级别时记录管理操作 span 的关闭事件（含耗时）
    fn span_events(&self) -> FmtSpan {
        if self.parse_level() >= Level::DEBUG {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// 日志配置构建器
#[derive(Debug, Default)]
pub struct LoggerConfigBuilder {
    config: LoggerConfig,
}

impl LoggerConfigBuilder {
    /// 设置日志级别
    pub fn level(mut self, level: impl Into<String>) -> Self {
        self.config.level = level.into();
        self
    }

    /// 启用 JSON 格式输出
    pub fn json_format(mut self, enable: bool) -> Self {
        self.config.json_format = enable;
        self
    }

    /// 设置控制台输出
    pub fn console_output(mut self, enable: bool) -> Self {
        self.config.console_output = enable;
        self
    }

    /// 设置文件输出目录
    pub fn file_output(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.file_output = Some(dir.into());
        self
    }

    /// 设置日志文件前缀
    pub fn file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.file_prefix = prefix.into();
        self
    }

    /// 设置轮转策略
    pub fn rotation(mut self, strategy: RotationStrategy) -> Self {
        self.config.rotation = strategy;
        self
    }

    /// 设置保留文件数
    pub fn max_files(mut self, count: usize) -> Self {
        self.config.max_files = count;
        self
    }

    /// 追加过滤指令
    pub fn filter_directives(mut self, directives: impl Into<String>) -> Self {
        self.config.filter_directives = Some(directives.into());
        self
    }

    /// 构建配置
    pub fn build(self) -> LoggerConfig {
        self.config
    }
}

// ============================================================================
// 日志系统
// ============================================================================

/// 日志系统守卫
///
/// 丢弃时等待非阻塞写入器刷出剩余日志，必须保持到程序退出。
#[derive(Default)]
pub struct LogGuard {
    _workers: Vec<WorkerGuard>,
}

static INITIALIZED: AtomicBool = AtomicBool::new(false);

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// 日志系统
pub struct Logger;

impl Logger {
    /// 初始化全局日志订阅者
    ///
    /// # Errors
    ///
    /// 已初始化、日志目录无法创建或全局订阅者设置失败时返回 `Internal`
    pub fn init(config: LoggerConfig) -> Result<LogGuard> {
        if INITIALIZED.swap(true, Ordering::SeqCst) {
            return Err(PluginError::Internal("日志系统已初始化".to_string()));
        }

        let result = Self::install(&config);
        if result.is_err() {
            INITIALIZED.store(false, Ordering::SeqCst);
        }
        result
    }

    /// 尝试初始化日志系统，失败时返回空守卫
    ///
    /// 测试中多次调用是安全的。
    pub fn try_init(config: LoggerConfig) -> LogGuard {
        Self::init(config).unwrap_or_default()
    }

    fn install(config: &LoggerConfig) -> Result<LogGuard> {
        let mut guard = LogGuard::default();
        let mut layers: Vec<BoxedLayer> = Vec::new();

        if config.console_output {
            let (writer, worker) = tracing_appender::non_blocking(io::stdout());
            guard._workers.push(worker);
            layers.push(Self::layer(config, writer, !config.json_format));
        }

        if let Some(ref dir) = config.file_output {
            let appender = RollingFileAppender::builder()
                .rotation(config.rotation.rotation())
                .filename_prefix(&config.file_prefix)
                .filename_suffix("log")
                .max_log_files(config.max_files.max(1))
                .build(dir)
                .map_err(|e| {
                    PluginError::Internal(format!("无法创建日志目录 {}: {}", dir.display(), e))
                })?;
            let (writer, worker) = tracing_appender::non_blocking(appender);
            guard._workers.push(worker);
            layers.push(Self::layer(config, writer, false));
        }

        tracing_subscriber::registry()
            .with(layers)
            .with(Self::filter(config))
            .try_init()
            .map_err(|e| PluginError::Internal(format!("日志系统初始化失败: {}", e)))?;

        Ok(guard)
    }

    fn layer(config: &LoggerConfig, writer: NonBlocking, ansi: bool) -> BoxedLayer {
        let layer = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_span_events(config.span_events());

        if config.json_format {
            layer.json().with_ansi(false).boxed()
        } else {
            layer.with_ansi(ansi).boxed()
        }
    }

    fn filter(config: &LoggerConfig) -> EnvFilter {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.parse_level().as_str().to_lowercase()));

        config
            .filter_directives
            .iter()
            .flat_map(|d| d.split(','))
            .filter_map(|d| d.trim().parse().ok())
            .fold(filter, |f, directive| f.add_directive(directive))
    }
}
