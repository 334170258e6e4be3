//! # Chips Plugins - 薯片插件运行时
//!
//! 嵌入宿主进程的插件运行时，提供以下核心功能：
//!
//! - **插件发现**: 扫描插件目录，识别目录包与压缩包，处理禁用标记与重名
//! - **依赖排序**: 按声明的依赖拓扑排序，检测缺失、版本不兼容与循环
//! - **隔离加载**: 每一代插件拥有独立的命名空间，旧一代释放后回收临时产物
//! - **扩展注册**: 宿主通过单项、集合、映射三类动态集合开放扩展点
//! - **热重载**: 新一代与旧一代对账注册，句柄原地替换，消费者无需重新订阅
//!
//! ## 快速开始
//!
//! ```rust,no_run
//! use chips_plugins::{HostEnvironment, PluginManager, RuntimeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RuntimeConfig::builder().plugins_dir("plugins").build();
//!     let manager = PluginManager::builder(config)
//!         .host(HostEnvironment::empty())
//!         .build()?;
//!
//!     let report = manager.start().await?;
//!     println!("已启动插件: {:?}", report.started);
//!
//!     manager.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## 模块结构
//!
//! - `extension` - 扩展注册表与绑定
//! - `plugin` - 插件发现、加载与管理
//! - `core` - 运行时配置
//! - `utils` - 错误类型与日志系统

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod core;
pub mod extension;
pub mod plugin;
pub mod utils;

// 重导出常用类型，方便使用
pub use extension::{
    ApiTier, Binder, CollectionKind, DynamicItem, DynamicMap, DynamicSet, Extension,
    HostEnvironment, HostScope, Key, LifecycleListener, MapKey, NamedProvider, PluginContext,
    PluginModule, Provider, Qualifier, RegistrationHandle, Subsystem, TypeToken,
};

pub use plugin::{
    CleanupReaper, DescriptorParser, GenerationId, LibraryCatalog, PluginDescriptor,
    PluginEnvironment, PluginEventListener, PluginInfo, PluginManager, PluginManagerBuilder,
    PluginState, ReloadMode, ScanReport, StaticLibrary,
};

pub use utils::{error_code, status_code, PluginError, Result};
pub use utils::logger::{LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, RotationStrategy};

pub use core::config::{CleanupConfig, LogConfig, PluginsConfig, RuntimeConfig, RuntimeConfigBuilder};

/// 库版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 原生插件库 ABI 版本
pub const ABI_VERSION: u32 = plugin::runtime::native::ABI_VERSION;
