//! 插件模块
//!
//! 包含插件运行时的核心组件：
//! - 插件描述与解析
//! - 插件包发现与解码
//! - 依赖排序
//! - 命名空间、模块加载与自动注册
//! - 插件代、注册对账与回收
//! - 插件管理器

pub mod dependency;
pub mod environment;
pub mod generation;
pub mod loader;
pub mod manager;
pub mod metadata;
pub mod package;
pub mod parser;
pub mod reaper;
pub mod runtime;
pub mod scanner;
pub mod table;

// 重导出常用类型
pub use dependency::{DependencyGraph, DependencyResolver};
pub use environment::{PluginEnvironment, PluginEventListener};
pub use generation::{GenerationId, LoadedPlugin};
pub use loader::{LoadedModules, ModuleLoader};
pub use manager::{PluginManager, PluginManagerBuilder, ScanReport};
pub use metadata::{
    Dependency, LibraryRef, ModuleRefs, PluginDescriptor, PluginInfo, PluginState, ReloadMode,
    DESCRIPTOR_FILE,
};
pub use package::{
    ArchivePackageProvider, DirectoryPackageProvider, Fingerprint, OpenOptions, PackageContents,
    PackageProvider, PluginPackage, ProviderRegistry,
};
pub use parser::DescriptorParser;
pub use reaper::CleanupReaper;
pub use runtime::{LibraryCatalog, PluginNamespace, StaticLibrary, Symbol, SymbolLibrary};
pub use scanner::{AutoRegistrationScanner, CodeUnit};
pub use table::{BrokenEntry, DisabledEntry, PluginTable};
