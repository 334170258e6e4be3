//! 模块加载器
//!
//! 为每一代插件创建独立命名空间，解析各子系统的模块：
//! 显式声明的模块从符号库解析，未声明的子系统由自动注册扫描器合成。

use super::metadata::{ApiTier, LibraryRef};
use super::package::{remove_artifact, PackageContents};
use super::runtime::native::NativeLibrary;
use super::runtime::{LibraryCatalog, PluginNamespace, SymbolLibrary};
use super::scanner::{AutoRegistrationScanner, ScannedModule};
use crate::extension::{HostEnvironment, PluginModule, Subsystem};
use crate::utils::{PluginError, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// 子系统模块槽位（按 [`Subsystem::index`] 排列）
pub type ModuleSlots = [Option<Arc<dyn PluginModule>>; 3];

/// 加载结果
pub struct LoadedModules {
    /// 命名空间
    pub namespace: Arc<PluginNamespace>,
    /// 各子系统模块
    pub modules: ModuleSlots,
}

impl LoadedModules {
    /// 实际加载的子系统
    pub fn subsystems(&self) -> Vec<Subsystem> {
        Subsystem::ALL
            .into_iter()
            .filter(|s| self.modules[s.index()].is_some())
            .collect()
    }
}

impl std::fmt::Debug for LoadedModules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModules")
            .field("namespace", &self.namespace)
            .field("subsystems", &self.subsystems())
            .finish()
    }
}

/// 模块加载器
pub struct ModuleLoader {
    env: Arc<HostEnvironment>,
    catalog: LibraryCatalog,
    max_unit_size: u64,
}

impl ModuleLoader {
    /// 创建加载器
    pub fn new(env: Arc<HostEnvironment>, catalog: LibraryCatalog, max_unit_size: u64) -> Self {
        Self {
            env,
            catalog,
            max_unit_size,
        }
    }

    /// 加载一代插件的模块
    ///
    /// 失败时删除该包已产生的临时产物。
    ///
    /// # Arguments
    ///
    /// * `contents` - 解码后的包内容
    /// * `generation` - 代标识
    ///
    /// # Errors
    ///
    /// - 扩展层插件声明 shell 模块、符号库未注册、模块符号缺失：`InvalidPackage`
    /// - 自动注册扫描失败：`InvalidPackage`
    /// - 原生库加载失败：`InvalidPackage` / `AbiMismatch` / `SymbolNotFound`
    pub fn load(&self, contents: &PackageContents, generation: u64) -> Result<LoadedModules> {
        let result = self.load_inner(contents, generation);
        if result.is_err() {
            for artifact in &contents.artifacts {
                remove_artifact(artifact);
            }
        }
        result
    }

    fn load_inner(&self, contents: &PackageContents, generation: u64) -> Result<LoadedModules> {
        let desc = &contents.descriptor;
        let plugin = desc.name.as_str();

        if desc.api == ApiTier::Extension && desc.modules.shell.is_some() {
            return Err(PluginError::invalid_package(
                plugin,
                "扩展层插件不能声明 shell 模块",
            ));
        }

        let library: Option<Arc<dyn SymbolLibrary>> = match desc.library_ref() {
            Some(LibraryRef::Linked(name)) => Some(self.catalog.get(&name).ok_or_else(|| {
                PluginError::invalid_package(plugin, format!("符号库 '{}' 未在宿主中注册", name))
            })?),
            Some(LibraryRef::Native(_)) => {
                let path = contents.native_library().ok_or_else(|| {
                    PluginError::Internal(format!("插件 '{}' 的原生库路径无法解析", plugin))
                })?;
                Some(Arc::new(NativeLibrary::load(plugin, &path)?) as Arc<dyn SymbolLibrary>)
            }
            None => None,
        };

        let namespace = PluginNamespace::new(
            plugin,
            generation,
            library,
            contents.artifacts.clone(),
        );

        let mut modules: ModuleSlots = [None, None, None];
        let mut missing = Vec::new();
        for subsystem in Subsystem::ALL {
            match desc.modules.get(subsystem) {
                Some(symbol) if !self.env.has_subsystem(subsystem) => {
                    warn!(plugin = %plugin, subsystem = %subsystem, module = %symbol, "宿主没有该子系统，忽略模块");
                }
                Some(symbol) => {
                    let module = namespace.module(symbol).map_err(|e| match e {
                        PluginError::SymbolNotFound { symbol, .. } => PluginError::invalid_package(
                            plugin,
                            format!("{} 模块符号 '{}' 不存在", subsystem, symbol),
                        ),
                        other => other,
                    })?;
                    modules[subsystem.index()] = Some(module);
                }
                None => missing.push(subsystem),
            }
        }

        if !missing.is_empty() && !contents.units.is_empty() {
            let scanner = AutoRegistrationScanner::new(&self.env, self.max_unit_size);
            let scan = scanner.scan(plugin, &contents.units)?;
            for subsystem in missing {
                if let Some(module) = ScannedModule::synthesize(&scan, subsystem, &namespace) {
                    debug!(plugin = %plugin, subsystem = %subsystem, "合成自动注册模块");
                    modules[subsystem.index()] = Some(module);
                }
            }
        }

        Ok(LoadedModules { namespace, modules })
    }
}
