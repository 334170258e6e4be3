//! 插件命名空间与符号库
//!
//! 每一代插件拥有独立的 [`PluginNamespace`]，模块与扩展工厂只能通过它按符号名解析。
//! 符号来源有两种：
//!
//! - 宿主进程内注册的符号库（[`LibraryCatalog`]）
//! - 插件包内的原生动态库（[`native::NativeLibrary`]）
//!
//! 命名空间以 `Arc` 计数，绑定到注册表的提供者持有其克隆；
//! 最后一个引用释放时通知清理回收器。

pub mod native;

use crate::extension::{Extension, PluginModule, Provider};
use crate::utils::{PluginError, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::debug;

/// 扩展工厂
pub type Factory = Arc<dyn Fn() -> anyhow::Result<Extension> + Send + Sync>;

/// 符号
#[derive(Clone)]
pub enum Symbol {
    /// 子系统模块
    Module(Arc<dyn PluginModule>),
    /// 扩展工厂（代码单元的实现）
    Factory(Factory),
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Symbol::Module(_) => f.write_str("Symbol::Module"),
            Symbol::Factory(_) => f.write_str("Symbol::Factory"),
        }
    }
}

/// 符号库
pub trait SymbolLibrary: Send + Sync {
    /// 库名称
    fn name(&self) -> &str;

    /// 按名称解析符号
    fn resolve(&self, symbol: &str) -> Option<Symbol>;

    /// 全部符号名称
    fn symbols(&self) -> Vec<String>;
}

/// 静态符号库
///
/// 宿主内置插件直接构建；原生库的注册入口也向它写入符号。
#[derive(Default)]
pub struct StaticLibrary {
    name: String,
    symbols: BTreeMap<String, Symbol>,
}

impl StaticLibrary {
    /// 创建空符号库
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            symbols: BTreeMap::new(),
        }
    }

    /// 注册模块
    pub fn module(mut self, symbol: impl Into<String>, module: impl PluginModule + 'static) -> Self {
        self.add_module(symbol, Arc::new(module));
        self
    }

    /// 注册扩展工厂
    pub fn factory<F>(mut self, symbol: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> anyhow::Result<Extension> + Send + Sync + 'static,
    {
        self.add_factory(symbol, Arc::new(f));
        self
    }

    /// 注册返回固定值克隆的工厂
    pub fn value<T>(self, symbol: impl Into<String>, value: T) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        self.factory(symbol, move || Ok(Arc::new(value.clone()) as Extension))
    }

    /// 注册模块（可变引用形式，供原生库注册入口使用）
    pub fn add_module(&mut self, symbol: impl Into<String>, module: Arc<dyn PluginModule>) {
        self.symbols.insert(symbol.into(), Symbol::Module(module));
    }

    /// 注册扩展工厂（可变引用形式）
    pub fn add_factory(&mut self, symbol: impl Into<String>, factory: Factory) {
        self.symbols.insert(symbol.into(), Symbol::Factory(factory));
    }

    /// 符号数量
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

impl SymbolLibrary for StaticLibrary {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve(&self, symbol: &str) -> Option<Symbol> {
        self.symbols.get(symbol).cloned()
    }

    fn symbols(&self) -> Vec<String> {
        self.symbols.keys().cloned().collect()
    }
}

impl fmt::Debug for StaticLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticLibrary")
            .field("name", &self.name)
            .field("symbols", &self.symbols.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// 宿主内注册的符号库目录
///
/// 插件描述中 `library: linked:<name>` 在这里按名称查找。
/// 重新注册同名库后，下一代插件会解析到新库。
#[derive(Default, Clone)]
pub struct LibraryCatalog {
    libraries: Arc<RwLock<HashMap<String, Arc<dyn SymbolLibrary>>>>,
}

impl LibraryCatalog {
    /// 创建空目录
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册符号库，返回被替换的旧库
    pub fn register(&self, library: impl SymbolLibrary + 'static) -> Option<Arc<dyn SymbolLibrary>> {
        self.register_arc(Arc::new(library))
    }

    /// 注册共享的符号库
    pub fn register_arc(&self, library: Arc<dyn SymbolLibrary>) -> Option<Arc<dyn SymbolLibrary>> {
        let name = library.name().to_string();
        debug!(library = %name, "注册符号库");
        self.libraries.write().insert(name, library)
    }

    /// 移除符号库
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn SymbolLibrary>> {
        self.libraries.write().remove(name)
    }

    /// 查找符号库
    pub fn get(&self, name: &str) -> Option<Arc<dyn SymbolLibrary>> {
        self.libraries.read().get(name).cloned()
    }

    /// 已注册的库名称
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.libraries.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for LibraryCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryCatalog")
            .field("libraries", &self.names())
            .finish()
    }
}

/// 插件命名空间
///
/// 一代插件的符号解析边界。持有符号库与该代的临时产物路径；
/// 释放时通知等待中的回收任务。
pub struct PluginNamespace {
    plugin: String,
    generation: u64,
    library: Option<Arc<dyn SymbolLibrary>>,
    artifacts: Vec<PathBuf>,
    released: Arc<Notify>,
}

impl PluginNamespace {
    /// 创建命名空间
    ///
    /// # Arguments
    ///
    /// * `plugin` - 插件名称
    /// * `generation` - 代标识
    /// * `library` - 符号库，没有声明符号库的插件为 None
    /// * `artifacts` - 该代持有的临时产物
    pub fn new(
        plugin: impl Into<String>,
        generation: u64,
        library: Option<Arc<dyn SymbolLibrary>>,
        artifacts: Vec<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            plugin: plugin.into(),
            generation,
            library,
            artifacts,
            released: Arc::new(Notify::new()),
        })
    }

    /// 插件名称
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// 代标识
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 临时产物
    pub fn artifacts(&self) -> &[PathBuf] {
        &self.artifacts
    }

    /// 释放通知
    pub fn released(&self) -> Arc<Notify> {
        self.released.clone()
    }

    /// 解析符号
    ///
    /// # Errors
    ///
    /// 符号不存在时返回 `SymbolNotFound`
    pub fn resolve(&self, symbol: &str) -> Result<Symbol> {
        self.library
            .as_ref()
            .and_then(|lib| lib.resolve(symbol))
            .ok_or_else(|| PluginError::SymbolNotFound {
                plugin: self.plugin.clone(),
                symbol: symbol.to_string(),
            })
    }

    /// 符号是否存在
    pub fn contains(&self, symbol: &str) -> bool {
        self.library
            .as_ref()
            .map(|lib| lib.resolve(symbol).is_some())
            .unwrap_or(false)
    }

    /// 解析模块符号
    pub fn module(&self, symbol: &str) -> Result<Arc<dyn PluginModule>> {
        match self.resolve(symbol)? {
            Symbol::Module(m) => Ok(m),
            Symbol::Factory(_) => Err(PluginError::invalid_package(
                &self.plugin,
                format!("符号 '{}' 不是模块", symbol),
            )),
        }
    }

    /// 创建按符号名延迟解析的提供者
    ///
    /// 提供者持有命名空间的强引用，首次调用时才解析符号。
    pub fn provider(self: &Arc<Self>, symbol: impl Into<String>) -> Arc<dyn Provider> {
        Arc::new(NamespacedProvider {
            namespace: self.clone(),
            symbol: symbol.into(),
        })
    }

    /// 让任意提供者持有命名空间的强引用
    ///
    /// 模块贡献的提供者可能捕获由本命名空间加载的代码，注册表中只要还有它的快照，
    /// 命名空间就不能释放。
    pub fn guard(self: &Arc<Self>, inner: Arc<dyn Provider>) -> Arc<dyn Provider> {
        Arc::new(GuardedProvider {
            inner,
            _namespace: self.clone(),
        })
    }

    /// 弱引用，用于观察命名空间是否已释放
    pub fn downgrade(self: &Arc<Self>) -> Weak<Self> {
        Arc::downgrade(self)
    }
}

impl Drop for PluginNamespace {
    fn drop(&mut self) {
        debug!(plugin = %self.plugin, generation = self.generation, "命名空间已释放");
        self.released.notify_one();
    }
}

impl fmt::Debug for PluginNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginNamespace")
            .field("plugin", &self.plugin)
            .field("generation", &self.generation)
            .field("library", &self.library.as_ref().map(|l| l.name().to_string()))
            .field("artifacts", &self.artifacts)
            .finish()
    }
}

struct NamespacedProvider {
    namespace: Arc<PluginNamespace>,
    symbol: String,
}

impl Provider for NamespacedProvider {
    fn get(&self) -> anyhow::Result<Extension> {
        match self.namespace.resolve(&self.symbol)? {
            Symbol::Factory(f) => f(),
            Symbol::Module(_) => Err(anyhow::anyhow!(
                "符号 '{}' 是模块，不能作为扩展实现",
                self.symbol
            )),
        }
    }
}

/// 字段按声明顺序释放：先释放内部提供者，再释放命名空间
struct GuardedProvider {
    inner: Arc<dyn Provider>,
    _namespace: Arc<PluginNamespace>,
}

impl Provider for GuardedProvider {
    fn get(&self) -> anyhow::Result<Extension> {
        self.inner.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::Binder;

    struct Empty;

    impl PluginModule for Empty {
        fn configure(&self, _binder: &mut Binder) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn library() -> StaticLibrary {
        StaticLibrary::new("hello")
            .module("hello::Module", Empty)
            .value("hello::Greeter", "hi".to_string())
    }

    #[test]
    fn test_static_library() {
        let lib = library();
        assert_eq!(lib.len(), 2);
        assert!(matches!(lib.resolve("hello::Module"), Some(Symbol::Module(_))));
        assert!(matches!(lib.resolve("hello::Greeter"), Some(Symbol::Factory(_))));
        assert!(lib.resolve("missing").is_none());
        assert_eq!(lib.symbols(), vec!["hello::Greeter", "hello::Module"]);
    }

    #[test]
    fn test_catalog_replace() {
        let catalog = LibraryCatalog::new();
        assert!(catalog.register(library()).is_none());
        assert!(catalog.register(StaticLibrary::new("hello")).is_some());
        assert!(catalog.get("hello").unwrap().symbols().is_empty());
        assert_eq!(catalog.names(), vec!["hello"]);
        assert!(catalog.unregister("hello").is_some());
        assert!(catalog.get("hello").is_none());
    }

    #[test]
    fn test_namespace_resolution() {
        let ns = PluginNamespace::new("hello", 1, Some(Arc::new(library())), vec![]);
        assert!(ns.module("hello::Module").is_ok());
        assert!(ns.module("hello::Greeter").is_err());
        assert!(ns.contains("hello::Greeter"));

        let err = ns.resolve("nope").unwrap_err();
        assert!(matches!(err, PluginError::SymbolNotFound { ref symbol, .. } if symbol == "nope"));

        let provider = ns.provider("hello::Greeter");
        let value = provider.get().unwrap().downcast::<String>().unwrap();
        assert_eq!(value.as_str(), "hi");
    }

    #[test]
    fn test_provider_keeps_namespace_alive() {
        let ns = PluginNamespace::new("hello", 1, Some(Arc::new(library())), vec![]);
        let weak = ns.downgrade();
        let provider = ns.provider("hello::Greeter");
        drop(ns);
        assert!(weak.upgrade().is_some());
        drop(provider);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_guard_keeps_namespace_alive() {
        let ns = PluginNamespace::new("hello", 1, None, vec![]);
        let weak = ns.downgrade();
        let guarded = ns.guard(crate::extension::provider::instance(7u32));
        drop(ns);

        assert!(weak.upgrade().is_some());
        let value = guarded.get().unwrap().downcast::<u32>().unwrap();
        assert_eq!(*value, 7);
        drop(guarded);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_release_notifies() {
        let ns = PluginNamespace::new("hello", 1, None, vec![]);
        let released = ns.released();
        drop(ns);
        // notify_one 在没有等待者时保留一个许可
        tokio::time::timeout(std::time::Duration::from_secs(1), released.notified())
            .await
            .unwrap();
    }
}
