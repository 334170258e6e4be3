//! 绑定器
//!
//! 插件模块通过 [`Binder`] 声明自己向扩展点贡献的绑定与生命周期监听器，
//! 并按作用域链查找宿主与本插件已有的服务。

use super::provider::{self, Provider};
use super::scope::{ApiTier, HostScope, PluginScope, Subsystem};
use super::{Extension, Key, Qualifier, TypeToken};
use std::any::Any;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// 扩展绑定：键 + 提供者
#[derive(Clone)]
pub struct Binding {
    /// 绑定键
    pub key: Key,
    /// 提供者
    pub provider: Arc<dyn Provider>,
}

impl Binding {
    /// 创建绑定
    pub fn new(key: Key, provider: Arc<dyn Provider>) -> Self {
        Self { key, provider }
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Binding").field(&self.key).finish()
    }
}

/// 插件模块
///
/// 每个子系统最多一个模块，由插件包显式声明或由自动注册扫描器合成。
pub trait PluginModule: Send + Sync {
    /// 向绑定器声明绑定
    fn configure(&self, binder: &mut Binder) -> anyhow::Result<()>;
}

/// 插件生命周期监听器
///
/// 插件启动时按注册顺序调用 `start`，停止时逆序调用 `stop`。
pub trait LifecycleListener: Send + Sync {
    /// 启动
    fn start(&self) -> anyhow::Result<()>;

    /// 停止
    fn stop(&self) {}
}

/// 插件上下文
#[derive(Debug, Clone)]
pub struct PluginContext {
    /// 插件名称
    pub name: String,
    /// 插件版本
    pub version: String,
    /// 代标识
    pub generation: u64,
    /// 插件数据目录
    pub data_dir: PathBuf,
}

impl PluginContext {
    /// 插件数据目录，不存在时创建
    pub fn ensure_data_dir(&self) -> std::io::Result<&Path> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(&self.data_dir)
    }
}

/// 作用域链上的父级
#[derive(Clone, Default)]
pub(crate) struct ScopeParents {
    pub(crate) plugin: Vec<Arc<PluginScope>>,
    pub(crate) host: Vec<Arc<HostScope>>,
}

/// 绑定器
pub struct Binder {
    context: PluginContext,
    subsystem: Subsystem,
    tier: ApiTier,
    parents: ScopeParents,
    bindings: Vec<Binding>,
    listeners: Vec<Arc<dyn LifecycleListener>>,
}

impl Binder {
    pub(crate) fn new(
        context: PluginContext,
        subsystem: Subsystem,
        tier: ApiTier,
        parents: ScopeParents,
    ) -> Self {
        Self {
            context,
            subsystem,
            tier,
            parents,
            bindings: Vec::new(),
            listeners: Vec::new(),
        }
    }

    /// 插件上下文
    pub fn context(&self) -> &PluginContext {
        &self.context
    }

    /// 当前子系统
    pub fn subsystem(&self) -> Subsystem {
        self.subsystem
    }

    /// 插件信任层级
    pub fn tier(&self) -> ApiTier {
        self.tier
    }

    /// 开始声明一个绑定
    pub fn bind(&mut self, token: impl Into<TypeToken>) -> BindingBuilder<'_> {
        BindingBuilder {
            binder: self,
            token: token.into(),
            qualifier: None,
        }
    }

    /// 直接添加绑定
    pub fn add(&mut self, binding: Binding) {
        self.bindings.push(binding);
    }

    /// 注册生命周期监听器
    pub fn listen(&mut self, listener: Arc<dyn LifecycleListener>) {
        self.listeners.push(listener);
    }

    /// 安装另一个模块的绑定
    pub fn install(&mut self, module: &dyn PluginModule) -> anyhow::Result<()> {
        module.configure(self)
    }

    /// 按作用域链查找提供者
    ///
    /// 查找顺序：本模块已声明的绑定 → 本插件父作用域 → 宿主作用域（按信任层级过滤）。
    pub fn provider(&self, token: impl Into<TypeToken>) -> Option<Arc<dyn Provider>> {
        let token = token.into();
        let own = self
            .bindings
            .iter()
            .find(|b| b.key.token == token && !b.key.qualifier.as_ref().map(Qualifier::is_unique).unwrap_or(false))
            .map(|b| b.provider.clone());

        own.or_else(|| self.parents.plugin.iter().find_map(|s| s.provider(&token)))
            .or_else(|| {
                self.parents
                    .host
                    .iter()
                    .find_map(|s| s.service(&token, self.tier))
            })
    }

    /// 按作用域链获取实例并向下转型
    pub fn get_as<T: Any + Send + Sync>(&self, token: impl Into<TypeToken>) -> anyhow::Result<Arc<T>> {
        let token = token.into();
        let provider = self
            .provider(token.clone())
            .ok_or_else(|| anyhow::anyhow!("作用域中没有 '{}' 的绑定", token))?;
        provider
            .get()?
            .downcast::<T>()
            .map_err(|_| anyhow::anyhow!("'{}' 的实例不是 {}", token, std::any::type_name::<T>()))
    }

    pub(crate) fn finish(self) -> PluginScope {
        PluginScope::new(self.subsystem, self.bindings, self.listeners)
    }

    /// 结束声明，并用 `wrap` 包装每个绑定的提供者
    pub(crate) fn finish_with<F>(mut self, wrap: F) -> PluginScope
    where
        F: Fn(Arc<dyn Provider>) -> Arc<dyn Provider>,
    {
        for binding in &mut self.bindings {
            binding.provider = wrap(binding.provider.clone());
        }
        self.finish()
    }
}

/// 绑定构建器
///
/// 未指定名称时自动生成唯一限定符，使同一令牌下的多个匿名绑定互不冲突。
pub struct BindingBuilder<'a> {
    binder: &'a mut Binder,
    token: TypeToken,
    qualifier: Option<Qualifier>,
}

impl BindingBuilder<'_> {
    /// 以逻辑名称限定（映射集合的导出名）
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.qualifier = Some(Qualifier::named(name));
        self
    }

    /// 绑定到提供者
    pub fn to_provider(self, provider: Arc<dyn Provider>) {
        let qualifier = self.qualifier.unwrap_or_else(Qualifier::unique);
        self.binder.bindings.push(Binding {
            key: Key::qualified(self.token, qualifier),
            provider,
        });
    }

    /// 绑定到固定实例
    pub fn to_instance<T: Any + Send + Sync>(self, value: T) {
        self.to_provider(provider::instance(value));
    }

    /// 绑定到工厂闭包，每次获取都会调用
    pub fn to_fn<F>(self, f: F)
    where
        F: Fn() -> anyhow::Result<Extension> + Send + Sync + 'static,
    {
        self.to_provider(provider::from_fn(f));
    }

    /// 绑定到单例工厂，首次获取时创建
    pub fn to_singleton<F>(self, f: F)
    where
        F: Fn() -> anyhow::Result<Extension> + Send + Sync + 'static,
    {
        self.to_provider(provider::singleton(provider::from_fn(f)));
    }
}
