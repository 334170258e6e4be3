//! 宿主作用域
//!
//! 宿主按子系统（system / shell / web）组织扩展点集合与宿主服务。
//! 插件作用域是对应宿主作用域的子作用域，按信任层级看到不同的服务面。

use super::binder::{Binding, LifecycleListener};
use super::provider::Provider;
use super::{CollectionKind, DynamicItem, DynamicMap, DynamicSet, TypeToken};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// shell 命令扩展点（全局映射，键为命令名）
pub const SHELL_COMMAND: &str = "chips.shell.Command";

/// Web 处理器扩展点（全局映射，键为路径）
pub const WEB_SERVLET: &str = "chips.web.Servlet";

/// 宿主子系统
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subsystem {
    /// 核心系统
    System,
    /// 命令行 shell
    Shell,
    /// Web
    Web,
}

impl Subsystem {
    /// 全部子系统，按启动顺序排列
    pub const ALL: [Subsystem; 3] = [Subsystem::System, Subsystem::Shell, Subsystem::Web];

    /// 数组下标
    pub fn index(self) -> usize {
        match self {
            Subsystem::System => 0,
            Subsystem::Shell => 1,
            Subsystem::Web => 2,
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subsystem::System => write!(f, "system"),
            Subsystem::Shell => write!(f, "shell"),
            Subsystem::Web => write!(f, "web"),
        }
    }
}

/// 插件 API 信任层级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiTier {
    /// 扩展层：只能看到宿主公开的服务
    Extension,
    /// 原生插件层：可以看到宿主全部内部服务
    #[default]
    Plugin,
}

impl fmt::Display for ApiTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiTier::Extension => write!(f, "extension"),
            ApiTier::Plugin => write!(f, "plugin"),
        }
    }
}

struct HostService {
    provider: Arc<dyn Provider>,
    exported: bool,
}

/// 宿主作用域：一个子系统的扩展点集合与服务
pub struct HostScope {
    subsystem: Subsystem,
    items: HashMap<TypeToken, DynamicItem>,
    sets: HashMap<TypeToken, DynamicSet>,
    maps: HashMap<TypeToken, DynamicMap>,
    services: HashMap<TypeToken, HostService>,
}

impl HostScope {
    /// 创建作用域构建器
    pub fn builder(subsystem: Subsystem) -> HostScopeBuilder {
        HostScopeBuilder {
            scope: HostScope {
                subsystem,
                items: HashMap::new(),
                sets: HashMap::new(),
                maps: HashMap::new(),
                services: HashMap::new(),
            },
        }
    }

    /// 所属子系统
    pub fn subsystem(&self) -> Subsystem {
        self.subsystem
    }

    /// 单项集合
    pub fn item(&self, token: &TypeToken) -> Option<&DynamicItem> {
        self.items.get(token)
    }

    /// 多项集合
    pub fn set(&self, token: &TypeToken) -> Option<&DynamicSet> {
        self.sets.get(token)
    }

    /// 映射集合
    pub fn map(&self, token: &TypeToken) -> Option<&DynamicMap> {
        self.maps.get(token)
    }

    /// 所有单项集合
    pub fn items(&self) -> impl Iterator<Item = &DynamicItem> {
        self.items.values()
    }

    /// 所有多项集合
    pub fn sets(&self) -> impl Iterator<Item = &DynamicSet> {
        self.sets.values()
    }

    /// 所有映射集合
    pub fn maps(&self) -> impl Iterator<Item = &DynamicMap> {
        self.maps.values()
    }

    /// 令牌对应的集合类型
    pub fn kind_of(&self, token: &TypeToken) -> Option<CollectionKind> {
        if self.maps.contains_key(token) {
            Some(CollectionKind::Map)
        } else if self.sets.contains_key(token) {
            Some(CollectionKind::Set)
        } else if self.items.contains_key(token) {
            Some(CollectionKind::Item)
        } else {
            None
        }
    }

    /// 按信任层级查找宿主服务
    pub fn service(&self, token: &TypeToken, tier: ApiTier) -> Option<Arc<dyn Provider>> {
        self.services
            .get(token)
            .filter(|s| s.exported || tier == ApiTier::Plugin)
            .map(|s| s.provider.clone())
    }
}

impl fmt::Debug for HostScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostScope")
            .field("subsystem", &self.subsystem)
            .field("items", &self.items.len())
            .field("sets", &self.sets.len())
            .field("maps", &self.maps.len())
            .field("services", &self.services.len())
            .finish()
    }
}

/// 宿主作用域构建器
pub struct HostScopeBuilder {
    scope: HostScope,
}

impl HostScopeBuilder {
    /// 声明单项扩展点
    pub fn item(mut self, token: impl Into<TypeToken>) -> Self {
        let token = token.into();
        self.scope.items.insert(token.clone(), DynamicItem::new(token));
        self
    }

    /// 声明最终单项扩展点
    pub fn final_item(mut self, token: impl Into<TypeToken>) -> Self {
        let token = token.into();
        self.scope
            .items
            .insert(token.clone(), DynamicItem::final_item(token));
        self
    }

    /// 声明带默认值的单项扩展点
    pub fn item_with_default(mut self, token: impl Into<TypeToken>, provider: Arc<dyn Provider>) -> Self {
        let token = token.into();
        self.scope
            .items
            .insert(token.clone(), DynamicItem::with_default(token, provider));
        self
    }

    /// 声明多项扩展点
    pub fn set(mut self, token: impl Into<TypeToken>) -> Self {
        let token = token.into();
        self.scope.sets.insert(token.clone(), DynamicSet::new(token));
        self
    }

    /// 声明按插件划分键的映射扩展点
    pub fn map(mut self, token: impl Into<TypeToken>) -> Self {
        let token = token.into();
        self.scope.maps.insert(token.clone(), DynamicMap::new(token));
        self
    }

    /// 声明全局键映射扩展点
    pub fn global_map(mut self, token: impl Into<TypeToken>) -> Self {
        let token = token.into();
        self.scope.maps.insert(token.clone(), DynamicMap::global(token));
        self
    }

    /// 注册对扩展层公开的宿主服务
    pub fn service(mut self, token: impl Into<TypeToken>, provider: Arc<dyn Provider>) -> Self {
        self.scope.services.insert(
            token.into(),
            HostService {
                provider,
                exported: true,
            },
        );
        self
    }

    /// 注册仅原生插件层可见的内部服务
    pub fn internal_service(mut self, token: impl Into<TypeToken>, provider: Arc<dyn Provider>) -> Self {
        self.scope.services.insert(
            token.into(),
            HostService {
                provider,
                exported: false,
            },
        );
        self
    }

    /// 构建作用域
    pub fn build(self) -> HostScope {
        self.scope
    }
}

/// 宿主环境：各子系统作用域与扩展点接口层级
pub struct HostEnvironment {
    scopes: [Option<Arc<HostScope>>; 3],
    interfaces: HashMap<TypeToken, Vec<TypeToken>>,
}

impl HostEnvironment {
    /// 创建环境构建器
    pub fn builder() -> HostEnvironmentBuilder {
        HostEnvironmentBuilder::default()
    }

    /// 只有空 system 作用域的环境
    pub fn empty() -> Self {
        Self::builder().build()
    }

    /// 子系统作用域
    pub fn scope(&self, subsystem: Subsystem) -> Option<&Arc<HostScope>> {
        self.scopes[subsystem.index()].as_ref()
    }

    /// 宿主是否提供该子系统
    pub fn has_subsystem(&self, subsystem: Subsystem) -> bool {
        self.scope(subsystem).is_some()
    }

    /// 查找扩展点所在的子系统与集合类型
    pub fn extension_point(&self, token: &TypeToken) -> Option<(Subsystem, CollectionKind)> {
        Subsystem::ALL.iter().find_map(|s| {
            self.scope(*s)
                .and_then(|scope| scope.kind_of(token))
                .map(|kind| (*s, kind))
        })
    }

    /// 宿主接口的直接父接口
    pub fn interface_parents(&self, token: &TypeToken) -> &[TypeToken] {
        self.interfaces.get(token).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 在所有子系统中查找单项集合
    pub fn item(&self, token: impl Into<TypeToken>) -> Option<DynamicItem> {
        let token = token.into();
        self.find(|scope| scope.item(&token).cloned())
    }

    /// 在所有子系统中查找多项集合
    pub fn set(&self, token: impl Into<TypeToken>) -> Option<DynamicSet> {
        let token = token.into();
        self.find(|scope| scope.set(&token).cloned())
    }

    /// 在所有子系统中查找映射集合
    pub fn map(&self, token: impl Into<TypeToken>) -> Option<DynamicMap> {
        let token = token.into();
        self.find(|scope| scope.map(&token).cloned())
    }

    fn find<T>(&self, f: impl Fn(&HostScope) -> Option<T>) -> Option<T> {
        self.scopes.iter().flatten().find_map(|scope| f(scope))
    }
}

impl fmt::Debug for HostEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostEnvironment")
            .field("scopes", &self.scopes)
            .field("interfaces", &self.interfaces.len())
            .finish()
    }
}

/// 宿主环境构建器
#[derive(Default)]
pub struct HostEnvironmentBuilder {
    system: Option<HostScope>,
    shell: Option<HostScope>,
    web: Option<HostScope>,
    interfaces: HashMap<TypeToken, Vec<TypeToken>>,
}

impl HostEnvironmentBuilder {
    /// 设置 system 作用域
    pub fn system(mut self, scope: HostScopeBuilder) -> Self {
        self.system = Some(scope.build());
        self
    }

    /// 启用 shell 子系统，自动声明全局命令映射
    pub fn shell(mut self, scope: HostScopeBuilder) -> Self {
        let mut scope = scope.build();
        let token = TypeToken::new(SHELL_COMMAND);
        scope
            .maps
            .entry(token.clone())
            .or_insert_with(|| DynamicMap::global(token));
        self.shell = Some(scope);
        self
    }

    /// 启用 web 子系统，自动声明全局处理器映射
    pub fn web(mut self, scope: HostScopeBuilder) -> Self {
        let mut scope = scope.build();
        let token = TypeToken::new(WEB_SERVLET);
        scope
            .maps
            .entry(token.clone())
            .or_insert_with(|| DynamicMap::global(token));
        self.web = Some(scope);
        self
    }

    /// 声明宿主接口及其父接口
    pub fn interface<I, P>(mut self, token: impl Into<TypeToken>, parents: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<TypeToken>,
    {
        self.interfaces
            .insert(token.into(), parents.into_iter().map(Into::into).collect());
        self
    }

    /// 构建环境
    pub fn build(self) -> HostEnvironment {
        let system = self
            .system
            .unwrap_or_else(|| HostScope::builder(Subsystem::System).build());
        HostEnvironment {
            scopes: [
                Some(Arc::new(system)),
                self.shell.map(Arc::new),
                self.web.map(Arc::new),
            ],
            interfaces: self.interfaces,
        }
    }
}

/// 插件作用域：一个子系统模块配置后的绑定与生命周期监听器
pub struct PluginScope {
    subsystem: Subsystem,
    bindings: Vec<Binding>,
    listeners: Vec<Arc<dyn LifecycleListener>>,
}

impl PluginScope {
    pub(crate) fn new(
        subsystem: Subsystem,
        bindings: Vec<Binding>,
        listeners: Vec<Arc<dyn LifecycleListener>>,
    ) -> Self {
        Self {
            subsystem,
            bindings,
            listeners,
        }
    }

    /// 所属子系统
    pub fn subsystem(&self) -> Subsystem {
        self.subsystem
    }

    /// 全部绑定
    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// 指定令牌的绑定
    pub fn bindings_of<'a>(&'a self, token: &'a TypeToken) -> impl Iterator<Item = &'a Binding> + 'a {
        self.bindings.iter().filter(move |b| &b.key.token == token)
    }

    /// 生命周期监听器
    pub fn listeners(&self) -> &[Arc<dyn LifecycleListener>] {
        &self.listeners
    }

    /// 按令牌查找本作用域提供者（优先无限定符或命名绑定）
    pub fn provider(&self, token: &TypeToken) -> Option<Arc<dyn Provider>> {
        self.bindings_of(token)
            .min_by_key(|b| match b.key.qualifier {
                None => 0,
                Some(ref q) if !q.is_unique() => 1,
                Some(_) => 2,
            })
            .map(|b| b.provider.clone())
    }
}

impl fmt::Debug for PluginScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginScope")
            .field("subsystem", &self.subsystem)
            .field("bindings", &self.bindings.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::provider::instance;

    fn env() -> HostEnvironment {
        HostEnvironment::builder()
            .system(
                HostScope::builder(Subsystem::System)
                    .set("chips.Listener")
                    .item("chips.Avatar")
                    .map("chips.Download")
                    .service("chips.Accounts", instance("accounts".to_string()))
                    .internal_service("chips.Database", instance("db".to_string())),
            )
            .shell(HostScope::builder(Subsystem::Shell))
            .interface("chips.ChangeListener", ["chips.Listener"])
            .build()
    }

    #[test]
    fn test_extension_point_lookup() {
        let env = env();
        assert_eq!(
            env.extension_point(&"chips.Listener".into()),
            Some((Subsystem::System, CollectionKind::Set))
        );
        assert_eq!(
            env.extension_point(&SHELL_COMMAND.into()),
            Some((Subsystem::Shell, CollectionKind::Map))
        );
        assert_eq!(env.extension_point(&"chips.Unknown".into()), None);
        assert!(!env.has_subsystem(Subsystem::Web));
        assert!(env.set("chips.Listener").is_some());
        assert!(env.map(SHELL_COMMAND).is_some());
    }

    #[test]
    fn test_interface_parents() {
        let env = env();
        let parents = env.interface_parents(&"chips.ChangeListener".into());
        assert_eq!(parents, &[TypeToken::new("chips.Listener")]);
        assert!(env.interface_parents(&"x".into()).is_empty());
    }

    #[test]
    fn test_service_visibility_by_tier() {
        let env = env();
        let system = env.scope(Subsystem::System).unwrap();

        assert!(system.service(&"chips.Accounts".into(), ApiTier::Extension).is_some());
        assert!(system.service(&"chips.Database".into(), ApiTier::Extension).is_none());
        assert!(system.service(&"chips.Database".into(), ApiTier::Plugin).is_some());
    }
}
