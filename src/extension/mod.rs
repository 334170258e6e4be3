//! 扩展注册表
//!
//! 宿主通过三类动态集合向插件开放扩展点：
//!
//! - [`DynamicItem`] - 单一当前持有者
//! - [`DynamicSet`] - 无序多持有者
//! - [`DynamicMap`] - 以（插件名 + 导出名）为键
//!
//! 集合内容以写时复制快照保存，读者不会阻塞写者。
//! 热重载时注册句柄可以原地替换提供者，句柄标识保持不变。

pub mod binder;
pub mod handle;
pub mod item;
pub mod map;
pub mod provider;
pub mod scope;
pub mod set;

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use binder::{
    Binder, Binding, BindingBuilder, LifecycleListener, PluginContext, PluginModule,
};
pub use handle::{CallbackHandle, HandleId, RegistrationHandle, ReloadableHandle};
pub use item::{DynamicItem, ItemHandle};
pub use map::{DynamicMap, MapHandle, MapKey, MapKeyPolicy};
pub use provider::{NamedProvider, Provider};
pub use scope::{
    ApiTier, HostEnvironment, HostEnvironmentBuilder, HostScope, HostScopeBuilder, PluginScope,
    Subsystem, SHELL_COMMAND, WEB_SERVLET,
};
pub use set::{DynamicSet, SetHandle};

/// 扩展实例
///
/// 提供者产出的值，消费者通过 [`NamedProvider::get_as`] 向下转型为具体类型。
pub type Extension = Arc<dyn Any + Send + Sync>;

/// 扩展点类型令牌
///
/// 以名称标识一个扩展点接口，例如 `chips.review.CommitValidator`。
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeToken(Arc<str>);

impl TypeToken {
    /// 创建类型令牌
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// 令牌名称
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for TypeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeToken({})", self.0)
    }
}

impl From<&str> for TypeToken {
    fn from(s: &str) -> Self {
        TypeToken::new(s)
    }
}

impl From<String> for TypeToken {
    fn from(s: String) -> Self {
        TypeToken::new(s)
    }
}

impl From<&TypeToken> for TypeToken {
    fn from(t: &TypeToken) -> Self {
        t.clone()
    }
}

static NEXT_UNIQUE: AtomicU64 = AtomicU64::new(1);

/// 绑定限定符
///
/// `Named` 是插件声明的逻辑名称，热重载时按名称匹配新旧绑定；
/// `Unique` 由运行时自动生成，只用于区分同一令牌下的多个匿名绑定，永不按值匹配。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Qualifier {
    /// 命名限定符
    Named(String),
    /// 自动生成的唯一限定符
    Unique(u64),
}

impl Qualifier {
    /// 创建命名限定符
    pub fn named(name: impl Into<String>) -> Self {
        Qualifier::Named(name.into())
    }

    /// 生成新的唯一限定符
    pub fn unique() -> Self {
        Qualifier::Unique(NEXT_UNIQUE.fetch_add(1, Ordering::Relaxed))
    }

    /// 命名限定符的名称
    pub fn name(&self) -> Option<&str> {
        match self {
            Qualifier::Named(n) => Some(n),
            Qualifier::Unique(_) => None,
        }
    }

    /// 是否为自动生成的唯一限定符
    pub fn is_unique(&self) -> bool {
        matches!(self, Qualifier::Unique(_))
    }
}

impl fmt::Display for Qualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Qualifier::Named(n) => write!(f, "@{}", n),
            Qualifier::Unique(id) => write!(f, "@#{}", id),
        }
    }
}

/// 绑定键：类型令牌 + 可选限定符
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    /// 类型令牌
    pub token: TypeToken,
    /// 限定符
    pub qualifier: Option<Qualifier>,
}

impl Key {
    /// 创建无限定符的键
    pub fn of(token: impl Into<TypeToken>) -> Self {
        Self {
            token: token.into(),
            qualifier: None,
        }
    }

    /// 创建带限定符的键
    pub fn qualified(token: impl Into<TypeToken>, qualifier: Qualifier) -> Self {
        Self {
            token: token.into(),
            qualifier: Some(qualifier),
        }
    }

    /// 命名限定符的名称
    pub fn name(&self) -> Option<&str> {
        self.qualifier.as_ref().and_then(Qualifier::name)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.qualifier {
            Some(ref q) => write!(f, "{}{}", self.token, q),
            None => write!(f, "{}", self.token),
        }
    }
}

/// 动态集合类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    /// 单一持有者
    Item,
    /// 多持有者
    Set,
    /// 键值映射
    Map,
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionKind::Item => write!(f, "item"),
            CollectionKind::Set => write!(f, "set"),
            CollectionKind::Map => write!(f, "map"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_token() {
        let a = TypeToken::new("chips.review.Validator");
        let b: TypeToken = "chips.review.Validator".into();
        assert_eq!(a, b);
        assert_eq!(a.name(), "chips.review.Validator");
        assert_eq!(a.to_string(), "chips.review.Validator");
    }

    #[test]
    fn test_unique_qualifiers_differ() {
        let a = Qualifier::unique();
        let b = Qualifier::unique();
        assert_ne!(a, b);
        assert!(a.is_unique());
        assert_eq!(a.name(), None);
    }

    #[test]
    fn test_key_display() {
        let key = Key::qualified("chips.shell.Command", Qualifier::named("print"));
        assert_eq!(key.to_string(), "chips.shell.Command@print");
        assert_eq!(key.name(), Some("print"));
        assert_eq!(Key::of("x").to_string(), "x");
    }
}
