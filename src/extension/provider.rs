//! 扩展提供者
//!
//! 提供者是惰性工厂：每次调用 `get` 返回扩展实例或失败。
//! 注册表只保存提供者，不在注册时创建实例。

use super::{Extension, Key};
use crate::utils::{PluginError, Result};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// 扩展提供者
pub trait Provider: Send + Sync {
    /// 获取扩展实例
    fn get(&self) -> anyhow::Result<Extension>;
}

impl<F> Provider for F
where
    F: Fn() -> anyhow::Result<Extension> + Send + Sync,
{
    fn get(&self) -> anyhow::Result<Extension> {
        self()
    }
}

/// 固定实例提供者
struct InstanceProvider(Extension);

impl Provider for InstanceProvider {
    fn get(&self) -> anyhow::Result<Extension> {
        Ok(self.0.clone())
    }
}

/// 单例提供者，首次成功调用后缓存结果
struct SingletonProvider {
    inner: Arc<dyn Provider>,
    cell: OnceLock<Extension>,
}

impl Provider for SingletonProvider {
    fn get(&self) -> anyhow::Result<Extension> {
        if let Some(value) = self.cell.get() {
            return Ok(value.clone());
        }
        let value = self.inner.get()?;
        Ok(self.cell.get_or_init(|| value).clone())
    }
}

/// 用固定实例创建提供者
pub fn instance<T: Any + Send + Sync>(value: T) -> Arc<dyn Provider> {
    Arc::new(InstanceProvider(Arc::new(value)))
}

/// 用已包装的扩展实例创建提供者
pub fn extension(value: Extension) -> Arc<dyn Provider> {
    Arc::new(InstanceProvider(value))
}

/// 用闭包创建提供者，每次调用都会执行闭包
pub fn from_fn<F>(f: F) -> Arc<dyn Provider>
where
    F: Fn() -> anyhow::Result<Extension> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// 将提供者包装为单例
pub fn singleton(inner: Arc<dyn Provider>) -> Arc<dyn Provider> {
    Arc::new(SingletonProvider {
        inner,
        cell: OnceLock::new(),
    })
}

/// 集合中保存的绑定条目：贡献插件 + 键 + 提供者
#[derive(Clone)]
pub struct NamedProvider {
    plugin_name: Arc<str>,
    key: Key,
    provider: Arc<dyn Provider>,
}

impl NamedProvider {
    /// 创建绑定条目
    pub fn new(plugin_name: impl AsRef<str>, key: Key, provider: Arc<dyn Provider>) -> Self {
        Self {
            plugin_name: Arc::from(plugin_name.as_ref()),
            key,
            provider,
        }
    }

    /// 贡献该绑定的插件名称
    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// 绑定键
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// 底层提供者
    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// 是否与另一个条目共享同一个提供者
    pub fn same_provider(&self, other: &NamedProvider) -> bool {
        Arc::ptr_eq(&self.provider, &other.provider)
    }

    /// 调用提供者获取扩展实例
    ///
    /// # Errors
    ///
    /// 提供者失败时返回 `ProviderFailed`
    pub fn get(&self) -> Result<Extension> {
        self.provider.get().map_err(|e| PluginError::ProviderFailed {
            token: self.key.to_string(),
            reason: format!("{} (插件 '{}')", e, self.plugin_name),
        })
    }

    /// 获取扩展实例并向下转型
    ///
    /// # Errors
    ///
    /// 提供者失败或实例类型不符时返回 `ProviderFailed`
    pub fn get_as<T: Any + Send + Sync>(&self) -> Result<Arc<T>> {
        self.get()?
            .downcast::<T>()
            .map_err(|_| PluginError::ProviderFailed {
                token: self.key.to_string(),
                reason: format!(
                    "插件 '{}' 提供的实例不是 {}",
                    self.plugin_name,
                    std::any::type_name::<T>()
                ),
            })
    }
}

impl fmt::Debug for NamedProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedProvider")
            .field("plugin", &self.plugin_name)
            .field("key", &self.key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_instance_provider() {
        let p = NamedProvider::new("demo", Key::of("greeting"), instance("hello".to_string()));
        let value = p.get_as::<String>().unwrap();
        assert_eq!(value.as_str(), "hello");
        assert_eq!(p.plugin_name(), "demo");
    }

    #[test]
    fn test_downcast_mismatch() {
        let p = NamedProvider::new("demo", Key::of("n"), instance(42u32));
        let err = p.get_as::<String>().unwrap_err();
        assert!(matches!(err, PluginError::ProviderFailed { .. }));
    }

    #[test]
    fn test_fn_provider_failure() {
        let p = NamedProvider::new(
            "demo",
            Key::of("broken"),
            from_fn(|| Err(anyhow::anyhow!("boom"))),
        );
        let err = p.get().unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_singleton_caches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let p = singleton(from_fn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(7u8) as Extension)
        }));

        p.get().unwrap();
        p.get().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
