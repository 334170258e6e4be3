//! 单一持有者动态集合
//!
//! 同一时刻只有一个当前绑定。读者无锁读取快照；写者之间用一把短锁串行化，
//! 以便检查"最终项"约束后再写入。

use super::handle::{HandleId, RegistrationHandle, ReloadableHandle};
use super::provider::{NamedProvider, Provider};
use super::{CollectionKind, Key, TypeToken};
use crate::utils::{PluginError, Result};
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

struct ItemEntry {
    // None 表示宿主默认值
    owner: Option<HandleId>,
    provider: Arc<NamedProvider>,
}

struct ItemInner {
    token: TypeToken,
    is_final: bool,
    default: Option<Arc<NamedProvider>>,
    current: ArcSwapOption<ItemEntry>,
    write: Mutex<()>,
}

impl ItemInner {
    fn default_entry(&self) -> Option<Arc<ItemEntry>> {
        self.default.as_ref().map(|p| {
            Arc::new(ItemEntry {
                owner: None,
                provider: p.clone(),
            })
        })
    }

    fn owned_by(&self, id: HandleId) -> bool {
        self.current
            .load_full()
            .map(|e| e.owner == Some(id))
            .unwrap_or(false)
    }
}

/// 单一持有者动态集合
#[derive(Clone)]
pub struct DynamicItem {
    inner: Arc<ItemInner>,
}

impl DynamicItem {
    /// 创建空集合
    pub fn new(token: impl Into<TypeToken>) -> Self {
        Self::build(token.into(), false, None)
    }

    /// 创建最终项：一旦由某个插件提供，其他插件不能再替换
    pub fn final_item(token: impl Into<TypeToken>) -> Self {
        Self::build(token.into(), true, None)
    }

    /// 创建带宿主默认值的集合，插件撤销绑定后恢复默认值
    pub fn with_default(token: impl Into<TypeToken>, provider: Arc<dyn Provider>) -> Self {
        let token = token.into();
        let default = Arc::new(NamedProvider::new("", Key::of(token.clone()), provider));
        Self::build(token, false, Some(default))
    }

    fn build(token: TypeToken, is_final: bool, default: Option<Arc<NamedProvider>>) -> Self {
        let inner = ItemInner {
            token,
            is_final,
            default,
            current: ArcSwapOption::empty(),
            write: Mutex::new(()),
        };
        inner.current.store(inner.default_entry());
        Self {
            inner: Arc::new(inner),
        }
    }

    /// 集合的类型令牌
    pub fn token(&self) -> &TypeToken {
        &self.inner.token
    }

    /// 是否为最终项
    pub fn is_final(&self) -> bool {
        self.inner.is_final
    }

    /// 设置当前绑定
    ///
    /// # Errors
    ///
    /// 最终项已由其他插件提供时返回 `DuplicateBinding`
    pub fn set(
        &self,
        plugin_name: &str,
        key: Key,
        provider: Arc<dyn Provider>,
    ) -> Result<Arc<ItemHandle>> {
        let _write = self.inner.write.lock();

        if self.inner.is_final {
            if let Some(cur) = self.inner.current.load_full() {
                if cur.owner.is_some() && cur.provider.plugin_name() != plugin_name {
                    return Err(PluginError::DuplicateBinding {
                        collection: self.inner.token.to_string(),
                        holder: cur.provider.plugin_name().to_string(),
                    });
                }
            }
        }

        let id = HandleId::next();
        self.inner.current.store(Some(Arc::new(ItemEntry {
            owner: Some(id),
            provider: Arc::new(NamedProvider::new(plugin_name, key.clone(), provider)),
        })));

        Ok(Arc::new(ItemHandle {
            item: Arc::downgrade(&self.inner),
            id,
            plugin_name: Arc::from(plugin_name),
            key: Mutex::new(key),
            removed: AtomicBool::new(false),
        }))
    }

    /// 当前绑定
    pub fn get(&self) -> Option<Arc<NamedProvider>> {
        self.inner.current.load_full().map(|e| e.provider.clone())
    }

    /// 获取当前扩展实例并向下转型，未绑定时返回 `Ok(None)`
    pub fn get_as<T: Any + Send + Sync>(&self) -> Result<Option<Arc<T>>> {
        match self.get() {
            Some(p) => p.get_as::<T>().map(Some),
            None => Ok(None),
        }
    }

    /// 当前持有者插件名（宿主默认值返回 None）
    pub fn holder(&self) -> Option<String> {
        self.inner
            .current
            .load_full()
            .filter(|e| e.owner.is_some())
            .map(|e| e.provider.plugin_name().to_string())
    }
}

impl fmt::Debug for DynamicItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicItem")
            .field("token", &self.inner.token)
            .field("final", &self.inner.is_final)
            .field("holder", &self.holder())
            .finish()
    }
}

/// 单项绑定句柄
pub struct ItemHandle {
    item: Weak<ItemInner>,
    id: HandleId,
    plugin_name: Arc<str>,
    key: Mutex<Key>,
    removed: AtomicBool,
}

impl RegistrationHandle for ItemHandle {
    fn id(&self) -> HandleId {
        self.id
    }

    fn remove(&self) {
        if self.removed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(item) = self.item.upgrade() {
            let _write = item.write.lock();
            if item.owned_by(self.id) {
                item.current.store(item.default_entry());
            }
        }
    }

    fn is_active(&self) -> bool {
        !self.removed.load(Ordering::Acquire)
            && self
                .item
                .upgrade()
                .map(|item| item.owned_by(self.id))
                .unwrap_or(false)
    }

    fn as_reloadable(&self) -> Option<&dyn ReloadableHandle> {
        Some(self)
    }
}

impl ReloadableHandle for ItemHandle {
    fn kind(&self) -> CollectionKind {
        CollectionKind::Item
    }

    fn key(&self) -> Key {
        self.key.lock().clone()
    }

    fn current(&self) -> Option<Arc<NamedProvider>> {
        let item = self.item.upgrade()?;
        item.current
            .load_full()
            .filter(|e| e.owner == Some(self.id))
            .map(|e| e.provider.clone())
    }

    fn replace(&self, key: Key, provider: Arc<dyn Provider>) -> bool {
        if self.removed.load(Ordering::Acquire) {
            return false;
        }
        let Some(item) = self.item.upgrade() else {
            return false;
        };

        let _write = item.write.lock();
        if !item.owned_by(self.id) {
            return false;
        }
        item.current.store(Some(Arc::new(ItemEntry {
            owner: Some(self.id),
            provider: Arc::new(NamedProvider::new(&self.plugin_name, key.clone(), provider)),
        })));
        *self.key.lock() = key;
        true
    }
}

impl fmt::Debug for ItemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemHandle")
            .field("id", &self.id)
            .field("plugin", &self.plugin_name)
            .field("key", &*self.key.lock())
            .finish()
    }
}
