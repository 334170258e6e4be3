//! 多持有者动态集合
//!
//! 集合保存槽位列表的写时复制快照，每个槽位内再用原子引用保存当前绑定。
//! 添加与删除替换整个列表；热重载只替换槽位内的条目，槽位与句柄标识都不变。

use super::handle::{HandleId, RegistrationHandle, ReloadableHandle};
use super::provider::{NamedProvider, Provider};
use super::{CollectionKind, Extension, Key, TypeToken};
use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::warn;

struct Slot {
    id: HandleId,
    entry: ArcSwapOption<NamedProvider>,
}

struct SetInner {
    token: TypeToken,
    slots: ArcSwap<Vec<Arc<Slot>>>,
}

impl SetInner {
    fn detach(&self, slot: &Arc<Slot>) {
        self.slots.rcu(|slots| {
            slots
                .iter()
                .filter(|s| !Arc::ptr_eq(s, slot))
                .cloned()
                .collect::<Vec<_>>()
        });
    }
}

/// 多持有者动态集合
#[derive(Clone)]
pub struct DynamicSet {
    inner: Arc<SetInner>,
}

impl DynamicSet {
    /// 创建空集合
    pub fn new(token: impl Into<TypeToken>) -> Self {
        Self {
            inner: Arc::new(SetInner {
                token: token.into(),
                slots: ArcSwap::from_pointee(Vec::new()),
            }),
        }
    }

    /// 集合的类型令牌
    pub fn token(&self) -> &TypeToken {
        &self.inner.token
    }

    /// 添加绑定
    ///
    /// # Arguments
    ///
    /// * `plugin_name` - 贡献插件名称
    /// * `key` - 绑定键
    /// * `provider` - 提供者
    ///
    /// # Returns
    ///
    /// 可撤销、可原地替换的句柄
    pub fn add(
        &self,
        plugin_name: &str,
        key: Key,
        provider: Arc<dyn Provider>,
    ) -> Arc<SetHandle> {
        let slot = Arc::new(Slot {
            id: HandleId::next(),
            entry: ArcSwapOption::from_pointee(NamedProvider::new(
                plugin_name,
                key.clone(),
                provider,
            )),
        });

        self.inner.slots.rcu(|slots| {
            let mut next = Vec::clone(slots);
            next.push(slot.clone());
            next
        });

        Arc::new(SetHandle {
            set: Arc::downgrade(&self.inner),
            slot,
            plugin_name: Arc::from(plugin_name),
            key: Mutex::new(key),
        })
    }

    /// 当前所有绑定的快照
    pub fn snapshot(&self) -> Vec<Arc<NamedProvider>> {
        self.inner
            .slots
            .load()
            .iter()
            .filter_map(|s| s.entry.load_full())
            .collect()
    }

    /// 绑定数量
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 获取所有扩展实例，失败的提供者记录警告后跳过
    pub fn get_all(&self) -> Vec<Extension> {
        self.snapshot()
            .iter()
            .filter_map(|p| match p.get() {
                Ok(ext) => Some(ext),
                Err(e) => {
                    warn!(token = %self.inner.token, plugin = p.plugin_name(), "跳过失败的扩展: {}", e);
                    None
                }
            })
            .collect()
    }

    /// 获取所有扩展实例并向下转型
    pub fn get_all_as<T: Any + Send + Sync>(&self) -> Vec<Arc<T>> {
        self.snapshot()
            .iter()
            .filter_map(|p| match p.get_as::<T>() {
                Ok(ext) => Some(ext),
                Err(e) => {
                    warn!(token = %self.inner.token, plugin = p.plugin_name(), "跳过失败的扩展: {}", e);
                    None
                }
            })
            .collect()
    }

    /// 贡献了绑定的插件
    pub fn plugins(&self) -> BTreeSet<String> {
        self.snapshot()
            .iter()
            .map(|p| p.plugin_name().to_string())
            .collect()
    }
}

impl fmt::Debug for DynamicSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicSet")
            .field("token", &self.inner.token)
            .field("len", &self.len())
            .finish()
    }
}

/// 集合绑定句柄
pub struct SetHandle {
    set: Weak<SetInner>,
    slot: Arc<Slot>,
    plugin_name: Arc<str>,
    key: Mutex<Key>,
}

impl RegistrationHandle for SetHandle {
    fn id(&self) -> HandleId {
        self.slot.id
    }

    fn remove(&self) {
        if self.slot.entry.swap(None).is_some() {
            if let Some(set) = self.set.upgrade() {
                set.detach(&self.slot);
            }
        }
    }

    fn is_active(&self) -> bool {
        self.slot.entry.load().is_some()
    }

    fn as_reloadable(&self) -> Option<&dyn ReloadableHandle> {
        Some(self)
    }
}

impl ReloadableHandle for SetHandle {
    fn kind(&self) -> CollectionKind {
        CollectionKind::Set
    }

    fn key(&self) -> Key {
        self.key.lock().clone()
    }

    fn current(&self) -> Option<Arc<NamedProvider>> {
        self.slot.entry.load_full()
    }

    fn replace(&self, key: Key, provider: Arc<dyn Provider>) -> bool {
        let next = Arc::new(NamedProvider::new(&self.plugin_name, key.clone(), provider));
        let prev = self.slot.entry.rcu(|cur| cur.as_ref().map(|_| next.clone()));
        if prev.is_some() {
            *self.key.lock() = key;
            true
        } else {
            false
        }
    }
}

impl fmt::Debug for SetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetHandle")
            .field("id", &self.slot.id)
            .field("plugin", &self.plugin_name)
            .field("key", &*self.key.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::provider::instance;
    use crate::extension::Qualifier;

    fn names(set: &DynamicSet) -> Vec<String> {
        let mut v: Vec<String> = set
            .get_all_as::<String>()
            .iter()
            .map(|s| s.to_string())
            .collect();
        v.sort();
        v
    }

    #[test]
    fn test_add_and_remove() {
        let set = DynamicSet::new("chips.Listener");
        let a = set.add("p", Key::qualified("chips.Listener", Qualifier::unique()), instance("a".to_string()));
        let b = set.add("q", Key::qualified("chips.Listener", Qualifier::unique()), instance("b".to_string()));
        assert_eq!(names(&set), vec!["a", "b"]);

        a.remove();
        assert!(!a.is_active());
        assert_eq!(names(&set), vec!["b"]);

        // 重复撤销无副作用
        a.remove();
        assert!(b.is_active());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_replace_in_place_keeps_identity() {
        let set = DynamicSet::new("chips.Listener");
        let h = set.add("p", Key::qualified("chips.Listener", Qualifier::named("x")), instance("old".to_string()));
        let id = h.id();

        assert!(h.replace(Key::qualified("chips.Listener", Qualifier::named("x")), instance("new".to_string())));
        assert_eq!(h.id(), id);
        assert_eq!(names(&set), vec!["new"]);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_replace_after_remove_fails() {
        let set = DynamicSet::new("t");
        let h = set.add("p", Key::of("t"), instance(1u8));
        h.remove();
        assert!(!h.replace(Key::of("t"), instance(2u8)));
        assert!(set.is_empty());
    }

    #[test]
    fn test_snapshot_unaffected_by_later_writes() {
        let set = DynamicSet::new("t");
        let h = set.add("p", Key::of("t"), instance(1u8));
        let before = set.snapshot();
        h.remove();
        assert_eq!(before.len(), 1);
        assert!(set.snapshot().is_empty());
    }

    #[test]
    fn test_plugins() {
        let set = DynamicSet::new("t");
        set.add("beta", Key::of("t"), instance(1u8));
        set.add("alpha", Key::of("t"), instance(2u8));
        let plugins: Vec<String> = set.plugins().into_iter().collect();
        assert_eq!(plugins, vec!["alpha", "beta"]);
    }
}
