//! 键值动态集合
//!
//! 默认以（插件名, 导出名）为键，不同插件可以导出同名条目；
//! 全局映射只以导出名为键（如 shell 命令、Web 路径），同名导出会冲突。
//! 任一策略下键在集合内唯一，重复注册返回 `DuplicateKey`，不会静默覆盖。

use super::handle::{HandleId, RegistrationHandle, ReloadableHandle};
use super::provider::{NamedProvider, Provider};
use super::{CollectionKind, Key, Qualifier, TypeToken};
use crate::utils::{PluginError, Result};
use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// 映射键
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapKey {
    /// 贡献插件名称
    pub plugin: String,
    /// 导出名称
    pub export: String,
}

impl fmt::Display for MapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.plugin, self.export)
    }
}

/// 映射键策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapKeyPolicy {
    /// 键为（插件名, 导出名）
    #[default]
    PluginScoped,
    /// 键为导出名
    Global,
}

struct MapSlot {
    id: HandleId,
    entry: ArcSwapOption<NamedProvider>,
}

struct MapInner {
    token: TypeToken,
    policy: MapKeyPolicy,
    slots: ArcSwap<BTreeMap<MapKey, Arc<MapSlot>>>,
    write: Mutex<()>,
}

impl MapInner {
    fn index_key(&self, plugin: &str, export: &str) -> MapKey {
        MapKey {
            plugin: match self.policy {
                MapKeyPolicy::PluginScoped => plugin.to_string(),
                MapKeyPolicy::Global => String::new(),
            },
            export: export.to_string(),
        }
    }

    fn detach(&self, index: &MapKey, slot: &Arc<MapSlot>) {
        let _write = self.write.lock();
        let current = self.slots.load_full();
        if current.get(index).map(|s| Arc::ptr_eq(s, slot)).unwrap_or(false) {
            let mut next = BTreeMap::clone(&current);
            next.remove(index);
            self.slots.store(Arc::new(next));
        }
    }
}

/// 键值动态集合
#[derive(Clone)]
pub struct DynamicMap {
    inner: Arc<MapInner>,
}

impl DynamicMap {
    /// 创建按插件划分键的映射
    pub fn new(token: impl Into<TypeToken>) -> Self {
        Self::with_policy(token, MapKeyPolicy::PluginScoped)
    }

    /// 创建全局键映射
    pub fn global(token: impl Into<TypeToken>) -> Self {
        Self::with_policy(token, MapKeyPolicy::Global)
    }

    /// 按指定策略创建映射
    pub fn with_policy(token: impl Into<TypeToken>, policy: MapKeyPolicy) -> Self {
        Self {
            inner: Arc::new(MapInner {
                token: token.into(),
                policy,
                slots: ArcSwap::from_pointee(BTreeMap::new()),
                write: Mutex::new(()),
            }),
        }
    }

    /// 集合的类型令牌
    pub fn token(&self) -> &TypeToken {
        &self.inner.token
    }

    /// 键策略
    pub fn policy(&self) -> MapKeyPolicy {
        self.inner.policy
    }

    /// 检查键是否可用
    ///
    /// # Errors
    ///
    /// 键已被占用时返回 `DuplicateKey`
    pub fn check_available(&self, plugin: &str, export: &str) -> Result<()> {
        let index = self.inner.index_key(plugin, export);
        match self.inner.slots.load().get(&index) {
            Some(slot) => {
                let holder = slot
                    .entry
                    .load_full()
                    .map(|e| e.plugin_name().to_string())
                    .unwrap_or_default();
                Err(PluginError::DuplicateKey {
                    collection: self.inner.token.to_string(),
                    key: format!("{} (已由插件 '{}' 注册)", export, holder),
                })
            }
            None => Ok(()),
        }
    }

    /// 注册导出条目
    ///
    /// # Errors
    ///
    /// 键已被占用时返回 `DuplicateKey`
    pub fn put(
        &self,
        plugin: &str,
        export: &str,
        provider: Arc<dyn Provider>,
    ) -> Result<Arc<MapHandle>> {
        let _write = self.inner.write.lock();
        self.check_available(plugin, export)?;

        let index = self.inner.index_key(plugin, export);
        let key = Key::qualified(self.inner.token.clone(), Qualifier::named(export));
        let slot = Arc::new(MapSlot {
            id: HandleId::next(),
            entry: ArcSwapOption::from_pointee(NamedProvider::new(plugin, key.clone(), provider)),
        });

        let mut next = BTreeMap::clone(&self.inner.slots.load_full());
        next.insert(index.clone(), slot.clone());
        self.inner.slots.store(Arc::new(next));

        Ok(Arc::new(MapHandle {
            map: Arc::downgrade(&self.inner),
            index,
            slot,
            plugin_name: Arc::from(plugin),
            key: Mutex::new(key),
        }))
    }

    /// 按插件与导出名查询
    ///
    /// 全局映射忽略插件名。
    pub fn get(&self, plugin: &str, export: &str) -> Option<Arc<NamedProvider>> {
        let index = self.inner.index_key(plugin, export);
        self.inner
            .slots
            .load()
            .get(&index)
            .and_then(|s| s.entry.load_full())
    }

    /// 按导出名查询（任意插件的第一个匹配）
    pub fn lookup(&self, export: &str) -> Option<Arc<NamedProvider>> {
        self.entries()
            .into_iter()
            .find(|(k, _)| k.export == export)
            .map(|(_, p)| p)
    }

    /// 所有条目的快照，键中的插件名始终为实际贡献者
    pub fn entries(&self) -> Vec<(MapKey, Arc<NamedProvider>)> {
        self.inner
            .slots
            .load()
            .iter()
            .filter_map(|(k, s)| {
                s.entry.load_full().map(|p| {
                    let key = MapKey {
                        plugin: p.plugin_name().to_string(),
                        export: k.export.clone(),
                    };
                    (key, p)
                })
            })
            .collect()
    }

    /// 某个插件导出的所有条目
    pub fn by_plugin(&self, plugin: &str) -> Vec<(String, Arc<NamedProvider>)> {
        self.entries()
            .into_iter()
            .filter(|(k, _)| k.plugin == plugin)
            .map(|(k, p)| (k.export, p))
            .collect()
    }

    /// 条目数量
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for DynamicMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicMap")
            .field("token", &self.inner.token)
            .field("policy", &self.inner.policy)
            .field("len", &self.len())
            .finish()
    }
}

/// 映射条目句柄
pub struct MapHandle {
    map: Weak<MapInner>,
    index: MapKey,
    slot: Arc<MapSlot>,
    plugin_name: Arc<str>,
    key: Mutex<Key>,
}

impl MapHandle {
    /// 导出名称
    pub fn export_name(&self) -> &str {
        &self.index.export
    }
}

impl RegistrationHandle for MapHandle {
    fn id(&self) -> HandleId {
        self.slot.id
    }

    fn remove(&self) {
        if self.slot.entry.swap(None).is_some() {
            if let Some(map) = self.map.upgrade() {
                map.detach(&self.index, &self.slot);
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

impl ReloadableHandle for MapHandle {
    fn kind(&self) -> CollectionKind {
        CollectionKind::Map
    }

    fn key(&self) -> Key {
        self.key.lock().clone()
    }

    fn current(&self) -> Option<Arc<NamedProvider>> {
        self.slot.entry.load_full()
    }

    fn replace(&self, key: Key, provider: Arc<dyn Provider>) -> bool {
        // 导出名决定条目位置，不能在替换时改变
        if key.name() != Some(self.index.export.as_str()) {
            return false;
        }
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

impl fmt::Debug for MapHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapHandle")
            .field("id", &self.slot.id)
            .field("plugin", &self.plugin_name)
            .field("export", &self.index.export)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::provider::instance;

    const COMMANDS: &str = "chips.shell.Command";

    #[test]
    fn test_put_and_get() {
        let map = DynamicMap::new(COMMANDS);
        map.put("hello", "print", instance("p".to_string())).unwrap();
        map.put("hello", "echo", instance("e".to_string())).unwrap();

        let p = map.get("hello", "print").unwrap();
        assert_eq!(p.get_as::<String>().unwrap().as_str(), "p");
        assert_eq!(p.key().name(), Some("print"));
        assert_eq!(map.len(), 2);
        assert_eq!(map.by_plugin("hello").len(), 2);
        assert!(map.get("other", "print").is_none());
    }

    #[test]
    fn test_plugin_scoped_keys_do_not_collide_across_plugins() {
        let map = DynamicMap::new(COMMANDS);
        map.put("a", "alpha", instance(1u8)).unwrap();
        map.put("b", "alpha", instance(2u8)).unwrap();
        assert_eq!(map.len(), 2);

        let err = map.put("a", "alpha", instance(3u8)).unwrap_err();
        assert!(matches!(err, PluginError::DuplicateKey { .. }));
    }

    #[test]
    fn test_global_duplicate_key() {
        let map = DynamicMap::global(COMMANDS);
        map.put("x", "alpha", instance(1u8)).unwrap();

        let err = map.put("y", "alpha", instance(2u8)).unwrap_err();
        match err {
            PluginError::DuplicateKey { collection, key } => {
                assert_eq!(collection, COMMANDS);
                assert!(key.contains("alpha"));
                assert!(key.contains("'x'"));
            }
            other => panic!("unexpected error: {:?}", other),
        }

        // 原条目未被覆盖
        let holder = map.lookup("alpha").unwrap();
        assert_eq!(holder.plugin_name(), "x");
        assert_eq!(map.entries()[0].0.plugin, "x");
    }

    #[test]
    fn test_remove_frees_key() {
        let map = DynamicMap::global(COMMANDS);
        let h = map.put("x", "alpha", instance(1u8)).unwrap();
        h.remove();
        assert!(map.is_empty());
        assert!(map.put("y", "alpha", instance(2u8)).is_ok());

        // 旧句柄再次撤销不影响新条目
        h.remove();
        assert_eq!(map.lookup("alpha").unwrap().plugin_name(), "y");
    }

    #[test]
    fn test_replace_requires_same_export() {
        let map = DynamicMap::new(COMMANDS);
        let h = map.put("x", "alpha", instance(1u8)).unwrap();
        let id = h.id();

        assert!(!h.replace(Key::qualified(COMMANDS, Qualifier::named("beta")), instance(2u8)));
        assert!(h.replace(Key::qualified(COMMANDS, Qualifier::named("alpha")), instance(3u8)));
        assert_eq!(h.id(), id);
        assert_eq!(*map.get("x", "alpha").unwrap().get_as::<u8>().unwrap(), 3);
    }
}
