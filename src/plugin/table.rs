//! 插件表
//!
//! 运行中、已禁用、加载失败三张表。只由 [`PluginManager`](super::PluginManager) 修改，
//! 查询方通过读锁获取快照。

use super::generation::LoadedPlugin;
use super::metadata::{PluginInfo, PluginState};
use super::package::Fingerprint;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// 已禁用的插件
#[derive(Debug, Clone)]
pub struct DisabledEntry {
    /// 插件名称
    pub name: String,
    /// 插件包路径（带禁用标记）
    pub path: PathBuf,
    /// 插件版本（可读取描述时）
    pub version: Option<String>,
}

/// 加载失败的插件包
#[derive(Debug, Clone)]
pub struct BrokenEntry {
    /// 插件名称
    pub name: String,
    /// 失败时的内容指纹
    pub fingerprint: Fingerprint,
    /// 错误信息
    pub error: String,
    /// 失败时间
    pub since: DateTime<Utc>,
}

/// 插件表
#[derive(Debug, Default)]
pub struct PluginTable {
    running: RwLock<BTreeMap<String, Arc<LoadedPlugin>>>,
    disabled: RwLock<BTreeMap<String, DisabledEntry>>,
    broken: RwLock<HashMap<PathBuf, BrokenEntry>>,
}

impl PluginTable {
    /// 创建空表
    pub fn new() -> Self {
        Self::default()
    }

    // ==================== 运行中 ====================

    /// 运行中的插件
    pub async fn running(&self, name: &str) -> Option<Arc<LoadedPlugin>> {
        self.running.read().await.get(name).cloned()
    }

    /// 所有运行中的插件
    pub async fn running_all(&self) -> Vec<Arc<LoadedPlugin>> {
        self.running.read().await.values().cloned().collect()
    }

    /// 运行中的插件名称
    pub async fn running_names(&self) -> Vec<String> {
        self.running.read().await.keys().cloned().collect()
    }

    /// 登记运行中的插件，返回被替换的上一代
    pub async fn put_running(&self, gen: Arc<LoadedPlugin>) -> Option<Arc<LoadedPlugin>> {
        self.running
            .write()
            .await
            .insert(gen.name().to_string(), gen)
    }

    /// 移除运行中的插件
    pub async fn remove_running(&self, name: &str) -> Option<Arc<LoadedPlugin>> {
        self.running.write().await.remove(name)
    }

    // ==================== 已禁用 ====================

    /// 登记已禁用的插件
    pub async fn put_disabled(&self, entry: DisabledEntry) {
        self.disabled.write().await.insert(entry.name.clone(), entry);
    }

    /// 移除已禁用的插件
    pub async fn remove_disabled(&self, name: &str) -> Option<DisabledEntry> {
        self.disabled.write().await.remove(name)
    }

    /// 已禁用的插件
    pub async fn disabled(&self, name: &str) -> Option<DisabledEntry> {
        self.disabled.read().await.get(name).cloned()
    }

    /// 用本次扫描结果替换禁用表
    pub async fn replace_disabled(&self, entries: impl IntoIterator<Item = DisabledEntry>) {
        let mut disabled = self.disabled.write().await;
        disabled.clear();
        disabled.extend(entries.into_iter().map(|e| (e.name.clone(), e)));
    }

    // ==================== 加载失败 ====================

    /// 记录加载失败的插件包
    pub async fn mark_broken(&self, path: &Path, name: &str, fingerprint: Fingerprint, error: String) {
        self.broken.write().await.insert(
            path.to_path_buf(),
            BrokenEntry {
                name: name.to_string(),
                fingerprint,
                error,
                since: Utc::now(),
            },
        );
    }

    /// 该包是否以相同内容失败过
    pub async fn is_broken(&self, path: &Path, fingerprint: Fingerprint) -> bool {
        self.broken
            .read()
            .await
            .get(path)
            .map(|b| b.fingerprint == fingerprint)
            .unwrap_or(false)
    }

    /// 清除失败记录
    pub async fn clear_broken(&self, path: &Path) -> Option<BrokenEntry> {
        self.broken.write().await.remove(path)
    }

    /// 只保留仍存在的插件包的失败记录
    pub async fn retain_broken(&self, paths: &[PathBuf]) {
        self.broken.write().await.retain(|p, _| paths.contains(p));
    }

    /// 所有失败记录
    pub async fn broken_entries(&self) -> Vec<(PathBuf, BrokenEntry)> {
        let mut entries: Vec<_> = self
            .broken
            .read()
            .await
            .iter()
            .map(|(p, b)| (p.clone(), b.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    // ==================== 查询 ====================

    /// 全部插件信息，按名称排序
    pub async fn list(&self) -> Vec<PluginInfo> {
        let mut infos: BTreeMap<String, PluginInfo> = BTreeMap::new();

        for (path, entry) in self.broken_entries().await {
            infos.insert(
                entry.name.clone(),
                PluginInfo {
                    name: entry.name,
                    state: PluginState::Failed,
                    enabled: true,
                    source: path,
                    last_error: Some(entry.error),
                    ..Default::default()
                },
            );
        }

        for entry in self.disabled.read().await.values() {
            infos.insert(
                entry.name.clone(),
                PluginInfo {
                    name: entry.name.clone(),
                    version: entry.version.clone().unwrap_or_default(),
                    state: PluginState::Disabled,
                    enabled: false,
                    source: entry.path.clone(),
                    ..Default::default()
                },
            );
        }

        for gen in self.running.read().await.values() {
            infos.insert(gen.name().to_string(), gen.info());
        }

        infos.into_values().collect()
    }

    /// 单个插件信息
    pub async fn info(&self, name: &str) -> Option<PluginInfo> {
        self.list().await.into_iter().find(|i| i.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broken_tracks_fingerprint() {
        let table = PluginTable::new();
        let path = PathBuf::from("/plugins/bad.zip");
        let fp = Fingerprint {
            len: 10,
            ..Default::default()
        };
        table.mark_broken(&path, "bad", fp, "描述无效".to_string()).await;

        assert!(table.is_broken(&path, fp).await);
        let changed = Fingerprint {
            len: 11,
            ..Default::default()
        };
        assert!(!table.is_broken(&path, changed).await);

        let info = table.info("bad").await.unwrap();
        assert_eq!(info.state, PluginState::Failed);
        assert_eq!(info.last_error.as_deref(), Some("描述无效"));

        table.retain_broken(&[]).await;
        assert!(table.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_entries() {
        let table = PluginTable::new();
        table
            .put_disabled(DisabledEntry {
                name: "quiet".to_string(),
                path: PathBuf::from("/plugins/quiet.zip.disabled"),
                version: Some("1.2.0".to_string()),
            })
            .await;

        let list = table.list().await;
        assert_eq!(list.len(), 1);
        assert!(!list[0].enabled);
        assert_eq!(list[0].version, "1.2.0");

        table.replace_disabled(Vec::new()).await;
        assert!(table.disabled("quiet").await.is_none());
    }
}
