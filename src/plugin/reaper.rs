//! 回收器
//!
//! 旧一代插件停止后，其临时产物（解码副本、提取的原生库）要等命名空间不再被引用才能删除。
//! 每一代一个后台任务：观察命名空间的弱引用，命名空间释放时被唤醒，
//! 否则按指数退避重试；释放后删除产物，删除失败的产物留到进程退出时处理。

use super::generation::GenerationId;
use super::package::{list_entries, remove_artifact, TMP_PREFIX};
use super::runtime::PluginNamespace;
use crate::core::CleanupConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 等待中的回收任务
#[derive(Debug, Clone)]
struct PendingCleanup {
    plugin: String,
    artifacts: Vec<PathBuf>,
}

/// 回收器
pub struct CleanupReaper {
    /// 回收配置
    config: CleanupConfig,
    /// 是否接受新任务
    running: Arc<AtomicBool>,
    /// 等待中的任务（代标识 -> 任务）
    pending: Arc<Mutex<HashMap<GenerationId, PendingCleanup>>>,
    /// 任务句柄
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    /// 进程退出时再删除的产物
    delete_on_exit: Arc<Mutex<Vec<PathBuf>>>,
}

impl CleanupReaper {
    /// 创建回收器
    pub fn new(config: CleanupConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(true)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            workers: Arc::new(Mutex::new(Vec::new())),
            delete_on_exit: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// 等待中的回收任务数量
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// 进程退出时待删除的产物
    pub fn delete_on_exit(&self) -> Vec<PathBuf> {
        self.delete_on_exit.lock().clone()
    }

    /// 安排回收一代插件
    ///
    /// 必须在 tokio 运行时内调用。
    ///
    /// # Arguments
    ///
    /// * `plugin` - 插件名称
    /// * `generation` - 代标识
    /// * `namespace` - 命名空间弱引用
    /// * `artifacts` - 待删除的临时产物
    pub fn schedule(
        &self,
        plugin: &str,
        generation: GenerationId,
        namespace: Weak<PluginNamespace>,
        artifacts: Vec<PathBuf>,
    ) {
        if !self.running.load(Ordering::SeqCst) {
            // 已关闭：能删就删，剩下的留到退出时
            let leftover: Vec<PathBuf> = artifacts
                .into_iter()
                .filter(|a| namespace.strong_count() > 0 || !remove_artifact(a))
                .collect();
            self.delete_on_exit.lock().extend(leftover);
            return;
        }

        self.pending.lock().insert(
            generation,
            PendingCleanup {
                plugin: plugin.to_string(),
                artifacts: artifacts.clone(),
            },
        );

        let config = self.config.clone();
        let pending = Arc::clone(&self.pending);
        let delete_on_exit = Arc::clone(&self.delete_on_exit);
        let plugin = plugin.to_string();

        let worker = tokio::spawn(async move {
            let released = namespace.upgrade().map(|ns| ns.released());
            let mut delay = Duration::from_millis(config.initial_delay_ms);
            let max_delay = Duration::from_millis(config.max_delay_ms.max(config.initial_delay_ms));
            let mut attempts: u32 = 0;

            while namespace.strong_count() > 0 {
                attempts += 1;
                if attempts % config.warn_every.max(1) == 0 {
                    warn!(
                        plugin = %plugin,
                        generation = %generation,
                        attempts,
                        references = namespace.strong_count(),
                        "插件代仍被引用，暂时无法回收"
                    );
                }
                match released {
                    Some(ref notify) => {
                        tokio::select! {
                            _ = notify.notified() => {}
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => tokio::time::sleep(delay).await,
                }
                delay = (delay * 2).min(max_delay);
            }

            for artifact in &artifacts {
                if remove_artifact(artifact) {
                    debug!(plugin = %plugin, path = %artifact.display(), "临时产物已删除");
                } else {
                    warn!(plugin = %plugin, path = %artifact.display(), "临时产物无法删除，退出时重试");
                    delete_on_exit.lock().push(artifact.clone());
                }
            }
            pending.lock().remove(&generation);
            debug!(plugin = %plugin, generation = %generation, attempts, "插件代已回收");
        });

        let mut workers = self.workers.lock();
        workers.retain(|w| !w.is_finished());
        workers.push(worker);
    }

    /// 等待所有回收任务完成
    ///
    /// # Returns
    ///
    /// 超时前全部完成返回 `true`
    pub async fn drain(&self, timeout: Duration) -> bool {
        let pending = Arc::clone(&self.pending);
        tokio::time::timeout(timeout, async move {
            while !pending.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    /// 关闭回收器
    ///
    /// 等待进行中的任务至多 `shutdown_timeout_ms`，未完成的任务被取消，
    /// 其产物与退出待删列表一起做最后一次删除。
    ///
    /// # Returns
    ///
    /// 最终仍未删除的产物
    pub async fn shutdown(&self) -> Vec<PathBuf> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return self.delete_on_exit();
        }

        let timeout = Duration::from_millis(self.config.shutdown_timeout_ms);
        if !self.drain(timeout).await {
            warn!(pending = self.pending(), "回收任务未在限定时间内完成");
        }

        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            worker.abort();
        }

        let unfinished: Vec<PendingCleanup> = self.pending.lock().drain().map(|(_, p)| p).collect();
        let mut candidates: Vec<PathBuf> = self.delete_on_exit.lock().drain(..).collect();
        for p in unfinished {
            debug!(plugin = %p.plugin, "回收任务被取消");
            candidates.extend(p.artifacts);
        }

        let leftover: Vec<PathBuf> = candidates
            .into_iter()
            .filter(|a| !remove_artifact(a))
            .collect();
        if !leftover.is_empty() {
            warn!(count = leftover.len(), "部分临时产物无法删除");
        }
        *self.delete_on_exit.lock() = leftover.clone();
        leftover
    }

    /// 删除临时目录中残留的 `plugin_*` 文件
    ///
    /// 启动时调用，清理上次进程未能删除的解码副本。
    pub fn remove_stale_files(tmp_dir: &Path) -> io::Result<usize> {
        let mut removed = 0;
        for path in list_entries(tmp_dir)? {
            let stale = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(TMP_PREFIX))
                .unwrap_or(false);
            if stale && remove_artifact(&path) {
                debug!(path = %path.display(), "删除残留临时文件");
                removed += 1;
            }
        }
        if removed > 0 {
            info!(dir = %tmp_dir.display(), removed, "已清理残留临时文件");
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for CleanupReaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupReaper")
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("pending", &self.pending())
            .finish()
    }
}
