//! 插件管理器
//!
//! 协调扫描、排序、加载、启动、重载、停止与回收。所有修改插件表的操作
//! 由同一把操作锁串行执行；注册表与插件表的读取不经过这把锁。

use super::dependency::{DependencyGraph, DependencyResolver};
use super::environment::PluginEnvironment;
use super::generation::{GenerationId, LoadedPlugin};
use super::loader::ModuleLoader;
use super::metadata::{PluginInfo, PluginState};
use super::package::{
    discover, prune_duplicates, remove_artifact, strip_disabled, with_disabled, OpenOptions,
    PackageContents, PackageProvider, PluginPackage, ProviderRegistry,
};
use super::parser::DescriptorParser;
use super::reaper::CleanupReaper;
use super::runtime::{LibraryCatalog, SymbolLibrary};
use super::table::{DisabledEntry, PluginTable};
use crate::core::{PluginsConfig, RuntimeConfig};
use crate::extension::HostEnvironment;
use crate::utils::{PluginError, Result};
use semver::Version;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// 一次扫描的结果
#[derive(Debug, Default)]
pub struct ScanReport {
    /// 新启动的插件
    pub started: Vec<String>,
    /// 被新一代替换的插件
    pub reloaded: Vec<String>,
    /// 被停止的插件（包被删除或禁用，以及依赖它们的插件）
    pub stopped: Vec<String>,
    /// 失败的插件
    pub failed: Vec<(String, PluginError)>,
}

impl ScanReport {
    /// 没有任何变化
    pub fn is_empty(&self) -> bool {
        self.started.is_empty()
            && self.reloaded.is_empty()
            && self.stopped.is_empty()
            && self.failed.is_empty()
    }

    /// 失败的插件名称
    pub fn failed_names(&self) -> Vec<&str> {
        self.failed.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// 取出某个插件的失败原因
    pub fn take_failure(&mut self, name: &str) -> Option<PluginError> {
        let pos = self.failed.iter().position(|(n, _)| n == name)?;
        Some(self.failed.remove(pos).1)
    }
}

/// 插件管理器构建器
pub struct PluginManagerBuilder {
    config: RuntimeConfig,
    host: Option<Arc<HostEnvironment>>,
    catalog: LibraryCatalog,
    providers: ProviderRegistry,
    external: Vec<(String, Option<Version>)>,
}

impl PluginManagerBuilder {
    /// 设置宿主环境
    pub fn host(mut self, host: impl Into<Arc<HostEnvironment>>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// 设置符号库目录
    pub fn catalog(mut self, catalog: LibraryCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// 注册一个宿主内链接的符号库
    pub fn library(self, library: impl SymbolLibrary + 'static) -> Self {
        self.catalog.register(library);
        self
    }

    /// 注册插件包格式
    pub fn provider(mut self, provider: Arc<dyn PackageProvider>) -> Self {
        self.providers.register(provider);
        self
    }

    /// 登记由宿主内置、满足依赖检查的插件
    pub fn external(mut self, name: impl Into<String>, version: Option<Version>) -> Self {
        self.external.push((name.into(), version));
        self
    }

    /// 构建管理器
    ///
    /// # Errors
    ///
    /// 配置校验失败时返回 `InvalidConfigValue`
    pub fn build(self) -> Result<PluginManager> {
        self.config.validate()?;

        let host = self.host.unwrap_or_else(|| Arc::new(HostEnvironment::empty()));
        let mut providers = self.providers;
        providers.prioritize(&self.config.plugins.format_priority);

        Ok(PluginManager {
            loader: ModuleLoader::new(host.clone(), self.catalog, self.config.plugins.max_unit_size),
            env: Arc::new(PluginEnvironment::new(host)),
            reaper: CleanupReaper::new(self.config.cleanup.clone()),
            table: PluginTable::new(),
            providers,
            external: self.external,
            config: self.config,
            op_lock: Mutex::new(()),
            next_generation: AtomicU64::new(1),
            running: AtomicBool::new(false),
            scanner: parking_lot::Mutex::new(None),
        })
    }
}

/// 插件管理器
pub struct PluginManager {
    config: RuntimeConfig,
    providers: ProviderRegistry,
    loader: ModuleLoader,
    env: Arc<PluginEnvironment>,
    table: PluginTable,
    reaper: CleanupReaper,
    external: Vec<(String, Option<Version>)>,
    /// 操作锁：启动、停止、扫描、重载、启用、禁用、安装互斥
    op_lock: Mutex<()>,
    next_generation: AtomicU64,
    running: AtomicBool,
    scanner: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl PluginManager {
    /// 创建构建器
    pub fn builder(config: RuntimeConfig) -> PluginManagerBuilder {
        PluginManagerBuilder {
            config,
            host: None,
            catalog: LibraryCatalog::new(),
            providers: ProviderRegistry::with_builtin(),
            external: Vec::new(),
        }
    }

    // ==================== 访问器 ====================

    /// 运行时配置
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// 插件环境
    pub fn environment(&self) -> &Arc<PluginEnvironment> {
        &self.env
    }

    /// 宿主环境
    pub fn host(&self) -> &Arc<HostEnvironment> {
        self.env.host()
    }

    /// 回收器
    pub fn reaper(&self) -> &CleanupReaper {
        &self.reaper
    }

    /// 是否已启动
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ==================== 生命周期 ====================

    /// 启动：创建目录、清理残留临时文件并加载插件目录中的全部插件
    ///
    /// 单个插件失败只记录日志；依赖解析失败时本批插件都不启动，宿主照常启动。
    ///
    /// # Errors
    ///
    /// - 管理器已在运行：`Internal`
    /// - 目录无法创建：`Io`
    /// - 必需插件未运行：`MissingMandatory`
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<ScanReport> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PluginError::Internal("插件管理器已经在运行".to_string()));
        }

        let _op = self.op_lock.lock().await;
        let plugins = &self.config.plugins;
        if let Err(e) = Self::prepare_dirs(plugins).await {
            self.running.store(false, Ordering::SeqCst);
            error!(error_code = e.error_code(), "插件目录准备失败: {}", e);
            return Err(e);
        }

        info!(dir = %plugins.plugins_dir.display(), "启动插件管理器");
        let report = match self.scan_locked(&HashSet::new()).await {
            Ok(report) => report,
            Err(e) if e.is_resolution_error() => {
                error!(error_code = e.error_code(), "插件依赖解析失败，本批插件均未启动: {}", e);
                ScanReport::default()
            }
            Err(e) => return Err(e),
        };

        info!(
            started = report.started.len(),
            failed = report.failed.len(),
            "插件加载完成"
        );
        self.check_mandatory().await?;
        Ok(report)
    }

    /// 停止：按依赖逆序停止全部插件，然后关闭回收器
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(task) = self.scanner.lock().take() {
            task.abort();
        }

        let _op = self.op_lock.lock().await;
        let running = self.table.running_all().await;
        let names: Vec<String> = running.iter().map(|g| g.name().to_string()).collect();
        let order = running_graph(&running).unload_order(&names)?;
        drop(running);

        info!(count = order.len(), "停止全部插件");
        for name in order {
            if let Some(gen) = self.table.running(&name).await {
                self.unload(gen).await;
            }
        }

        let leftover = self.reaper.shutdown().await;
        if !leftover.is_empty() {
            warn!(count = leftover.len(), "部分临时产物未能删除");
        }
        info!("插件管理器已停止");
        Ok(())
    }

    /// 启动周期扫描任务
    ///
    /// `check_frequency_ms` 为 0 时不启动，返回 `false`。
    pub fn spawn_scanner(self: &Arc<Self>) -> bool {
        let Some(period) = self.config.plugins.check_frequency() else {
            return false;
        };

        let manager = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if !manager.is_running() {
                    break;
                }
                match manager.rescan().await {
                    Ok(report) if !report.is_empty() => debug!(?report, "周期扫描完成"),
                    Ok(_) => {}
                    Err(e) => warn!(error_code = e.error_code(), "周期扫描失败: {}", e),
                }
            }
        });

        if let Some(previous) = self.scanner.lock().replace(task) {
            previous.abort();
        }
        debug!(period_ms = period.as_millis() as u64, "周期扫描已启动");
        true
    }

    // ==================== 查询 ====================

    /// 全部插件信息
    pub async fn list(&self) -> Vec<PluginInfo> {
        self.table.list().await
    }

    /// 单个插件信息
    pub async fn get(&self, name: &str) -> Option<PluginInfo> {
        self.table.info(name).await
    }

    /// 运行中插件的当前一代
    pub async fn generation(&self, name: &str) -> Option<Arc<LoadedPlugin>> {
        self.table.running(name).await
    }

    /// 不加载代码，计算插件目录中已启用插件的加载顺序
    ///
    /// # Errors
    ///
    /// 插件包无效或依赖解析失败
    pub fn resolve_order(&self) -> Result<Vec<String>> {
        let packages = discover(&self.config.plugins.plugins_dir, &self.providers)?;
        let options = self.open_options();
        let mut descriptors = Vec::new();
        for pkg in packages.iter().filter(|p| p.enabled) {
            let contents = pkg.provider.open(&pkg.path, &options)?;
            discard(&contents);
            descriptors.push(contents.descriptor);
        }
        self.resolver(&HashSet::new(), &[]).resolve(descriptors.iter())
    }

    // ==================== 管理操作 ====================

    /// 重新扫描插件目录，加载新增与变更的插件，停止被删除的插件
    ///
    /// # Errors
    ///
    /// - 依赖解析失败：`MissingDependency` / `IncompatibleDependency` / `CyclicDependency`
    /// - 必需插件未运行：`MissingMandatory`
    #[instrument(skip(self))]
    pub async fn rescan(&self) -> Result<ScanReport> {
        let _op = self.op_lock.lock().await;
        let report = self.scan_locked(&HashSet::new()).await?;
        self.check_mandatory().await?;
        Ok(report)
    }

    /// 重载指定插件，名单为空时重新扫描全部
    ///
    /// 即使内容没有变化也会产生新的一代。替换失败时当前一代继续运行。
    ///
    /// # Errors
    ///
    /// - 插件未运行：`PluginNotRunning`
    /// - 新一代校验或启动失败：`ReloadFailure`
    #[instrument(skip(self))]
    pub async fn reload(&self, names: &[String]) -> Result<Vec<PluginInfo>> {
        let _op = self.op_lock.lock().await;
        if names.is_empty() {
            self.scan_locked(&HashSet::new()).await?;
            return Ok(self.table.list().await);
        }

        for name in names {
            if self.table.running(name).await.is_none() {
                return Err(PluginError::PluginNotRunning(name.clone()));
            }
        }

        let force: HashSet<String> = names.iter().cloned().collect();
        let mut report = self.scan_locked(&force).await?;
        let mut infos = Vec::with_capacity(names.len());
        for name in names {
            if let Some(e) = report.take_failure(name) {
                return Err(match e {
                    e @ PluginError::ReloadFailure { .. } => e,
                    e => PluginError::reload_failure(name, e),
                });
            }
            match self.table.running(name).await {
                Some(gen) => infos.push(gen.info()),
                None => return Err(PluginError::PluginNotFound(name.clone())),
            }
        }
        Ok(infos)
    }

    /// 启用插件：去掉禁用标记并加载，得到新的一代
    ///
    /// # Errors
    ///
    /// - 未开启远程管理：`RemoteAdminDisabled`
    /// - 插件不存在：`PluginNotFound`
    /// - 加载失败：加载时的错误
    #[instrument(skip(self))]
    pub async fn enable(&self, name: &str) -> Result<PluginInfo> {
        self.require_admin("enable")?;
        let _op = self.op_lock.lock().await;

        if let Some(gen) = self.table.running(name).await {
            return Ok(gen.info());
        }
        let entry = self
            .table
            .disabled(name)
            .await
            .ok_or_else(|| PluginError::PluginNotFound(name.to_string()))?;

        let target = strip_disabled(&entry.path);
        tokio::fs::rename(&entry.path, &target)
            .await
            .map_err(|e| PluginError::install_failure(name, format!("无法启用插件包: {}", e)))?;
        self.table.remove_disabled(name).await;
        info!(plugin = %name, path = %target.display(), "插件已启用");

        let mut report = self.scan_locked(&HashSet::from([name.to_string()])).await?;
        if let Some(e) = report.take_failure(name) {
            return Err(e);
        }
        self.table
            .running(name)
            .await
            .map(|g| g.info())
            .ok_or_else(|| PluginError::start_failure(name, "启用后插件未运行"))
    }

    /// 禁用插件：停止插件及依赖它的插件，并给插件包加上禁用标记
    ///
    /// # Errors
    ///
    /// - 未开启远程管理：`RemoteAdminDisabled`
    /// - 必需插件：`MandatoryPlugin`
    /// - 插件不存在：`PluginNotFound`
    #[instrument(skip(self))]
    pub async fn disable(&self, name: &str) -> Result<PluginInfo> {
        self.require_admin("disable")?;
        if self.config.plugins.is_mandatory(name) {
            return Err(PluginError::MandatoryPlugin(name.to_string()));
        }
        let _op = self.op_lock.lock().await;

        if let Some(entry) = self.table.disabled(name).await {
            return Ok(disabled_info(&entry));
        }

        let (source, version) = match self.table.running(name).await {
            Some(gen) => (gen.source().to_path_buf(), Some(gen.descriptor().version.clone())),
            None => {
                let packages = discover(&self.config.plugins.plugins_dir, &self.providers)?;
                let pkg = packages
                    .into_iter()
                    .find(|p| p.enabled && p.name == name)
                    .ok_or_else(|| PluginError::PluginNotFound(name.to_string()))?;
                (pkg.path, None)
            }
        };

        self.stop_with_dependents(&[name.to_string()]).await?;

        let target = with_disabled(&source);
        tokio::fs::rename(&source, &target)
            .await
            .map_err(|e| PluginError::install_failure(name, format!("无法禁用插件包: {}", e)))?;
        self.table.clear_broken(&source).await;

        let entry = DisabledEntry {
            name: name.to_string(),
            path: target,
            version,
        };
        let info = disabled_info(&entry);
        self.table.put_disabled(entry).await;
        info!(plugin = %name, "插件已禁用");
        Ok(info)
    }

    /// 从字节流安装插件
    ///
    /// 新内容先写入 `.next_` 临时文件，已有的包备份为 `.last_`，然后移动到位并加载。
    /// 加载失败时删除新文件并恢复备份，当前一代继续运行。
    ///
    /// # Errors
    ///
    /// - 未开启远程管理：`RemoteAdminDisabled`
    /// - 没有支持字节流的格式：`UnsupportedPackage`
    /// - 包无法打开、描述中的名称与 `name` 不一致、写入或加载失败：`InstallFailure`
    #[instrument(skip(self, data), fields(size = data.len()))]
    pub async fn install(&self, name: &str, data: &[u8]) -> Result<PluginInfo> {
        self.require_admin("install")?;
        if !DescriptorParser::is_valid_name(name) {
            return Err(PluginError::invalid_package(name, "插件名称格式无效"));
        }
        let provider = self.providers.stream_provider().ok_or_else(|| {
            PluginError::UnsupportedPackage("没有支持字节流安装的插件包格式".to_string())
        })?;
        let extension = provider.file_extension().unwrap_or(provider.id()).to_string();

        let _op = self.op_lock.lock().await;
        let dir = &self.config.plugins.plugins_dir;
        tokio::fs::create_dir_all(dir).await?;
        let target = dir.join(format!("{}.{}", name, extension));
        let staging = dir.join(format!(".next_{}_{}.{}", name, Uuid::new_v4().simple(), extension));

        tokio::fs::write(&staging, data)
            .await
            .map_err(|e| PluginError::install_failure(name, format!("无法写入插件包: {}", e)))?;

        // 移入前校验：包必须能打开，且描述中的名称与安装名称一致
        let checked = provider.open(&staging, &self.open_options()).and_then(|contents| {
            discard(&contents);
            if contents.descriptor.name == name {
                Ok(())
            } else {
                Err(PluginError::invalid_package(
                    name,
                    format!("描述中的插件名称为 '{}'", contents.descriptor.name),
                ))
            }
        });
        if let Err(e) = checked {
            remove_artifact(&staging);
            warn!(plugin = %name, "插件包校验失败: {}", e);
            return Err(PluginError::install_failure(name, e));
        }

        let backup = match tokio::fs::try_exists(&target).await {
            Ok(true) => {
                let backup = dir.join(format!(".last_{}.{}", name, extension));
                if let Err(e) = tokio::fs::rename(&target, &backup).await {
                    remove_artifact(&staging);
                    return Err(PluginError::install_failure(name, format!("无法备份插件包: {}", e)));
                }
                Some(backup)
            }
            _ => None,
        };

        let disabled = with_disabled(&target);
        if tokio::fs::try_exists(&disabled).await.unwrap_or(false) {
            remove_artifact(&disabled);
        }

        if let Err(e) = tokio::fs::rename(&staging, &target).await {
            remove_artifact(&staging);
            restore(backup.as_deref(), &target).await;
            return Err(PluginError::install_failure(name, format!("无法移动插件包: {}", e)));
        }

        let failure = match self.scan_locked(&HashSet::from([name.to_string()])).await {
            Ok(mut report) => report.take_failure(name),
            Err(e) => Some(e),
        };
        let failure = match failure {
            Some(e) => Some(e),
            None if self.table.running(name).await.is_none() => {
                Some(PluginError::start_failure(name, "安装后插件未运行"))
            }
            None => None,
        };

        match failure {
            None => {
                if let Some(backup) = backup {
                    remove_artifact(&backup);
                }
                info!(plugin = %name, path = %target.display(), "插件已安装");
                self.table
                    .running(name)
                    .await
                    .map(|g| g.info())
                    .ok_or_else(|| PluginError::PluginNotFound(name.to_string()))
            }
            Some(e) => {
                warn!(plugin = %name, "插件安装失败，恢复原有插件包: {}", e);
                remove_artifact(&target);
                self.table.clear_broken(&target).await;
                restore(backup.as_deref(), &target).await;
                Err(PluginError::install_failure(name, e))
            }
        }
    }

    // ==================== 内部实现 ====================

    fn require_admin(&self, operation: &str) -> Result<()> {
        if self.config.plugins.allow_remote_admin {
            Ok(())
        } else {
            Err(PluginError::RemoteAdminDisabled(operation.to_string()))
        }
    }

    async fn prepare_dirs(plugins: &PluginsConfig) -> Result<()> {
        for dir in [&plugins.plugins_dir, &plugins.data_dir, &plugins.tmp_dir] {
            tokio::fs::create_dir_all(dir).await?;
        }
        CleanupReaper::remove_stale_files(&plugins.tmp_dir)?;
        Ok(())
    }

    fn open_options(&self) -> OpenOptions {
        OpenOptions {
            tmp_dir: self.config.plugins.tmp_dir.clone(),
            max_unit_size: self.config.plugins.max_unit_size,
        }
    }

    fn resolver(&self, batch: &HashSet<String>, running: &[Arc<LoadedPlugin>]) -> DependencyResolver {
        let mut resolver = DependencyResolver::new();
        for (name, version) in &self.external {
            resolver = resolver.with_external(name.clone(), version.clone());
        }
        for gen in running.iter().filter(|g| !batch.contains(g.name())) {
            resolver = resolver.with_external(gen.name(), gen.descriptor().parsed_version());
        }
        resolver
    }

    async fn check_mandatory(&self) -> Result<()> {
        let mut missing = Vec::new();
        for name in &self.config.plugins.mandatory {
            if self.table.running(name).await.is_none() {
                missing.push(name.clone());
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PluginError::MissingMandatory(missing))
        }
    }

    /// 扫描并处理变化，调用方持有操作锁
    ///
    /// `force` 中的插件即使内容未变也会重新加载。
    async fn scan_locked(&self, force: &HashSet<String>) -> Result<ScanReport> {
        let mut report = ScanReport::default();

        let packages = discover(&self.config.plugins.plugins_dir, &self.providers)?;
        let packages = prune_duplicates(packages, &self.providers);
        let paths: Vec<PathBuf> = packages.iter().map(|p| p.path.clone()).collect();
        self.table.retain_broken(&paths).await;

        let (active, disabled): (Vec<PluginPackage>, Vec<PluginPackage>) =
            packages.into_iter().partition(|p| p.enabled);
        self.table
            .replace_disabled(disabled.into_iter().map(|p| DisabledEntry {
                name: p.name,
                path: p.path,
                version: None,
            }))
            .await;
        let active: BTreeMap<String, PluginPackage> =
            active.into_iter().map(|p| (p.name.clone(), p)).collect();

        // 1. 包已消失的插件连同依赖它们的插件一起停止
        let removed: Vec<String> = self
            .table
            .running_names()
            .await
            .into_iter()
            .filter(|n| !active.contains_key(n))
            .collect();
        if !removed.is_empty() {
            report.stopped = self.stop_with_dependents(&removed).await?;
        }

        // 2. 新增、变更与强制重载的插件
        let mut candidates = Vec::new();
        for pkg in active.values() {
            if !force.contains(&pkg.name) {
                if let Some(gen) = self.table.running(&pkg.name).await {
                    if gen.source() == pkg.path && gen.fingerprint() == pkg.fingerprint {
                        continue;
                    }
                }
                if self.table.is_broken(&pkg.path, pkg.fingerprint).await {
                    debug!(plugin = %pkg.name, path = %pkg.path.display(), "跳过内容未变的失败插件包");
                    continue;
                }
            }
            candidates.push(pkg.clone());
        }
        if candidates.is_empty() {
            return Ok(report);
        }

        // 3. 解码
        let options = self.open_options();
        let mut opened: Vec<(PluginPackage, PackageContents)> = Vec::new();
        for pkg in candidates {
            match pkg.provider.open(&pkg.path, &options) {
                Ok(contents) => opened.push((pkg, contents)),
                Err(e) => {
                    let reloading = self.table.running(&pkg.name).await.is_some();
                    let e = self.fail(&pkg, &pkg.name, reloading, e).await;
                    report.failed.push((pkg.name.clone(), e));
                }
            }
        }

        // 4. 依赖解析，失败时整批放弃
        let batch: HashSet<String> = opened
            .iter()
            .map(|(_, c)| c.descriptor.name.clone())
            .collect();
        let running = self.table.running_all().await;
        let resolved = self
            .resolver(&batch, &running)
            .build_graph(opened.iter().map(|(_, c)| &c.descriptor))
            .and_then(|graph| {
                let changed: Vec<String> = batch.iter().cloned().collect();
                graph.affected_subgraph(&changed)
            });
        drop(running);
        let order = match resolved {
            Ok(order) => order,
            Err(e) => {
                for (_, contents) in &opened {
                    discard(contents);
                }
                error!(error_code = e.error_code(), "依赖解析失败，放弃本批插件: {}", e);
                return Err(e);
            }
        };
        debug!(?order, "加载顺序");

        // 5. 按顺序加载启动
        let mut by_name: BTreeMap<String, (PluginPackage, PackageContents)> = opened
            .into_iter()
            .map(|(p, c)| (c.descriptor.name.clone(), (p, c)))
            .collect();
        for name in order {
            let Some((pkg, contents)) = by_name.remove(&name) else {
                continue;
            };
            let reloading = self.table.running(&name).await.is_some();
            match self.run_plugin(&pkg, contents).await {
                Ok(()) if reloading => report.reloaded.push(name),
                Ok(()) => report.started.push(name),
                Err(e) => report.failed.push((name, e)),
            }
        }

        Ok(report)
    }

    /// 加载、启动并附加一代插件；已有运行中的一代时与之对账后替换
    async fn run_plugin(&self, pkg: &PluginPackage, contents: PackageContents) -> Result<()> {
        let name = contents.descriptor.name.clone();

        for dep in contents.descriptor.dependency_names() {
            let satisfied = self.table.running(dep).await.is_some()
                || self.external.iter().any(|(n, _)| n == dep);
            if !satisfied {
                discard(&contents);
                let e = PluginError::start_failure(&name, format!("依赖插件 '{}' 未运行", dep));
                warn!(plugin = %name, dependency = %dep, "{}", e);
                return Err(e);
            }
        }

        let mut old = self.table.running(&name).await;
        if let Some(ref current) = old {
            if !current.can_reload() && self.config.plugins.is_mandatory(&name) {
                discard(&contents);
                let e = PluginError::reload_failure(&name, "不允许冷重启必需插件，新内容需要重启宿主才能生效");
                self.table
                    .mark_broken(&pkg.path, &name, pkg.fingerprint, e.to_string())
                    .await;
                warn!(plugin = %name, generation = %current.id(), "{}", e);
                return Err(e);
            }
        }

        let id = GenerationId::new(self.next_generation.fetch_add(1, Ordering::SeqCst));
        let loaded = match self.loader.load(&contents, id.as_u64()) {
            Ok(loaded) => loaded,
            Err(e) => return Err(self.fail(pkg, &name, old.is_some(), e).await),
        };

        // 任一代为重启模式时冷重启：先卸载旧代，新代按首次加载附加
        let hot = old
            .as_ref()
            .map_or(false, |o| o.can_reload() && contents.descriptor.can_reload());
        if !hot {
            if let Some(current) = old.take() {
                info!(plugin = %name, generation = %current.id(), "冷重启插件");
                self.unload(current).await;
            }
        }

        let PackageContents { descriptor, .. } = contents;
        let gen = Arc::new(LoadedPlugin::new(
            id,
            descriptor,
            pkg.path.clone(),
            pkg.fingerprint,
            &self.config.plugins.data_dir,
            loaded,
        ));

        let attached = gen.start(self.env.host()).and_then(|()| match old {
            Some(ref old) => self.env.reattach(old, &gen),
            None => self.env.attach(&gen),
        });
        if let Err(e) = attached {
            gen.stop();
            self.retire(gen);
            return Err(self.fail(pkg, &name, old.is_some(), e).await);
        }

        gen.set_state(PluginState::Running);
        self.table.put_running(gen.clone()).await;
        self.table.clear_broken(&pkg.path).await;

        match old {
            Some(old) => {
                old.stop();
                let old_info = old.info();
                self.retire(old);
                self.env.notify_reload(&old_info, &gen.info());
                info!(
                    plugin = %name,
                    version = %gen.descriptor().version,
                    generation = %id,
                    previous = ?old_info.generation,
                    "插件已重载"
                );
            }
            None => {
                self.env.notify_start(&gen.info());
                info!(
                    plugin = %name,
                    version = %gen.descriptor().version,
                    generation = %id,
                    source = %pkg.path.display(),
                    "插件已加载"
                );
            }
        }
        Ok(())
    }

    /// 记录失败并返回对外的错误；替换运行中插件失败时包装为 `ReloadFailure`
    async fn fail(&self, pkg: &PluginPackage, name: &str, reloading: bool, e: PluginError) -> PluginError {
        self.table
            .mark_broken(&pkg.path, name, pkg.fingerprint, e.to_string())
            .await;
        if reloading {
            warn!(plugin = %name, error_code = e.error_code(), "插件重载失败，继续运行当前版本: {}", e);
            match e {
                e @ PluginError::ReloadFailure { .. } => e,
                e => PluginError::reload_failure(name, e),
            }
        } else {
            error!(plugin = %name, error_code = e.error_code(), "插件加载失败: {}", e);
            e
        }
    }

    /// 停止插件及所有依赖它们的运行中插件，依赖方先停止
    async fn stop_with_dependents(&self, names: &[String]) -> Result<Vec<String>> {
        let running = self.table.running_all().await;
        let graph = running_graph(&running);
        drop(running);

        let mut targets: HashSet<String> = HashSet::new();
        for name in names.iter().filter(|n| graph.contains(n)) {
            targets.insert(name.clone());
            targets.extend(graph.all_dependents(name));
        }
        let targets: Vec<String> = targets.into_iter().collect();
        let order = graph.unload_order(&targets)?;

        let mut stopped = Vec::with_capacity(order.len());
        for name in order {
            if let Some(gen) = self.table.running(&name).await {
                self.unload(gen).await;
                stopped.push(name);
            }
        }
        Ok(stopped)
    }

    async fn unload(&self, gen: Arc<LoadedPlugin>) {
        let name = gen.name().to_string();
        self.table.remove_running(&name).await;
        gen.stop();
        self.env.notify_stop(&gen.info());
        info!(plugin = %name, generation = %gen.id(), "插件已卸载");
        self.retire(gen);
    }

    /// 交给回收器，等命名空间释放后删除临时产物
    fn retire(&self, gen: Arc<LoadedPlugin>) {
        let (namespace, artifacts) = gen.cleanup_task();
        let name = gen.name().to_string();
        let id = gen.id();
        drop(gen);
        self.reaper.schedule(&name, id, namespace, artifacts);
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins_dir", &self.config.plugins.plugins_dir)
            .field("running", &self.is_running())
            .finish()
    }
}

/// 运行中插件之间的依赖图
fn running_graph(running: &[Arc<LoadedPlugin>]) -> DependencyGraph {
    let mut graph = DependencyGraph::new();
    for gen in running {
        graph.add_plugin(gen.name());
    }
    for gen in running {
        for dep in gen.descriptor().dependency_names() {
            if graph.contains(dep) {
                graph.add_dependency(gen.name(), dep);
            }
        }
    }
    graph
}

fn discard(contents: &PackageContents) {
    for artifact in &contents.artifacts {
        remove_artifact(artifact);
    }
}

fn disabled_info(entry: &DisabledEntry) -> PluginInfo {
    PluginInfo {
        name: entry.name.clone(),
        version: entry.version.clone().unwrap_or_default(),
        enabled: false,
        state: PluginState::Disabled,
        source: entry.path.clone(),
        ..Default::default()
    }
}

async fn restore(backup: Option<&Path>, target: &Path) {
    if let Some(backup) = backup {
        if let Err(e) = tokio::fs::rename(backup, target).await {
            error!(path = %target.display(), "无法恢复插件包备份: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::metadata::{Dependency, PluginDescriptor};
    use crate::plugin::package::Fingerprint;
    use crate::plugin::loader::LoadedModules;
    use crate::plugin::runtime::PluginNamespace;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> RuntimeConfig {
        RuntimeConfig::builder()
            .plugins_dir(dir.path().join("plugins"))
            .data_dir(dir.path().join("data"))
            .tmp_dir(dir.path().join("tmp"))
            .check_frequency_ms(0)
            .build()
    }

    fn gen(name: &str, deps: &[&str]) -> Arc<LoadedPlugin> {
        let desc = deps.iter().fold(PluginDescriptor::new(name, "1.0.0"), |d, dep| {
            d.with_dependency(Dependency::new(*dep))
        });
        Arc::new(LoadedPlugin::new(
            GenerationId::new(1),
            desc,
            PathBuf::from(name),
            Fingerprint::default(),
            Path::new("/data"),
            LoadedModules {
                namespace: PluginNamespace::new(name, 1, None, vec![]),
                modules: [None, None, None],
            },
        ))
    }

    #[test]
    fn test_running_graph_unload_order() {
        let running = vec![gen("r", &["q"]), gen("p", &[]), gen("q", &["p", "host"])];
        let graph = running_graph(&running);
        let order = graph
            .unload_order(&["p".to_string(), "q".to_string(), "r".to_string()])
            .unwrap();
        assert_eq!(order, vec!["r", "q", "p"]);
    }

    #[tokio::test]
    async fn test_admin_operations_refused() {
        let dir = TempDir::new().unwrap();
        let manager = PluginManager::builder(config(&dir)).build().unwrap();

        let err = manager.disable("x").await.unwrap_err();
        assert!(matches!(err, PluginError::RemoteAdminDisabled(_)));
        let err = manager.install("x", b"").await.unwrap_err();
        assert!(matches!(err, PluginError::RemoteAdminDisabled(_)));
    }

    #[tokio::test]
    async fn test_start_empty_directory() {
        let dir = TempDir::new().unwrap();
        let manager = PluginManager::builder(config(&dir)).build().unwrap();

        let report = manager.start().await.unwrap();
        assert!(report.is_empty());
        assert!(dir.path().join("plugins").is_dir());
        assert!(manager.start().await.is_err());

        manager.stop().await.unwrap();
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_missing_mandatory() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.plugins.mandatory = vec!["accounts".to_string()];
        let manager = PluginManager::builder(cfg).build().unwrap();

        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, PluginError::MissingMandatory(ref m) if m == &vec!["accounts".to_string()]));
    }

    #[test]
    fn test_scan_report_failures() {
        let mut report = ScanReport::default();
        report
            .failed
            .push(("a".to_string(), PluginError::start_failure("a", "boom")));
        assert_eq!(report.failed_names(), vec!["a"]);
        assert!(report.take_failure("a").is_some());
        assert!(report.is_empty());
    }
}
