//! 插件代
//!
//! [`LoadedPlugin`] 是一个逻辑插件的一次加载实例：命名空间、各子系统模块与作用域、
//! 在注册表中持有的句柄，以及生命周期状态。热重载产生新的一代，代标识与插件名无关。

use super::loader::{LoadedModules, ModuleSlots};
use super::metadata::{PluginDescriptor, PluginInfo, PluginState};
use super::package::Fingerprint;
use super::runtime::PluginNamespace;
use crate::extension::{
    Binder, HandleId, HostEnvironment, LifecycleListener, PluginContext, PluginScope,
    RegistrationHandle, Subsystem,
};
use crate::extension::binder::ScopeParents;
use crate::utils::{PluginError, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// 代标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenerationId(u64);

impl GenerationId {
    /// 从数值创建
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// 数值形式
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 作用域槽位
type ScopeSlots = [Option<Arc<PluginScope>>; 3];

/// 已加载的插件（一代）
pub struct LoadedPlugin {
    id: GenerationId,
    descriptor: PluginDescriptor,
    source: PathBuf,
    fingerprint: Fingerprint,
    data_dir: PathBuf,
    modules: ModuleSlots,
    scopes: RwLock<ScopeSlots>,
    listeners: Mutex<Vec<Arc<dyn LifecycleListener>>>,
    handles: Mutex<Vec<Arc<dyn RegistrationHandle>>>,
    state: RwLock<PluginState>,
    loaded_at: DateTime<Utc>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    /// 最后释放：上面的模块、作用域与监听器都可能引用命名空间中的代码
    namespace: Arc<PluginNamespace>,
}

impl LoadedPlugin {
    /// 由加载结果创建一代插件
    ///
    /// # Arguments
    ///
    /// * `id` - 代标识
    /// * `descriptor` - 插件描述
    /// * `source` - 插件包路径
    /// * `fingerprint` - 加载时的内容指纹
    /// * `data_root` - 数据根目录，插件数据目录为 `data_root/<name>`
    /// * `loaded` - 模块加载结果
    pub fn new(
        id: GenerationId,
        descriptor: PluginDescriptor,
        source: PathBuf,
        fingerprint: Fingerprint,
        data_root: &Path,
        loaded: LoadedModules,
    ) -> Self {
        let data_dir = data_root.join(&descriptor.name);
        Self {
            id,
            descriptor,
            source,
            fingerprint,
            data_dir,
            namespace: loaded.namespace,
            modules: loaded.modules,
            scopes: RwLock::new([None, None, None]),
            listeners: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
            state: RwLock::new(PluginState::Loaded),
            loaded_at: Utc::now(),
            started_at: RwLock::new(None),
        }
    }

    // ==================== 访问器 ====================

    /// 代标识
    pub fn id(&self) -> GenerationId {
        self.id
    }

    /// 插件名称
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// 插件描述
    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    /// 插件包路径
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// 加载时的内容指纹
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// 是否支持热替换
    pub fn can_reload(&self) -> bool {
        self.descriptor.can_reload()
    }

    /// 当前状态
    pub fn state(&self) -> PluginState {
        *self.state.read()
    }

    /// 设置状态
    pub fn set_state(&self, state: PluginState) {
        *self.state.write() = state;
    }

    /// 命名空间
    pub fn namespace(&self) -> &Arc<PluginNamespace> {
        &self.namespace
    }

    /// 命名空间弱引用（供回收器观察）
    pub fn namespace_weak(&self) -> Weak<PluginNamespace> {
        Arc::downgrade(&self.namespace)
    }

    /// 已配置的作用域（按子系统顺序）
    pub fn scopes(&self) -> Vec<Arc<PluginScope>> {
        self.scopes.read().iter().flatten().cloned().collect()
    }

    /// 某个子系统的作用域
    pub fn scope(&self, subsystem: Subsystem) -> Option<Arc<PluginScope>> {
        self.scopes.read()[subsystem.index()].clone()
    }

    /// 插件信息
    pub fn info(&self) -> PluginInfo {
        PluginInfo {
            name: self.descriptor.name.clone(),
            version: self.descriptor.version.clone(),
            enabled: true,
            state: self.state(),
            source: self.source.clone(),
            generation: Some(self.id.as_u64()),
            api: self.descriptor.api,
            reload: self.descriptor.reload,
            loaded_at: Some(self.loaded_at),
            started_at: *self.started_at.read(),
            last_error: None,
        }
    }

    fn context(&self) -> PluginContext {
        PluginContext {
            name: self.descriptor.name.clone(),
            version: self.descriptor.version.clone(),
            generation: self.id.as_u64(),
            data_dir: self.data_dir.clone(),
        }
    }

    // ==================== 生命周期 ====================

    /// 启动
    ///
    /// 按 system → shell → web 顺序配置模块。shell / web 作用域的父级依次为
    /// 本插件的 system 作用域、宿主对应子系统作用域、宿主 system 作用域。
    /// 模块配置完成后按注册顺序启动生命周期监听器；任一失败时逆序停止已启动的监听器。
    ///
    /// 启动完成前绑定不会出现在注册表中，附加由插件环境在启动成功后执行。
    ///
    /// # Errors
    ///
    /// 模块配置或监听器启动失败时返回 `StartFailure`
    pub fn start(&self, env: &HostEnvironment) -> Result<()> {
        self.set_state(PluginState::Starting);
        let name = self.descriptor.name.clone();

        let result = (|| -> Result<()> {
            let mut slots: ScopeSlots = [None, None, None];
            for subsystem in Subsystem::ALL {
                let Some(module) = self.modules[subsystem.index()].as_ref() else {
                    continue;
                };
                let Some(host) = env.scope(subsystem) else {
                    continue;
                };

                let mut parents = ScopeParents::default();
                if subsystem != Subsystem::System {
                    parents.plugin.extend(slots[Subsystem::System.index()].clone());
                }
                parents.host.push(host.clone());
                if subsystem != Subsystem::System {
                    parents.host.extend(env.scope(Subsystem::System).cloned());
                }

                let mut binder =
                    Binder::new(self.context(), subsystem, self.descriptor.api, parents);
                module
                    .configure(&mut binder)
                    .map_err(|e| PluginError::start_failure(&name, format!("{} 模块配置失败: {:#}", subsystem, e)))?;
                let scope = binder.finish_with(|p| self.namespace.guard(p));
                slots[subsystem.index()] = Some(Arc::new(scope));
            }

            let listeners: Vec<Arc<dyn LifecycleListener>> = slots
                .iter()
                .flatten()
                .flat_map(|s| s.listeners().iter().cloned())
                .collect();

            let mut started: Vec<Arc<dyn LifecycleListener>> = Vec::with_capacity(listeners.len());
            for listener in listeners {
                if let Err(e) = listener.start() {
                    for l in started.iter().rev() {
                        l.stop();
                    }
                    return Err(PluginError::start_failure(&name, format!("{:#}", e)));
                }
                started.push(listener);
            }

            *self.scopes.write() = slots;
            *self.listeners.lock() = started;
            Ok(())
        })();

        match result {
            Ok(()) => {
                *self.started_at.write() = Some(Utc::now());
                debug!(plugin = %name, generation = %self.id, "插件代已启动");
                Ok(())
            }
            Err(e) => {
                self.set_state(PluginState::Failed);
                Err(e)
            }
        }
    }

    /// 停止
    ///
    /// 逆序停止生命周期监听器，然后撤销仍由本代持有的全部注册句柄。
    /// 重复调用无副作用。
    pub fn stop(&self) {
        let listeners: Vec<Arc<dyn LifecycleListener>> = std::mem::take(&mut *self.listeners.lock());
        let handles: Vec<Arc<dyn RegistrationHandle>> = std::mem::take(&mut *self.handles.lock());
        if listeners.is_empty() && handles.is_empty() && self.state() == PluginState::Stopped {
            return;
        }

        self.set_state(PluginState::Stopping);
        for listener in listeners.iter().rev() {
            listener.stop();
        }
        for handle in &handles {
            handle.remove();
        }
        self.set_state(PluginState::Stopped);
        debug!(plugin = %self.name(), generation = %self.id, removed = handles.len(), "插件代已停止");
    }

    // ==================== 注册句柄 ====================

    /// 记录注册句柄
    pub fn add_handles(&self, handles: impl IntoIterator<Item = Arc<dyn RegistrationHandle>>) {
        self.handles.lock().extend(handles);
    }

    /// 当前持有的注册句柄
    pub fn handles(&self) -> Vec<Arc<dyn RegistrationHandle>> {
        self.handles.lock().clone()
    }

    /// 取出指定句柄，所有权转移给调用方
    pub fn take_handles(&self, ids: &HashSet<HandleId>) -> Vec<Arc<dyn RegistrationHandle>> {
        let mut handles = self.handles.lock();
        let (taken, kept): (Vec<_>, Vec<_>) = handles
            .drain(..)
            .partition(|h| ids.contains(&h.id()));
        *handles = kept;
        taken
    }

    /// 撤销全部注册句柄（启动后附加失败时回滚）
    pub fn remove_handles(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            handle.remove();
        }
    }

    /// 回收任务所需的信息：命名空间弱引用与临时产物
    pub fn cleanup_task(&self) -> (Weak<PluginNamespace>, Vec<PathBuf>) {
        (self.namespace_weak(), self.namespace.artifacts().to_vec())
    }
}

impl Drop for LoadedPlugin {
    fn drop(&mut self) {
        if !self.handles.get_mut().is_empty() {
            warn!(plugin = %self.descriptor.name, generation = %self.id, "插件代释放时仍持有注册句柄");
        }
    }
}

impl fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("id", &self.id)
            .field("name", &self.descriptor.name)
            .field("version", &self.descriptor.version)
            .field("state", &self.state())
            .field("handles", &self.handles.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::{provider, HostScope, PluginModule};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        starts: AtomicUsize,
        stops: AtomicUsize,
        fail: bool,
    }

    impl LifecycleListener for Counter {
        fn start(&self) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("启动失败");
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct SystemModule(Arc<Counter>);

    impl PluginModule for SystemModule {
        fn configure(&self, binder: &mut Binder) -> anyhow::Result<()> {
            binder.bind("demo.Greeting").named("greeting").to_instance("hello".to_string());
            binder.listen(self.0.clone());
            Ok(())
        }
    }

    struct ShellModule;

    impl PluginModule for ShellModule {
        fn configure(&self, binder: &mut Binder) -> anyhow::Result<()> {
            // 可以看到本插件 system 作用域与宿主服务
            let greeting = binder.get_as::<String>("demo.Greeting")?;
            let accounts = binder.get_as::<String>("chips.Accounts")?;
            binder
                .bind(crate::extension::SHELL_COMMAND)
                .named("greet")
                .to_instance(format!("{} {}", greeting, accounts));
            Ok(())
        }
    }

    struct Failing;

    impl PluginModule for Failing {
        fn configure(&self, _binder: &mut Binder) -> anyhow::Result<()> {
            anyhow::bail!("配置出错")
        }
    }

    fn env() -> HostEnvironment {
        HostEnvironment::builder()
            .system(
                HostScope::builder(Subsystem::System)
                    .service("chips.Accounts", provider::instance("accounts".to_string())),
            )
            .shell(HostScope::builder(Subsystem::Shell))
            .build()
    }

    fn generation(modules: ModuleSlots) -> LoadedPlugin {
        let namespace = PluginNamespace::new("demo", 1, None, vec![]);
        LoadedPlugin::new(
            GenerationId::new(1),
            PluginDescriptor::new("demo", "1.0.0"),
            PathBuf::from("/plugins/demo"),
            Fingerprint::default(),
            Path::new("/data"),
            LoadedModules { namespace, modules },
        )
    }

    fn counter(fail: bool) -> Arc<Counter> {
        Arc::new(Counter {
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            fail,
        })
    }

    #[test]
    fn test_start_configures_scope_chain() {
        let c = counter(false);
        let gen = generation([
            Some(Arc::new(SystemModule(c.clone()))),
            Some(Arc::new(ShellModule)),
            None,
        ]);
        gen.start(&env()).unwrap();

        assert_eq!(gen.scopes().len(), 2);
        assert_eq!(c.starts.load(Ordering::SeqCst), 1);
        let shell = gen.scope(Subsystem::Shell).unwrap();
        let cmd = &shell.bindings()[0];
        assert_eq!(cmd.key.name(), Some("greet"));
        let value = cmd.provider.get().unwrap().downcast::<String>().unwrap();
        assert_eq!(value.as_str(), "hello accounts");
        assert!(gen.info().started_at.is_some());
        assert_eq!(gen.info().generation, Some(1));
    }

    #[test]
    fn test_contributed_providers_hold_namespace() {
        let gen = generation([Some(Arc::new(SystemModule(counter(false)))), Some(Arc::new(ShellModule)), None]);
        gen.start(&env()).unwrap();
        let weak = gen.namespace_weak();
        let provider = gen.scope(Subsystem::Shell).unwrap().bindings()[0].provider.clone();

        gen.stop();
        drop(gen);
        assert!(weak.upgrade().is_some());
        assert!(provider.get().is_ok());

        drop(provider);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_configure_failure_is_start_failure() {
        let gen = generation([Some(Arc::new(Failing)), None, None]);
        let err = gen.start(&env()).unwrap_err();
        assert!(matches!(err, PluginError::StartFailure { ref plugin, .. } if plugin == "demo"));
        assert_eq!(gen.state(), PluginState::Failed);
    }

    #[test]
    fn test_listener_failure() {
        let c = counter(true);
        let gen = generation([Some(Arc::new(SystemModule(c.clone()))), None, None]);
        assert!(gen.start(&env()).is_err());
        assert_eq!(c.stops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stop_removes_handles_after_listeners() {
        let c = counter(false);
        let gen = generation([Some(Arc::new(SystemModule(c.clone()))), None, None]);
        gen.start(&env()).unwrap();

        let set = crate::extension::DynamicSet::new("t");
        let handle = set.add("demo", crate::extension::Key::of("t"), provider::instance(1u8));
        gen.add_handles([handle.clone() as Arc<dyn RegistrationHandle>]);

        gen.stop();
        assert_eq!(c.stops.load(Ordering::SeqCst), 1);
        assert!(!handle.is_active());
        assert!(set.is_empty());
        assert_eq!(gen.state(), PluginState::Stopped);

        // 重复停止无副作用
        gen.stop();
        assert_eq!(c.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_take_handles() {
        let gen = generation([None, None, None]);
        let set = crate::extension::DynamicSet::new("t");
        let a = set.add("demo", crate::extension::Key::of("t"), provider::instance(1u8));
        let b = set.add("demo", crate::extension::Key::of("t"), provider::instance(2u8));
        gen.add_handles([a.clone() as Arc<dyn RegistrationHandle>, b.clone() as Arc<dyn RegistrationHandle>]);

        let ids: HashSet<HandleId> = [a.id()].into_iter().collect();
        let taken = gen.take_handles(&ids);
        assert_eq!(taken.len(), 1);
        assert_eq!(gen.handles().len(), 1);

        gen.stop();
        assert!(a.is_active());
        assert!(!b.is_active());
    }
}
