//! 插件环境
//!
//! 把一代插件的作用域绑定附加到宿主动态集合，并在热重载时与上一代的句柄对账。
//! 宿主事件监听器在插件启动、重载、停止时收到通知。

use super::generation::LoadedPlugin;
use super::metadata::PluginInfo;
use crate::extension::{
    Binding, CallbackHandle, CollectionKind, DynamicItem, DynamicMap, DynamicSet, HandleId,
    HostEnvironment, Key, NamedProvider, RegistrationHandle, ReloadableHandle, Subsystem, TypeToken,
};
use crate::utils::{PluginError, Result};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// 宿主事件监听器
pub trait PluginEventListener: Send + Sync {
    /// 插件启动完成
    fn on_start_plugin(&self, _plugin: &PluginInfo) {}

    /// 插件被新一代替换
    fn on_reload_plugin(&self, _old: &PluginInfo, _new: &PluginInfo) {}

    /// 插件停止
    fn on_stop_plugin(&self, _plugin: &PluginInfo) {}
}

/// 绑定的目标集合
#[derive(Clone, Copy)]
enum Target<'a> {
    Map(&'a DynamicMap),
    Set(&'a DynamicSet),
    Item(&'a DynamicItem),
}

impl Target<'_> {
    fn kind(&self) -> CollectionKind {
        match self {
            Target::Map(_) => CollectionKind::Map,
            Target::Set(_) => CollectionKind::Set,
            Target::Item(_) => CollectionKind::Item,
        }
    }

    fn token(&self) -> &TypeToken {
        match self {
            Target::Map(m) => m.token(),
            Target::Set(s) => s.token(),
            Target::Item(i) => i.token(),
        }
    }

    // 附加顺序：映射 → 集合 → 单项
    fn order(&self) -> u8 {
        match self {
            Target::Map(_) => 0,
            Target::Set(_) => 1,
            Target::Item(_) => 2,
        }
    }

    fn attach(&self, plugin: &str, binding: &Binding) -> Result<Arc<dyn RegistrationHandle>> {
        let handle: Arc<dyn RegistrationHandle> = match self {
            Target::Map(map) => {
                let export = export_name(plugin, binding)?;
                map.put(plugin, export, binding.provider.clone())? as Arc<dyn RegistrationHandle>
            }
            Target::Set(set) => {
                set.add(plugin, binding.key.clone(), binding.provider.clone()) as Arc<dyn RegistrationHandle>
            }
            Target::Item(item) => {
                item.set(plugin, binding.key.clone(), binding.provider.clone())? as Arc<dyn RegistrationHandle>
            }
        };
        Ok(handle)
    }
}

fn export_name<'b>(plugin: &str, binding: &'b Binding) -> Result<&'b str> {
    binding.key.name().ok_or_else(|| {
        PluginError::invalid_package(
            plugin,
            format!("绑定 '{}' 注册到映射需要导出名", binding.key),
        )
    })
}

/// 对账步骤
enum Step<'a> {
    Replace {
        handle: Arc<dyn RegistrationHandle>,
        target: Target<'a>,
        binding: Binding,
    },
    Add {
        target: Target<'a>,
        binding: Binding,
    },
}

/// 插件环境
pub struct PluginEnvironment {
    host: Arc<HostEnvironment>,
    listeners: RwLock<Vec<Arc<dyn PluginEventListener>>>,
}

impl PluginEnvironment {
    /// 创建插件环境
    pub fn new(host: Arc<HostEnvironment>) -> Self {
        Self {
            host,
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// 宿主环境
    pub fn host(&self) -> &Arc<HostEnvironment> {
        &self.host
    }

    // ==================== 事件监听 ====================

    /// 注册宿主事件监听器
    ///
    /// # Returns
    ///
    /// 撤销该监听器的句柄
    pub fn add_listener(self: &Arc<Self>, listener: Arc<dyn PluginEventListener>) -> Arc<CallbackHandle> {
        self.listeners.write().push(listener.clone());
        let env = Arc::downgrade(self);
        CallbackHandle::new(move || {
            if let Some(env) = env.upgrade() {
                env.listeners.write().retain(|l| !Arc::ptr_eq(l, &listener));
            }
        })
    }

    fn listeners(&self) -> Vec<Arc<dyn PluginEventListener>> {
        self.listeners.read().clone()
    }

    /// 通知插件启动
    pub fn notify_start(&self, plugin: &PluginInfo) {
        for l in self.listeners() {
            l.on_start_plugin(plugin);
        }
    }

    /// 通知插件重载
    pub fn notify_reload(&self, old: &PluginInfo, new: &PluginInfo) {
        for l in self.listeners() {
            l.on_reload_plugin(old, new);
        }
    }

    /// 通知插件停止
    pub fn notify_stop(&self, plugin: &PluginInfo) {
        for l in self.listeners() {
            l.on_stop_plugin(plugin);
        }
    }

    // ==================== 附加 ====================

    /// 查找绑定对应的宿主集合：先查绑定所在子系统，再查 system
    fn target(&self, subsystem: Subsystem, token: &TypeToken) -> Option<Target<'_>> {
        let mut scopes = vec![subsystem];
        if subsystem != Subsystem::System {
            scopes.push(Subsystem::System);
        }
        scopes.into_iter().find_map(|s| {
            let scope = self.host.scope(s)?;
            match scope.kind_of(token)? {
                CollectionKind::Map => scope.map(token).map(Target::Map),
                CollectionKind::Set => scope.set(token).map(Target::Set),
                CollectionKind::Item => scope.item(token).map(Target::Item),
            }
        })
    }

    /// 一代插件中所有指向宿主扩展点的绑定，按附加顺序排列
    fn bindings(&self, gen: &LoadedPlugin) -> Vec<(Target<'_>, Binding)> {
        let mut found = Vec::new();
        for scope in gen.scopes() {
            for binding in scope.bindings() {
                if let Some(target) = self.target(scope.subsystem(), &binding.key.token) {
                    found.push((target, binding.clone()));
                }
            }
        }
        found.sort_by_key(|(t, _)| t.order());
        found
    }

    /// 附加一代插件的绑定
    ///
    /// 任一绑定失败时撤销已附加的绑定，注册表恢复原状。
    ///
    /// # Errors
    ///
    /// - 映射绑定缺少导出名：`InvalidPackage`
    /// - 映射键已被占用：`DuplicateKey`
    /// - 最终项已由其他插件提供：`DuplicateBinding`
    pub fn attach(&self, gen: &LoadedPlugin) -> Result<()> {
        let plugin = gen.name();
        let mut added: Vec<Arc<dyn RegistrationHandle>> = Vec::new();

        for (target, binding) in self.bindings(gen) {
            match target.attach(plugin, &binding) {
                Ok(handle) => added.push(handle),
                Err(e) => {
                    for handle in &added {
                        handle.remove();
                    }
                    return Err(e);
                }
            }
        }

        debug!(plugin = %plugin, generation = %gen.id(), bindings = added.len(), "绑定已附加");
        gen.add_handles(added);
        Ok(())
    }

    /// 以新一代替换旧一代的绑定
    ///
    /// 新绑定按限定符与旧句柄匹配：匹配成功的句柄原地替换提供者并转交给新一代；
    /// 未匹配的新绑定直接添加；未匹配的旧句柄留在旧一代，随旧一代停止而撤销。
    /// 先完成全部校验再修改注册表，校验失败时注册表不变。
    ///
    /// # Errors
    ///
    /// 同 [`attach`](Self::attach)
    pub fn reattach(&self, old: &LoadedPlugin, new: &LoadedPlugin) -> Result<()> {
        let steps = self.plan(old, new)?;
        self.apply(old, new, steps)
    }

    /// 按计划执行替换与添加；任何一步失败都恢复到执行前的注册状态
    fn apply(&self, old: &LoadedPlugin, new: &LoadedPlugin, steps: Vec<Step<'_>>) -> Result<()> {
        let plugin = new.name();
        let mut moved: HashSet<HandleId> = HashSet::new();
        let mut added: Vec<Arc<dyn RegistrationHandle>> = Vec::new();
        let mut previous: Vec<(Arc<dyn RegistrationHandle>, Arc<NamedProvider>)> = Vec::new();
        let mut replaced = 0usize;

        for step in steps {
            let (target, binding) = match step {
                Step::Replace {
                    handle,
                    target,
                    binding,
                } => {
                    let swapped = handle.as_reloadable().and_then(|r| {
                        let current = r.current()?;
                        let key = retained_key(&r.key(), &binding.key);
                        r.replace(key, binding.provider.clone()).then_some(current)
                    });
                    if let Some(current) = swapped {
                        moved.insert(handle.id());
                        previous.push((handle, current));
                        replaced += 1;
                        continue;
                    }
                    // 旧句柄已失效，退化为添加
                    (target, binding)
                }
                Step::Add { target, binding } => (target, binding),
            };

            match target.attach(plugin, &binding) {
                Ok(handle) => added.push(handle),
                Err(e) => {
                    for handle in &added {
                        handle.remove();
                    }
                    // 已替换的句柄恢复为旧一代的提供者
                    for (handle, entry) in previous.iter().rev() {
                        if let Some(r) = handle.as_reloadable() {
                            r.replace(entry.key().clone(), entry.provider().clone());
                        }
                    }
                    warn!(plugin = %plugin, restored = previous.len(), "重载附加失败，已恢复旧一代的绑定: {}", e);
                    return Err(e);
                }
            }
        }

        let taken = old.take_handles(&moved);
        debug!(
            plugin = %plugin,
            old = %old.id(),
            new = %new.id(),
            replaced,
            added = added.len(),
            "绑定已对账"
        );
        new.add_handles(taken.into_iter().chain(added));
        Ok(())
    }

    fn plan<'a>(&'a self, old: &LoadedPlugin, new: &LoadedPlugin) -> Result<Vec<Step<'a>>> {
        let plugin = new.name();
        let mut pool: Vec<Option<Arc<dyn RegistrationHandle>>> = old
            .handles()
            .into_iter()
            .filter(|h| h.is_active() && h.as_reloadable().is_some())
            .map(Some)
            .collect();

        let bindings = self.bindings(new);
        let mut matched: Vec<Option<Arc<dyn RegistrationHandle>>> = vec![None; bindings.len()];

        // 第一轮：映射按导出名、集合按命名限定符、单项按令牌
        for (i, (target, binding)) in bindings.iter().enumerate() {
            let name = match target {
                Target::Map(_) => Some(export_name(plugin, binding)?),
                Target::Set(_) => binding.key.name(),
                Target::Item(_) => None,
            };
            if target.kind() == CollectionKind::Set && name.is_none() {
                continue;
            }
            matched[i] = take_from(&mut pool, |r| {
                r.kind() == target.kind()
                    && &r.token() == target.token()
                    && (target.kind() == CollectionKind::Item || r.key().name() == name)
            });
        }

        // 第二轮：未命名的集合绑定复用剩余的未命名旧句柄
        for (i, (target, binding)) in bindings.iter().enumerate() {
            if matched[i].is_some() || target.kind() != CollectionKind::Set || binding.key.name().is_some() {
                continue;
            }
            matched[i] = take_from(&mut pool, |r| {
                r.kind() == CollectionKind::Set && &r.token() == target.token() && r.key().name().is_none()
            });
        }

        // 校验未匹配的新绑定
        let mut exports: HashSet<(TypeToken, String)> = HashSet::new();
        for (i, (target, binding)) in bindings.iter().enumerate() {
            if matched[i].is_some() {
                continue;
            }
            match target {
                Target::Map(map) => {
                    let export = export_name(plugin, binding)?;
                    map.check_available(plugin, export)?;
                    if !exports.insert((map.token().clone(), export.to_string())) {
                        return Err(PluginError::DuplicateKey {
                            collection: map.token().to_string(),
                            key: export.to_string(),
                        });
                    }
                }
                Target::Item(item) if item.is_final() => {
                    if let Some(holder) = item.holder().filter(|h| h != plugin) {
                        return Err(PluginError::DuplicateBinding {
                            collection: item.token().to_string(),
                            holder,
                        });
                    }
                }
                _ => {}
            }
        }

        Ok(bindings
            .into_iter()
            .zip(matched)
            .map(|((target, binding), handle)| match handle {
                Some(handle) => Step::Replace {
                    handle,
                    target,
                    binding,
                },
                None => Step::Add { target, binding },
            })
            .collect())
    }
}

fn take_from(
    pool: &mut [Option<Arc<dyn RegistrationHandle>>],
    pred: impl Fn(&dyn ReloadableHandle) -> bool,
) -> Option<Arc<dyn RegistrationHandle>> {
    let pos = pool.iter().position(|slot| {
        matches!(slot.as_ref().and_then(|h| h.as_reloadable()), Some(r) if pred(r))
    })?;
    pool[pos].take()
}

/// 替换后的键：新旧都是自动生成的唯一限定符时保留旧键
fn retained_key(old: &Key, new: &Key) -> Key {
    let both_unique = old.qualifier.as_ref().is_some_and(|q| q.is_unique())
        && new.qualifier.as_ref().is_some_and(|q| q.is_unique());
    if both_unique && old.token == new.token {
        old.clone()
    } else {
        new.clone()
    }
}

impl std::fmt::Debug for PluginEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginEnvironment")
            .field("host", &self.host)
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::{Binder, HostScope, PluginModule, SHELL_COMMAND};
    use crate::plugin::generation::GenerationId;
    use crate::plugin::loader::LoadedModules;
    use crate::plugin::metadata::PluginDescriptor;
    use crate::plugin::package::Fingerprint;
    use crate::plugin::runtime::PluginNamespace;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const LISTENERS: &str = "demo.Listener";
    const VALIDATORS: &str = "demo.Validator";
    const DEFAULT_THEME: &str = "demo.Theme";

    /// 按 (令牌, 限定符, 值) 声明绑定的模块
    struct Declared(Vec<(&'static str, Option<&'static str>, &'static str)>);

    impl PluginModule for Declared {
        fn configure(&self, binder: &mut Binder) -> anyhow::Result<()> {
            for (token, name, value) in &self.0 {
                let b = binder.bind(*token);
                let b = match name {
                    Some(n) => b.named(*n),
                    None => b,
                };
                b.to_instance(value.to_string());
            }
            Ok(())
        }
    }

    fn host() -> Arc<HostEnvironment> {
        Arc::new(
            HostEnvironment::builder()
                .system(
                    HostScope::builder(Subsystem::System)
                        .set(LISTENERS)
                        .map(VALIDATORS)
                        .item(DEFAULT_THEME),
                )
                .shell(HostScope::builder(Subsystem::Shell))
                .build(),
        )
    }

    fn started(
        env: &HostEnvironment,
        name: &str,
        id: u64,
        system: Vec<(&'static str, Option<&'static str>, &'static str)>,
        shell: Vec<(&'static str, Option<&'static str>, &'static str)>,
    ) -> LoadedPlugin {
        let shell_module: Option<Arc<dyn PluginModule>> = if shell.is_empty() {
            None
        } else {
            Some(Arc::new(Declared(shell)))
        };
        let gen = LoadedPlugin::new(
            GenerationId::new(id),
            PluginDescriptor::new(name, "1.0.0"),
            PathBuf::from(format!("/plugins/{}", name)),
            Fingerprint::default(),
            Path::new("/data"),
            LoadedModules {
                namespace: PluginNamespace::new(name, id, None, vec![]),
                modules: [Some(Arc::new(Declared(system))), shell_module, None],
            },
        );
        gen.start(env).unwrap();
        gen
    }

    fn values(set: &DynamicSet) -> Vec<String> {
        let mut v: Vec<String> = set
            .get_all_as::<String>()
            .iter()
            .map(|s| s.to_string())
            .collect();
        v.sort();
        v
    }

    #[test]
    fn test_attach_and_stop() {
        let host = host();
        let env = PluginEnvironment::new(host.clone());
        let gen = started(
            &host,
            "demo",
            1,
            vec![
                (LISTENERS, Some("a"), "A"),
                (VALIDATORS, Some("strict"), "S"),
                (DEFAULT_THEME, None, "dark"),
                ("demo.Internal", None, "ignored"),
            ],
            vec![(SHELL_COMMAND, Some("greet"), "G")],
        );
        env.attach(&gen).unwrap();
        assert_eq!(gen.handles().len(), 4);

        let set = host.set(LISTENERS).unwrap();
        assert_eq!(values(&set), vec!["A"]);
        assert!(host.map(VALIDATORS).unwrap().get("demo", "strict").is_some());
        assert!(host.map(SHELL_COMMAND).unwrap().lookup("greet").is_some());
        assert_eq!(host.item(DEFAULT_THEME).unwrap().holder().as_deref(), Some("demo"));

        gen.stop();
        assert!(set.is_empty());
        assert!(host.map(VALIDATORS).unwrap().is_empty());
        assert!(host.item(DEFAULT_THEME).unwrap().holder().is_none());
    }

    #[test]
    fn test_duplicate_global_key_rolls_back() {
        let host = host();
        let env = PluginEnvironment::new(host.clone());
        let x = started(&host, "x", 1, vec![], vec![(SHELL_COMMAND, Some("alpha"), "X")]);
        env.attach(&x).unwrap();

        let y = started(
            &host,
            "y",
            2,
            vec![(LISTENERS, None, "Y")],
            vec![(SHELL_COMMAND, Some("alpha"), "Y")],
        );
        let err = env.attach(&y).unwrap_err();
        assert!(matches!(err, PluginError::DuplicateKey { .. }));
        assert!(y.handles().is_empty());

        let commands = host.map(SHELL_COMMAND).unwrap();
        assert_eq!(commands.lookup("alpha").unwrap().plugin_name(), "x");
        assert!(host.set(LISTENERS).unwrap().is_empty());
    }

    #[test]
    fn test_map_binding_requires_export_name() {
        let host = host();
        let env = PluginEnvironment::new(host.clone());
        let gen = started(&host, "demo", 1, vec![(VALIDATORS, None, "S")], vec![]);
        let err = env.attach(&gen).unwrap_err();
        assert!(matches!(err, PluginError::InvalidPackage { .. }));
    }

    #[test]
    fn test_reattach_matches_by_qualifier() {
        let host = host();
        let env = PluginEnvironment::new(host.clone());
        let old = started(
            &host,
            "demo",
            1,
            vec![(LISTENERS, Some("x"), "A"), (LISTENERS, Some("y"), "B")],
            vec![],
        );
        env.attach(&old).unwrap();
        let old_handles = old.handles();
        let a_id = old_handles
            .iter()
            .find(|h| h.as_reloadable().unwrap().key().name() == Some("x"))
            .unwrap()
            .id();

        let new = started(
            &host,
            "demo",
            2,
            vec![(LISTENERS, Some("x"), "A2"), (LISTENERS, Some("z"), "C")],
            vec![],
        );
        env.reattach(&old, &new).unwrap();

        let set = host.set(LISTENERS).unwrap();
        // B@y 在旧一代停止前保留
        assert_eq!(values(&set), vec!["A2", "B", "C"]);
        assert!(new.handles().iter().any(|h| h.id() == a_id));
        assert_eq!(old.handles().len(), 1);

        old.stop();
        assert_eq!(values(&set), vec!["A2", "C"]);
        let keys: HashSet<String> = set
            .snapshot()
            .iter()
            .filter_map(|p| p.key().name().map(str::to_string))
            .collect();
        assert_eq!(keys, ["x", "z"].iter().map(|s| s.to_string()).collect());
    }

    #[test]
    fn test_reattach_unchanged_is_idempotent() {
        let host = host();
        let env = PluginEnvironment::new(host.clone());
        let decl = vec![
            (LISTENERS, None, "L"),
            (VALIDATORS, Some("strict"), "S"),
            (DEFAULT_THEME, None, "dark"),
        ];
        let old = started(&host, "demo", 1, decl.clone(), vec![]);
        env.attach(&old).unwrap();
        let before: Vec<String> = host
            .set(LISTENERS)
            .unwrap()
            .snapshot()
            .iter()
            .map(|p| p.key().to_string())
            .collect();
        let ids: HashSet<HandleId> = old.handles().iter().map(|h| h.id()).collect();

        let new = started(&host, "demo", 2, decl, vec![]);
        env.reattach(&old, &new).unwrap();
        old.stop();

        let after: Vec<String> = host
            .set(LISTENERS)
            .unwrap()
            .snapshot()
            .iter()
            .map(|p| p.key().to_string())
            .collect();
        assert_eq!(before, after);
        let new_ids: HashSet<HandleId> = new.handles().iter().map(|h| h.id()).collect();
        assert_eq!(ids, new_ids);
        assert_eq!(host.map(VALIDATORS).unwrap().len(), 1);
        assert_eq!(host.item(DEFAULT_THEME).unwrap().holder().as_deref(), Some("demo"));
    }

    #[test]
    fn test_reattach_conflict_leaves_registry_untouched() {
        let host = host();
        let env = PluginEnvironment::new(host.clone());
        let other = started(&host, "other", 1, vec![], vec![(SHELL_COMMAND, Some("beta"), "O")]);
        env.attach(&other).unwrap();

        let old = started(&host, "demo", 2, vec![(LISTENERS, Some("x"), "A")], vec![]);
        env.attach(&old).unwrap();
        let new = started(
            &host,
            "demo",
            3,
            vec![(LISTENERS, Some("x"), "A2")],
            vec![(SHELL_COMMAND, Some("beta"), "D")],
        );
        assert!(env.reattach(&old, &new).is_err());
        assert_eq!(values(&host.set(LISTENERS).unwrap()), vec!["A"]);
        assert_eq!(old.handles().len(), 1);
        assert!(new.handles().is_empty());
    }

    #[test]
    fn test_late_attach_failure_restores_replaced_handles() {
        let host = host();
        let env = PluginEnvironment::new(host.clone());
        let old = started(&host, "demo", 1, vec![(LISTENERS, Some("x"), "A")], vec![]);
        env.attach(&old).unwrap();

        let new = started(
            &host,
            "demo",
            2,
            vec![(LISTENERS, Some("x"), "A2"), (VALIDATORS, Some("strict"), "S")],
            vec![],
        );
        let steps = env.plan(&old, &new).unwrap();

        // 计划之后其他注册抢先占用了导出名
        let validators = host.map(VALIDATORS).unwrap();
        let _taken = validators
            .put("demo", "strict", crate::extension::provider::instance("other".to_string()))
            .unwrap();

        let err = env.apply(&old, &new, steps).unwrap_err();
        assert!(matches!(err, PluginError::DuplicateKey { .. }));

        let set = host.set(LISTENERS).unwrap();
        assert_eq!(values(&set), vec!["A"]);
        assert_eq!(set.snapshot()[0].key().name(), Some("x"));
        assert_eq!(old.handles().len(), 1);
        assert!(new.handles().is_empty());
        assert_eq!(validators.len(), 1);

        // 旧一代的句柄仍然有效
        old.stop();
        assert!(set.is_empty());
    }

    struct Events(AtomicUsize);

    impl PluginEventListener for Events {
        fn on_start_plugin(&self, _plugin: &PluginInfo) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_event_listener_registration() {
        let env = Arc::new(PluginEnvironment::new(host()));
        let events = Arc::new(Events(AtomicUsize::new(0)));
        let handle = env.add_listener(events.clone());
        let info = PluginInfo::default();

        env.notify_start(&info);
        handle.remove();
        env.notify_start(&info);
        assert_eq!(events.0.load(Ordering::SeqCst), 1);
    }
}
