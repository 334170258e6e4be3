//! 自动注册扫描器
//!
//! 插件包没有为某个子系统声明模块时，扫描 `units/*.yaml` 中的代码单元声明，
//! 找出带导出名或监听标记的单元，沿 `extends` / `implements` 链查找宿主扩展点，
//! 再为对应子系统合成模块。扫描只读取声明，不执行插件代码；
//! 单元实现按单元名从命名空间延迟解析。

use super::package::RawUnit;
use super::runtime::PluginNamespace;
use crate::extension::{
    Binder, CollectionKind, HostEnvironment, PluginModule, Subsystem, TypeToken, SHELL_COMMAND,
    WEB_SERVLET,
};
use crate::utils::{PluginError, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// 代码单元声明
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CodeUnit {
    /// 单元名称（同时是实现的符号名）
    pub name: String,

    /// 父单元或宿主接口
    #[serde(default)]
    pub extends: Option<String>,

    /// 实现的接口
    #[serde(default)]
    pub implements: Vec<String>,

    /// 导出名
    #[serde(default)]
    pub export: Option<String>,

    /// 监听标记
    #[serde(default)]
    pub listen: bool,
}

impl CodeUnit {
    fn parents(&self) -> impl Iterator<Item = &str> {
        self.extends
            .iter()
            .chain(self.implements.iter())
            .map(String::as_str)
    }
}

/// 扫描命中：一个单元对一个扩展点的贡献
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    /// 单元名称
    pub unit: String,
    /// 目标子系统
    pub subsystem: Subsystem,
    /// 扩展点令牌
    pub token: TypeToken,
    /// 集合类型
    pub kind: CollectionKind,
    /// 导出名
    pub export: Option<String>,
}

/// 扫描结果
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    entries: Vec<ScanEntry>,
    skipped: Vec<String>,
}

impl ScanResult {
    /// 全部命中
    pub fn entries(&self) -> &[ScanEntry] {
        &self.entries
    }

    /// 被跳过的单元文件
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    /// 某个子系统的命中
    pub fn for_subsystem(&self, subsystem: Subsystem) -> Vec<ScanEntry> {
        self.entries
            .iter()
            .filter(|e| e.subsystem == subsystem)
            .cloned()
            .collect()
    }

    /// 是否没有命中
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 自动注册扫描器
pub struct AutoRegistrationScanner<'a> {
    env: &'a HostEnvironment,
    max_unit_size: u64,
}

impl<'a> AutoRegistrationScanner<'a> {
    /// 创建扫描器
    ///
    /// # Arguments
    ///
    /// * `env` - 宿主环境（扩展点与接口层级）
    /// * `max_unit_size` - 单个代码单元的大小上限
    pub fn new(env: &'a HostEnvironment, max_unit_size: u64) -> Self {
        Self { env, max_unit_size }
    }

    /// 解析代码单元，格式错误或超限的单元记录警告后跳过
    pub fn parse_units(&self, plugin: &str, raw: &[RawUnit]) -> (Vec<CodeUnit>, Vec<String>) {
        let mut units = Vec::new();
        let mut skipped = Vec::new();
        for r in raw {
            if r.is_oversized(self.max_unit_size) {
                warn!(
                    plugin = %plugin,
                    unit = %r.file,
                    size = r.size,
                    limit = self.max_unit_size,
                    "代码单元超过大小上限，已跳过"
                );
                skipped.push(r.file.clone());
                continue;
            }
            match serde_yaml::from_slice::<CodeUnit>(&r.content) {
                Ok(unit) if !unit.name.is_empty() => units.push(unit),
                Ok(_) => {
                    warn!(plugin = %plugin, unit = %r.file, "代码单元缺少名称，已跳过");
                    skipped.push(r.file.clone());
                }
                Err(e) => {
                    warn!(plugin = %plugin, unit = %r.file, "代码单元格式错误，已跳过: {}", e);
                    skipped.push(r.file.clone());
                }
            }
        }
        (units, skipped)
    }

    /// 扫描插件包的代码单元
    ///
    /// # Errors
    ///
    /// 以下情况返回 `InvalidPackage`，错误中指明单元名：
    /// - 导出命令或处理器，但宿主没有对应子系统
    /// - 映射类扩展点没有导出名
    /// - 标记了监听但没有实现任何扩展点
    /// - 导出了名称但没有实现任何扩展点
    pub fn scan(&self, plugin: &str, raw: &[RawUnit]) -> Result<ScanResult> {
        let (units, skipped) = self.parse_units(plugin, raw);
        let by_name: HashMap<&str, &CodeUnit> =
            units.iter().map(|u| (u.name.as_str(), u)).collect();

        let mut result = ScanResult {
            entries: Vec::new(),
            skipped,
        };

        for unit in &units {
            if unit.export.is_none() && !unit.listen {
                continue;
            }

            let ancestry = self.ancestry(unit, &by_name);
            let mut hits = 0;

            for (marker, subsystem, what) in [
                (SHELL_COMMAND, Subsystem::Shell, "shell 命令"),
                (WEB_SERVLET, Subsystem::Web, "Web 处理器"),
            ] {
                if ancestry.contains(&TypeToken::new(marker)) && !self.env.has_subsystem(subsystem) {
                    return Err(PluginError::invalid_package(
                        plugin,
                        format!("宿主不接受{}: 单元 '{}'", what, unit.name),
                    ));
                }
            }

            for token in &ancestry {
                let Some((subsystem, kind)) = self.env.extension_point(token) else {
                    continue;
                };
                if kind == CollectionKind::Map && unit.export.is_none() {
                    return Err(PluginError::invalid_package(
                        plugin,
                        format!("单元 '{}' 注册到映射 '{}' 需要导出名", unit.name, token),
                    ));
                }
                hits += 1;
                result.entries.push(ScanEntry {
                    unit: unit.name.clone(),
                    subsystem,
                    token: token.clone(),
                    kind,
                    export: unit.export.clone(),
                });
            }

            if hits == 0 {
                let reason = if unit.listen {
                    format!("单元 '{}' 标记了监听，但没有实现任何扩展点", unit.name)
                } else {
                    format!(
                        "单元 '{}' 导出了 '{}'，但没有实现任何扩展点",
                        unit.name,
                        unit.export.as_deref().unwrap_or_default()
                    )
                };
                return Err(PluginError::invalid_package(plugin, reason));
            }
        }

        debug!(plugin = %plugin, hits = result.entries.len(), skipped = result.skipped.len(), "代码单元扫描完成");
        Ok(result)
    }

    /// 单元的全部祖先令牌（广度优先，按首次出现排序）
    fn ancestry(&self, unit: &CodeUnit, by_name: &HashMap<&str, &CodeUnit>) -> Vec<TypeToken> {
        let mut seen: HashSet<TypeToken> = HashSet::new();
        let mut ordered = Vec::new();
        let mut queue: VecDeque<TypeToken> = unit.parents().map(TypeToken::new).collect();

        while let Some(token) = queue.pop_front() {
            if !seen.insert(token.clone()) {
                continue;
            }
            ordered.push(token.clone());

            if let Some(parent_unit) = by_name.get(token.name()) {
                queue.extend(parent_unit.parents().map(TypeToken::new));
            }
            queue.extend(self.env.interface_parents(&token).iter().cloned());
        }
        ordered
    }
}

/// 合成的子系统模块
///
/// 为每个命中声明一个绑定，提供者按单元名从命名空间延迟解析实现。
pub struct ScannedModule {
    entries: Vec<ScanEntry>,
    namespace: Arc<PluginNamespace>,
}

impl ScannedModule {
    /// 为子系统合成模块，没有命中时返回 None
    pub fn synthesize(
        result: &ScanResult,
        subsystem: Subsystem,
        namespace: &Arc<PluginNamespace>,
    ) -> Option<Arc<dyn PluginModule>> {
        let entries = result.for_subsystem(subsystem);
        if entries.is_empty() {
            return None;
        }
        Some(Arc::new(ScannedModule {
            entries,
            namespace: namespace.clone(),
        }))
    }
}

impl PluginModule for ScannedModule {
    fn configure(&self, binder: &mut Binder) -> anyhow::Result<()> {
        for entry in &self.entries {
            let provider = self.namespace.provider(&entry.unit);
            let builder = binder.bind(entry.token.clone());
            match entry.export {
                Some(ref export) => builder.named(export.clone()).to_provider(provider),
                None => builder.to_provider(provider),
            }
        }
        Ok(())
    }
}
