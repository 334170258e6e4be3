//! 插件元数据定义
//!
//! 定义插件描述文件 (plugin.yaml) 中的数据结构、插件状态与对外的插件信息。

use crate::extension::Subsystem;
use chrono::{DateTime, Utc};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use crate::extension::ApiTier;

/// 描述文件名
pub const DESCRIPTOR_FILE: &str = "plugin.yaml";

/// 重载模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReloadMode {
    /// 可热替换（默认）
    #[default]
    Reload,
    /// 不可热替换：重载时先卸载旧一代再冷启动；必需插件需要重启宿主
    Restart,
}

/// 各子系统的模块引用（命名空间中的模块符号）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRefs {
    /// system 模块
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    /// shell 模块
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,

    /// web 模块
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web: Option<String>,
}

impl ModuleRefs {
    /// 获取指定子系统的模块引用
    pub fn get(&self, subsystem: Subsystem) -> Option<&str> {
        match subsystem {
            Subsystem::System => self.system.as_deref(),
            Subsystem::Shell => self.shell.as_deref(),
            Subsystem::Web => self.web.as_deref(),
        }
    }

    /// 设置指定子系统的模块引用
    pub fn set(&mut self, subsystem: Subsystem, symbol: impl Into<String>) {
        let slot = match subsystem {
            Subsystem::System => &mut self.system,
            Subsystem::Shell => &mut self.shell,
            Subsystem::Web => &mut self.web,
        };
        *slot = Some(symbol.into());
    }

    /// 是否没有声明任何模块
    pub fn is_empty(&self) -> bool {
        self.system.is_none() && self.shell.is_none() && self.web.is_none()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DependencySpec {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        version: Option<String>,
    },
}

/// 依赖声明
///
/// 描述文件中可以写成插件名字符串，或 `{ name, version }` 形式附带 semver 版本要求。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "DependencySpec")]
pub struct Dependency {
    /// 依赖插件名称
    pub name: String,

    /// 版本要求（semver 范围）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl From<DependencySpec> for Dependency {
    fn from(spec: DependencySpec) -> Self {
        match spec {
            DependencySpec::Name(name) => Dependency { name, version: None },
            DependencySpec::Detailed { name, version } => Dependency { name, version },
        }
    }
}

impl Dependency {
    /// 创建无版本要求的依赖
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    /// 附加版本要求
    pub fn with_version(mut self, req: impl Into<String>) -> Self {
        self.version = Some(req.into());
        self
    }

    /// 检查版本是否满足要求，无要求时总是满足
    pub fn version_matches(&self, version: &Version) -> bool {
        match self.version {
            Some(ref req) => VersionReq::parse(req)
                .map(|r| r.matches(version))
                .unwrap_or(false),
            None => true,
        }
    }
}

/// 符号库引用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LibraryRef {
    /// 宿主进程内注册的库
    Linked(String),
    /// 插件包内的原生动态库（相对路径）
    Native(PathBuf),
}

impl LibraryRef {
    /// 解析 `linked:<name>` 或 `native:<path>`
    pub fn parse(s: &str) -> Option<Self> {
        let (scheme, rest) = s.split_once(':')?;
        let rest = rest.trim();
        if rest.is_empty() {
            return None;
        }
        match scheme.trim() {
            "linked" => Some(LibraryRef::Linked(rest.to_string())),
            "native" => Some(LibraryRef::Native(PathBuf::from(rest))),
            _ => None,
        }
    }
}

fn default_version() -> String {
    "0.0.0".to_string()
}

/// 插件描述
///
/// 对应 plugin.yaml，解析后不可变。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// 插件名称（已加载插件中唯一）
    pub name: String,

    /// 插件版本（semver 格式）
    #[serde(default = "default_version")]
    pub version: String,

    /// 插件描述
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// 作者信息
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,

    /// API 信任层级
    #[serde(default)]
    pub api: ApiTier,

    /// 重载模式
    #[serde(default)]
    pub reload: ReloadMode,

    /// 各子系统的模块引用
    #[serde(default, skip_serializing_if = "ModuleRefs::is_empty")]
    pub modules: ModuleRefs,

    /// 依赖列表
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends: Vec<Dependency>,

    /// 单一依赖的简写形式
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency: Option<Dependency>,

    /// 符号库引用（`linked:<name>` 或 `native:<path>`）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library: Option<String>,
}

impl PluginDescriptor {
    /// 创建最小描述
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            author: String::new(),
            api: ApiTier::default(),
            reload: ReloadMode::default(),
            modules: ModuleRefs::default(),
            depends: vec![],
            dependency: None,
            library: None,
        }
    }

    /// 添加依赖
    pub fn with_dependency(mut self, dep: Dependency) -> Self {
        self.depends.push(dep);
        self
    }

    /// 设置子系统模块
    pub fn with_module(mut self, subsystem: Subsystem, symbol: impl Into<String>) -> Self {
        self.modules.set(subsystem, symbol);
        self
    }

    /// 设置符号库
    pub fn with_library(mut self, library: impl Into<String>) -> Self {
        self.library = Some(library.into());
        self
    }

    /// 设置信任层级
    pub fn with_api(mut self, api: ApiTier) -> Self {
        self.api = api;
        self
    }

    /// 设置重载模式
    pub fn with_reload(mut self, reload: ReloadMode) -> Self {
        self.reload = reload;
        self
    }

    /// 全部依赖（合并 `depends` 与 `dependency`）
    pub fn dependencies(&self) -> Vec<&Dependency> {
        self.depends.iter().chain(self.dependency.iter()).collect()
    }

    /// 依赖插件名称
    pub fn dependency_names(&self) -> Vec<&str> {
        self.dependencies().into_iter().map(|d| d.name.as_str()).collect()
    }

    /// 解析版本号
    pub fn parsed_version(&self) -> Option<Version> {
        Version::parse(&self.version).ok()
    }

    /// 解析符号库引用
    pub fn library_ref(&self) -> Option<LibraryRef> {
        self.library.as_deref().and_then(LibraryRef::parse)
    }

    /// 是否支持热替换
    pub fn can_reload(&self) -> bool {
        self.reload == ReloadMode::Reload
    }
}

/// 插件状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    /// 已发现插件包
    #[default]
    Discovered,
    /// 描述已解析
    Described,
    /// 描述解析失败（对该插件包是终态）
    FailedDescribe,
    /// 已排序
    Ordered,
    /// 已加载（命名空间与模块已就绪）
    Loaded,
    /// 正在启动
    Starting,
    /// 运行中
    Running,
    /// 正在重载
    Reloading,
    /// 正在停止
    Stopping,
    /// 已停止
    Stopped,
    /// 等待回收
    Cleaning,
    /// 已移除
    Removed,
    /// 已禁用
    Disabled,
    /// 失败
    Failed,
}

impl PluginState {
    /// 是否可以启动
    pub fn can_start(&self) -> bool {
        matches!(self, PluginState::Loaded)
    }

    /// 是否可以停止
    pub fn can_stop(&self) -> bool {
        matches!(
            self,
            PluginState::Running | PluginState::Starting | PluginState::Reloading | PluginState::Loaded
        )
    }

    /// 是否可以禁用
    pub fn can_disable(&self) -> bool {
        matches!(
            self,
            PluginState::Running | PluginState::Stopped | PluginState::Failed
        )
    }

    /// 是否可以启用
    pub fn can_enable(&self) -> bool {
        matches!(self, PluginState::Disabled)
    }

    /// 是否可以重载
    pub fn can_reload(&self) -> bool {
        matches!(self, PluginState::Running)
    }

    /// 是否已结束生命周期
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            PluginState::Stopped | PluginState::Cleaning | PluginState::Removed
        )
    }
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PluginState::Discovered => "discovered",
            PluginState::Described => "described",
            PluginState::FailedDescribe => "failed_describe",
            PluginState::Ordered => "ordered",
            PluginState::Loaded => "loaded",
            PluginState::Starting => "starting",
            PluginState::Running => "running",
            PluginState::Reloading => "reloading",
            PluginState::Stopping => "stopping",
            PluginState::Stopped => "stopped",
            PluginState::Cleaning => "cleaning",
            PluginState::Removed => "removed",
            PluginState::Disabled => "disabled",
            PluginState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// 插件信息（管理操作的返回值）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginInfo {
    /// 插件名称
    pub name: String,

    /// 插件版本
    pub version: String,

    /// 是否启用
    pub enabled: bool,

    /// 当前状态
    pub state: PluginState,

    /// 插件包路径
    pub source: PathBuf,

    /// 当前代标识
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<u64>,

    /// API 信任层级
    pub api: ApiTier,

    /// 重载模式
    pub reload: ReloadMode,

    /// 加载时间
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded_at: Option<DateTime<Utc>>,

    /// 启动时间
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// 最后错误信息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PluginInfo {
    /// 是否正在运行
    pub fn is_running(&self) -> bool {
        self.state == PluginState::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_defaults() {
        let desc: PluginDescriptor = serde_yaml::from_str("name: hello\n").unwrap();
        assert_eq!(desc.name, "hello");
        assert_eq!(desc.version, "0.0.0");
        assert_eq!(desc.api, ApiTier::Plugin);
        assert_eq!(desc.reload, ReloadMode::Reload);
        assert!(desc.modules.is_empty());
        assert!(desc.dependencies().is_empty());
        assert!(desc.can_reload());
    }

    #[test]
    fn test_dependency_forms() {
        let yaml = r#"
name: reviewers
version: 1.2.0
depends:
  - accounts
  - name: audit
    version: ">=2.0"
dependency: groups
"#;
        let desc: PluginDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(desc.dependency_names(), vec!["accounts", "audit", "groups"]);

        let audit = &desc.depends[1];
        assert!(audit.version_matches(&Version::new(2, 1, 0)));
        assert!(!audit.version_matches(&Version::new(1, 9, 0)));
        assert!(desc.depends[0].version_matches(&Version::new(0, 1, 0)));
    }

    #[test]
    fn test_module_refs() {
        let yaml = r#"
name: hello
modules:
  system: hello_module
  shell: hello_commands
reload: restart
api: extension
"#;
        let desc: PluginDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(desc.modules.get(Subsystem::System), Some("hello_module"));
        assert_eq!(desc.modules.get(Subsystem::Shell), Some("hello_commands"));
        assert_eq!(desc.modules.get(Subsystem::Web), None);
        assert_eq!(desc.api, ApiTier::Extension);
        assert!(!desc.can_reload());
    }

    #[test]
    fn test_library_ref() {
        assert_eq!(
            LibraryRef::parse("linked:hello"),
            Some(LibraryRef::Linked("hello".to_string()))
        );
        assert_eq!(
            LibraryRef::parse("native:lib/libhello.so"),
            Some(LibraryRef::Native(PathBuf::from("lib/libhello.so")))
        );
        assert_eq!(LibraryRef::parse("jar:x"), None);
        assert_eq!(LibraryRef::parse("linked:"), None);
        assert_eq!(LibraryRef::parse("hello"), None);
    }

    #[test]
    fn test_state_transitions() {
        assert!(PluginState::Loaded.can_start());
        assert!(!PluginState::Running.can_start());
        assert!(PluginState::Running.can_stop());
        assert!(PluginState::Running.can_disable());
        assert!(PluginState::Stopped.can_disable());
        assert!(!PluginState::Disabled.can_disable());
        assert!(PluginState::Disabled.can_enable());
        assert!(PluginState::Running.can_reload());
        assert!(PluginState::Cleaning.is_finished());
    }

    #[test]
    fn test_descriptor_roundtrip_serialization() {
        let desc = PluginDescriptor::new("hello", "1.0.0")
            .with_dependency(Dependency::new("accounts").with_version("^1"))
            .with_module(Subsystem::Web, "hello_web")
            .with_library("linked:hello");
        let yaml = serde_yaml::to_string(&desc).unwrap();
        let parsed: PluginDescriptor = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, desc);
    }
}
