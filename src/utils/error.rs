//! 插件运行时错误类型定义
//!
//! 本模块定义了运行时中使用的所有错误类型，以及面向管理前端的错误码与状态码映射。

use thiserror::Error;

/// 插件运行时错误类型
#[derive(Error, Debug)]
pub enum PluginError {
    // ==================== 插件包错误 ====================
    /// 插件包无效（描述文件格式错误、禁止的子系统组合、代码单元超限等）
    #[error("插件包无效: '{plugin}' - {reason}")]
    InvalidPackage {
        /// 插件名称
        plugin: String,
        /// 诊断信息
        reason: String,
    },

    /// 不支持的插件包格式
    #[error("不支持的插件包格式: {0}")]
    UnsupportedPackage(String),

    /// 符号未找到
    #[error("插件 '{plugin}' 的命名空间中未找到符号 '{symbol}'")]
    SymbolNotFound {
        /// 插件名称
        plugin: String,
        /// 符号名称
        symbol: String,
    },

    /// 原生库 ABI 版本不匹配
    #[error("原生库 '{library}' ABI 版本不匹配: 需要 {expected}, 实际为 {found}")]
    AbiMismatch {
        /// 库路径或名称
        library: String,
        /// 期望的 ABI 版本
        expected: u32,
        /// 实际的 ABI 版本
        found: u32,
    },

    // ==================== 依赖解析错误 ====================
    /// 依赖插件不存在
    #[error("插件 '{plugin}' 依赖的插件 '{dependency}' 不存在")]
    MissingDependency {
        /// 依赖方
        plugin: String,
        /// 缺失的依赖
        dependency: String,
    },

    /// 依赖版本不兼容
    #[error("版本不匹配: 插件 '{plugin}' 需要 '{dependency}' 版本 {required}, 但找到版本 {found}")]
    IncompatibleDependency {
        /// 依赖方
        plugin: String,
        /// 依赖名称
        dependency: String,
        /// 版本要求
        required: String,
        /// 实际版本
        found: String,
    },

    /// 循环依赖
    #[error("检测到循环依赖，涉及插件 '{0}'")]
    CyclicDependency(String),

    // ==================== 生命周期错误 ====================
    /// 安装失败
    #[error("插件安装失败: '{plugin}' - {reason}")]
    InstallFailure {
        /// 插件名称
        plugin: String,
        /// 诊断信息
        reason: String,
    },

    /// 启动失败
    #[error("插件启动失败: '{plugin}' - {reason}")]
    StartFailure {
        /// 插件名称
        plugin: String,
        /// 诊断信息
        reason: String,
    },

    /// 重载失败，旧代继续运行
    #[error("插件重载失败: '{plugin}' - {reason}")]
    ReloadFailure {
        /// 插件名称
        plugin: String,
        /// 诊断信息
        reason: String,
    },

    /// 插件未找到
    #[error("插件未找到: '{0}'")]
    PluginNotFound(String),

    /// 插件未运行
    #[error("插件未运行: '{0}'")]
    PluginNotRunning(String),

    /// 必需插件不能禁用
    #[error("插件 '{0}' 是必需插件，不能禁用")]
    MandatoryPlugin(String),

    /// 必需插件缺失
    #[error("缺少必需插件: {0:?}")]
    MissingMandatory(Vec<String>),

    /// 远程管理未开启
    #[error("远程插件管理未开启，拒绝操作: {0}")]
    RemoteAdminDisabled(String),

    // ==================== 扩展注册表错误 ====================
    /// 映射集合中键重复
    #[error("扩展 '{collection}' 中键 '{key}' 已被注册")]
    DuplicateKey {
        /// 集合类型令牌
        collection: String,
        /// 冲突的键
        key: String,
    },

    /// 最终项已被其他插件提供
    #[error("扩展 '{collection}' 已由 '{holder}' 提供，不允许替换")]
    DuplicateBinding {
        /// 集合类型令牌
        collection: String,
        /// 当前持有者
        holder: String,
    },

    /// 扩展提供者失败
    #[error("扩展提供者失败: '{token}' - {reason}")]
    ProviderFailed {
        /// 类型令牌
        token: String,
        /// 诊断信息
        reason: String,
    },

    // ==================== 配置错误 ====================
    /// 配置加载失败
    #[error("配置加载失败: {0}")]
    ConfigLoadFailed(String),

    /// 配置值无效
    #[error("配置值无效: '{key}' - {reason}")]
    InvalidConfigValue {
        /// 配置项
        key: String,
        /// 原因
        reason: String,
    },

    // ==================== IO 和序列化错误 ====================
    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 序列化/反序列化错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML 序列化/反序列化错误
    #[error("YAML 错误: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// 压缩包错误
    #[error("压缩包错误: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// 版本解析错误
    #[error("版本解析错误: {0}")]
    VersionParse(#[from] semver::Error),

    // ==================== 通用错误 ====================
    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// 运行时操作结果类型别名
pub type Result<T> = std::result::Result<T, PluginError>;

/// 状态码常量
pub mod status_code {
    /// 成功
    pub const OK: u16 = 200;

    /// 请求格式错误
    pub const BAD_REQUEST: u16 = 400;

    /// 权限不足
    pub const FORBIDDEN: u16 = 403;

    /// 未找到
    pub const NOT_FOUND: u16 = 404;

    /// 冲突
    pub const CONFLICT: u16 = 409;

    /// 无法处理的实体
    pub const UNPROCESSABLE: u16 = 422;

    /// 内部错误
    pub const INTERNAL_ERROR: u16 = 500;

    /// 服务不可用
    pub const SERVICE_UNAVAILABLE: u16 = 503;
}

/// 错误码常量
pub mod error_code {
    // 插件错误 (PLUGIN-xxx)
    pub const PLUGIN_INVALID_PACKAGE: &str = "PLUGIN-001";
    pub const PLUGIN_INSTALL_FAILED: &str = "PLUGIN-002";
    pub const PLUGIN_START_FAILED: &str = "PLUGIN-003";
    pub const PLUGIN_RELOAD_FAILED: &str = "PLUGIN-004";
    pub const PLUGIN_NOT_FOUND: &str = "PLUGIN-005";
    pub const PLUGIN_NOT_RUNNING: &str = "PLUGIN-006";
    pub const PLUGIN_MANDATORY: &str = "PLUGIN-007";
    pub const PLUGIN_UNSUPPORTED_FORMAT: &str = "PLUGIN-008";

    // 依赖错误 (DEPENDENCY-xxx)
    pub const DEPENDENCY_MISSING: &str = "DEPENDENCY-001";
    pub const DEPENDENCY_CYCLIC: &str = "DEPENDENCY-002";
    pub const DEPENDENCY_INCOMPATIBLE: &str = "DEPENDENCY-003";

    // 注册表错误 (REGISTRY-xxx)
    pub const REGISTRY_DUPLICATE_KEY: &str = "REGISTRY-001";
    pub const REGISTRY_DUPLICATE_BINDING: &str = "REGISTRY-002";
    pub const REGISTRY_PROVIDER_FAILED: &str = "REGISTRY-003";

    // 命名空间错误 (NAMESPACE-xxx)
    pub const NAMESPACE_SYMBOL_NOT_FOUND: &str = "NAMESPACE-001";
    pub const NAMESPACE_ABI_MISMATCH: &str = "NAMESPACE-002";

    // 权限错误 (PERMISSION-xxx)
    pub const PERMISSION_DENIED: &str = "PERMISSION-001";

    // 配置错误 (CONFIG-xxx)
    pub const CONFIG_LOAD_FAILED: &str = "CONFIG-001";
    pub const CONFIG_INVALID_VALUE: &str = "CONFIG-002";

    // 资源错误 (RESOURCE-xxx)
    pub const RESOURCE_ACCESS_FAILED: &str = "RESOURCE-001";
}

impl PluginError {
    /// 构造插件包无效错误
    pub fn invalid_package(plugin: impl Into<String>, reason: impl ToString) -> Self {
        PluginError::InvalidPackage {
            plugin: plugin.into(),
            reason: reason.to_string(),
        }
    }

    /// 构造启动失败错误
    pub fn start_failure(plugin: impl Into<String>, reason: impl ToString) -> Self {
        PluginError::StartFailure {
            plugin: plugin.into(),
            reason: reason.to_string(),
        }
    }

    /// 构造安装失败错误
    pub fn install_failure(plugin: impl Into<String>, reason: impl ToString) -> Self {
        PluginError::InstallFailure {
            plugin: plugin.into(),
            reason: reason.to_string(),
        }
    }

    /// 构造重载失败错误
    pub fn reload_failure(plugin: impl Into<String>, reason: impl ToString) -> Self {
        PluginError::ReloadFailure {
            plugin: plugin.into(),
            reason: reason.to_string(),
        }
    }

    /// 获取错误码
    pub fn error_code(&self) -> &'static str {
        match self {
            PluginError::InvalidPackage { .. } => error_code::PLUGIN_INVALID_PACKAGE,
            PluginError::UnsupportedPackage(_) => error_code::PLUGIN_UNSUPPORTED_FORMAT,
            PluginError::InstallFailure { .. } => error_code::PLUGIN_INSTALL_FAILED,
            PluginError::StartFailure { .. } => error_code::PLUGIN_START_FAILED,
            PluginError::ReloadFailure { .. } => error_code::PLUGIN_RELOAD_FAILED,
            PluginError::PluginNotFound(_) => error_code::PLUGIN_NOT_FOUND,
            PluginError::PluginNotRunning(_) => error_code::PLUGIN_NOT_RUNNING,
            PluginError::MandatoryPlugin(_) | PluginError::MissingMandatory(_) => {
                error_code::PLUGIN_MANDATORY
            }
            PluginError::MissingDependency { .. } => error_code::DEPENDENCY_MISSING,
            PluginError::CyclicDependency(_) => error_code::DEPENDENCY_CYCLIC,
            PluginError::IncompatibleDependency { .. } => error_code::DEPENDENCY_INCOMPATIBLE,
            PluginError::DuplicateKey { .. } => error_code::REGISTRY_DUPLICATE_KEY,
            PluginError::DuplicateBinding { .. } => error_code::REGISTRY_DUPLICATE_BINDING,
            PluginError::ProviderFailed { .. } => error_code::REGISTRY_PROVIDER_FAILED,
            PluginError::SymbolNotFound { .. } => error_code::NAMESPACE_SYMBOL_NOT_FOUND,
            PluginError::AbiMismatch { .. } => error_code::NAMESPACE_ABI_MISMATCH,
            PluginError::RemoteAdminDisabled(_) => error_code::PERMISSION_DENIED,
            PluginError::ConfigLoadFailed(_) => error_code::CONFIG_LOAD_FAILED,
            PluginError::InvalidConfigValue { .. } => error_code::CONFIG_INVALID_VALUE,
            PluginError::Io(_) | PluginError::Zip(_) => error_code::RESOURCE_ACCESS_FAILED,
            _ => "UNKNOWN",
        }
    }

    /// 获取 HTTP 状态码
    pub fn status_code(&self) -> u16 {
        match self {
            PluginError::InvalidPackage { .. }
            | PluginError::SymbolNotFound { .. }
            | PluginError::AbiMismatch { .. } => status_code::UNPROCESSABLE,
            PluginError::UnsupportedPackage(_) | PluginError::InvalidConfigValue { .. } => {
                status_code::BAD_REQUEST
            }
            PluginError::PluginNotFound(_) => status_code::NOT_FOUND,
            PluginError::PluginNotRunning(_)
            | PluginError::DuplicateKey { .. }
            | PluginError::DuplicateBinding { .. }
            | PluginError::MissingDependency { .. }
            | PluginError::IncompatibleDependency { .. }
            | PluginError::CyclicDependency(_) => status_code::CONFLICT,
            PluginError::MandatoryPlugin(_) | PluginError::RemoteAdminDisabled(_) => {
                status_code::FORBIDDEN
            }
            PluginError::MissingMandatory(_) => status_code::SERVICE_UNAVAILABLE,
            _ => status_code::INTERNAL_ERROR,
        }
    }

    /// 获取错误涉及的插件名称（如果有）
    pub fn plugin_name(&self) -> Option<&str> {
        match self {
            PluginError::InvalidPackage { plugin, .. }
            | PluginError::InstallFailure { plugin, .. }
            | PluginError::StartFailure { plugin, .. }
            | PluginError::ReloadFailure { plugin, .. }
            | PluginError::MissingDependency { plugin, .. }
            | PluginError::IncompatibleDependency { plugin, .. }
            | PluginError::SymbolNotFound { plugin, .. } => Some(plugin),
            PluginError::CyclicDependency(plugin)
            | PluginError::PluginNotFound(plugin)
            | PluginError::PluginNotRunning(plugin)
            | PluginError::MandatoryPlugin(plugin) => Some(plugin),
            _ => None,
        }
    }

    /// 是否属于依赖解析阶段的错误（会中止整批扫描）
    pub fn is_resolution_error(&self) -> bool {
        matches!(
            self,
            PluginError::MissingDependency { .. }
                | PluginError::CyclicDependency(_)
                | PluginError::IncompatibleDependency { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PluginError::MissingDependency {
            plugin: "reviewers".to_string(),
            dependency: "accounts".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("reviewers"));
        assert!(msg.contains("accounts"));
    }

    #[test]
    fn test_error_code() {
        let err = PluginError::CyclicDependency("a".to_string());
        assert_eq!(err.error_code(), error_code::DEPENDENCY_CYCLIC);

        let err = PluginError::DuplicateKey {
            collection: "chips.shell.Command".to_string(),
            key: "alpha".to_string(),
        };
        assert_eq!(err.error_code(), error_code::REGISTRY_DUPLICATE_KEY);
    }

    #[test]
    fn test_status_code() {
        let err = PluginError::PluginNotFound("x".to_string());
        assert_eq!(err.status_code(), status_code::NOT_FOUND);

        let err = PluginError::RemoteAdminDisabled("install".to_string());
        assert_eq!(err.status_code(), status_code::FORBIDDEN);

        let err = PluginError::invalid_package("x", "bad");
        assert_eq!(err.status_code(), status_code::UNPROCESSABLE);
    }

    #[test]
    fn test_plugin_name() {
        let err = PluginError::start_failure("hello", "boom");
        assert_eq!(err.plugin_name(), Some("hello"));

        let err = PluginError::Internal("x".to_string());
        assert_eq!(err.plugin_name(), None);
    }

    #[test]
    fn test_resolution_error() {
        assert!(PluginError::CyclicDependency("a".into()).is_resolution_error());
        assert!(!PluginError::start_failure("a", "b").is_resolution_error());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: PluginError = io_err.into();
        assert!(matches!(err, PluginError::Io(_)));
    }
}
