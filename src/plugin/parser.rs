//! 插件描述解析器
//!
//! 负责从 plugin.yaml 解析并验证插件描述。

use super::metadata::{LibraryRef, PluginDescriptor};
use crate::extension::Subsystem;
use crate::utils::{PluginError, Result};
use regex::Regex;
use std::collections::HashSet;
use std::path::{Component, Path};
use std::sync::LazyLock;

/// 插件名称格式
static NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_.\-]*$").expect("Invalid plugin name regex")
});

/// 模块符号格式
static SYMBOL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_.:]*$").expect("Invalid symbol regex")
});

/// 插件描述解析器
#[derive(Debug, Clone, Default)]
pub struct DescriptorParser;

impl DescriptorParser {
    /// 创建新的解析器实例
    pub fn new() -> Self {
        Self
    }

    /// 从文件解析插件描述
    ///
    /// # Arguments
    ///
    /// * `path` - plugin.yaml 文件路径
    /// * `fallback_name` - 描述中没有可用名称时用于错误信息的插件名
    ///
    /// # Errors
    ///
    /// - 文件无法读取时返回 IO 错误
    /// - 内容无效时返回 `InvalidPackage`
    pub async fn parse_file(path: &Path, fallback_name: &str) -> Result<PluginDescriptor> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse_str(&content, fallback_name)
    }

    /// 从文件同步解析插件描述
    pub fn parse_file_sync(path: &Path, fallback_name: &str) -> Result<PluginDescriptor> {
        let content = std::fs::read_to_string(path)?;
        Self::parse_str(&content, fallback_name)
    }

    /// 从字符串解析插件描述
    ///
    /// # Arguments
    ///
    /// * `content` - YAML 格式的描述
    /// * `fallback_name` - 描述中没有可用名称时用于错误信息的插件名
    ///
    /// # Errors
    ///
    /// YAML 格式错误或验证失败时返回 `InvalidPackage`
    pub fn parse_str(content: &str, fallback_name: &str) -> Result<PluginDescriptor> {
        let descriptor: PluginDescriptor = serde_yaml::from_str(content)
            .map_err(|e| PluginError::invalid_package(fallback_name, format!("描述格式错误: {}", e)))?;
        Self::validate(&descriptor)?;
        Ok(descriptor)
    }

    /// 名称是否符合插件名称格式
    pub fn is_valid_name(name: &str) -> bool {
        NAME_REGEX.is_match(name)
    }

    /// 验证插件描述
    ///
    /// 执行以下验证：
    /// - 名称格式
    /// - 版本号格式（semver）
    /// - 依赖名称与版本要求
    /// - 模块符号名称
    /// - 符号库引用
    ///
    /// 收集全部问题后以 "; " 连接返回。
    pub fn validate(descriptor: &PluginDescriptor) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        // 1. 名称
        if descriptor.name.is_empty() {
            errors.push("插件名称不能为空".to_string());
        } else if !NAME_REGEX.is_match(&descriptor.name) {
            errors.push(format!(
                "插件名称 '{}' 格式无效，只允许字母开头的字母、数字、点、下划线和连字符",
                descriptor.name
            ));
        }

        // 2. 版本号
        if semver::Version::parse(&descriptor.version).is_err() {
            errors.push(format!(
                "无效的版本号格式 '{}', 请使用 semver 格式 (如 1.0.0)",
                descriptor.version
            ));
        }

        // 3. 依赖
        let mut seen = HashSet::new();
        for dep in descriptor.dependencies() {
            if dep.name.is_empty() {
                errors.push("依赖名称不能为空".to_string());
                continue;
            }
            if dep.name == descriptor.name {
                errors.push(format!("插件 '{}' 不能依赖自身", dep.name));
            }
            if !seen.insert(dep.name.as_str()) {
                errors.push(format!("重复的依赖 '{}'", dep.name));
            }
            if let Some(ref req) = dep.version {
                if semver::VersionReq::parse(req).is_err() {
                    errors.push(format!(
                        "依赖 '{}' 的版本要求格式无效: '{}', 请使用 semver 范围格式 (如 ^1.0.0)",
                        dep.name, req
                    ));
                }
            }
        }

        // 4. 模块符号
        for subsystem in Subsystem::ALL {
            if let Some(symbol) = descriptor.modules.get(subsystem) {
                if !SYMBOL_REGEX.is_match(symbol) {
                    errors.push(format!("{} 模块符号 '{}' 格式无效", subsystem, symbol));
                }
            }
        }

        // 5. 符号库
        if let Some(ref library) = descriptor.library {
            match LibraryRef::parse(library) {
                Some(LibraryRef::Native(path))
                    if path.is_absolute()
                        || path.components().any(|c| matches!(c, Component::ParentDir)) =>
                {
                    errors.push(format!("原生库路径 '{}' 必须位于插件包内", path.display()));
                }
                Some(_) => {}
                None => errors.push(format!(
                    "无效的符号库引用 '{}', 请使用 linked:<名称> 或 native:<路径>",
                    library
                )),
            }
        } else if !descriptor.modules.is_empty() {
            errors.push("声明了模块但没有指定符号库".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            let plugin = if descriptor.name.is_empty() {
                "<unknown>"
            } else {
                descriptor.name.as_str()
            };
            Err(PluginError::invalid_package(plugin, errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::metadata::ReloadMode;

    #[test]
    fn test_parse_valid() {
        let yaml = r#"
name: hello
version: 1.0.0
description: says hello
library: linked:hello
modules:
  system: hello::Module
depends:
  - name: accounts
    version: "^1.0"
"#;
        let desc = DescriptorParser::parse_str(yaml, "hello").unwrap();
        assert_eq!(desc.name, "hello");
        assert_eq!(desc.reload, ReloadMode::Reload);
        assert_eq!(desc.dependency_names(), vec!["accounts"]);
    }

    #[test]
    fn test_malformed_yaml_names_fallback() {
        let err = DescriptorParser::parse_str("name: [", "broken").unwrap_err();
        assert_eq!(err.plugin_name(), Some("broken"));
        assert!(matches!(err, PluginError::InvalidPackage { .. }));
    }

    #[test]
    fn test_collects_all_errors() {
        let yaml = r#"
name: 1bad
version: one
library: jar:x
depends:
  - name: dep
    version: "not a range"
  - dep
"#;
        let err = DescriptorParser::parse_str(yaml, "bad").unwrap_err();
        match err {
            PluginError::InvalidPackage { reason, .. } => {
                assert!(reason.contains("1bad"));
                assert!(reason.contains("one"));
                assert!(reason.contains("jar:x"));
                assert!(reason.contains("not a range"));
                assert!(reason.contains("重复的依赖"));
                assert!(reason.matches("; ").count() >= 4);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_rejected() {
        let yaml = "name: loop\nversion: 1.0.0\ndependency: loop\n";
        assert!(DescriptorParser::parse_str(yaml, "loop").is_err());
    }

    #[test]
    fn test_modules_require_library() {
        let yaml = "name: hello\nversion: 1.0.0\nmodules:\n  web: hello_web\n";
        let err = DescriptorParser::parse_str(yaml, "hello").unwrap_err();
        assert!(err.to_string().contains("符号库"));
    }

    #[test]
    fn test_native_path_must_stay_in_package() {
        let yaml = "name: hello\nversion: 1.0.0\nlibrary: native:../libevil.so\n";
        assert!(DescriptorParser::parse_str(yaml, "hello").is_err());

        let yaml = "name: hello\nversion: 1.0.0\nlibrary: native:lib/libhello.so\n";
        assert!(DescriptorParser::parse_str(yaml, "hello").is_ok());
    }

    #[test]
    fn test_parse_file_sync() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("plugin.yaml");
        std::fs::write(&path, "name: hello\nversion: 0.1.0\n").unwrap();
        let desc = DescriptorParser::parse_file_sync(&path, "hello").unwrap();
        assert_eq!(desc.version, "0.1.0");
    }
}
