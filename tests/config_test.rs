//! 运行时配置集成测试
//!
//! 测试从文件加载配置并交给插件管理器的完整流程

use chips_plugins::{PluginError, PluginManager, RuntimeConfig};
use std::path::PathBuf;
use tempfile::TempDir;

/// 测试 YAML 配置文件加载
#[tokio::test]
async fn test_load_yaml_config() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("runtime.yaml");
    tokio::fs::write(
        &path,
        r#"
plugins:
  plugins_dir: /srv/review/plugins
  check_frequency_ms: 0
  allow_remote_admin: true
  mandatory:
    - accounts
  format_priority:
    - directory
    - zip
cleanup:
  initial_delay_ms: 50
logging:
  level: debug
"#,
    )
    .await
    .unwrap();

    let config = RuntimeConfig::from_file(&path).await.unwrap();

    assert_eq!(config.config_path, Some(path));
    assert_eq!(config.plugins.plugins_dir, PathBuf::from("/srv/review/plugins"));
    assert!(config.plugins.check_frequency().is_none());
    assert!(config.plugins.allow_remote_admin);
    assert!(config.plugins.is_mandatory("accounts"));
    assert_eq!(config.plugins.format_priority, vec!["directory", "zip"]);
    assert_eq!(config.cleanup.initial_delay_ms, 50);
    // 未设置的字段使用默认值
    assert_eq!(config.cleanup.max_delay_ms, 60_000);
    assert_eq!(config.plugins.data_dir, PathBuf::from("data"));
    assert_eq!(config.logging.level, "debug");
    assert!(config.validate().is_ok());
}

/// 测试 JSON 配置文件加载
#[tokio::test]
async fn test_load_json_config() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("runtime.json");
    tokio::fs::write(
        &path,
        r#"{ "plugins": { "max_unit_size": 2048 }, "cleanup": { "warn_every": 3 } }"#,
    )
    .await
    .unwrap();

    let config = RuntimeConfig::from_file(&path).await.unwrap();
    assert_eq!(config.plugins.max_unit_size, 2048);
    assert_eq!(config.cleanup.warn_every, 3);
    assert_eq!(config.plugins.check_frequency_ms, 60_000);
}

/// 测试配置文件错误
#[tokio::test]
async fn test_config_errors() {
    let temp_dir = TempDir::new().unwrap();

    let err = RuntimeConfig::from_file(temp_dir.path().join("missing.yaml"))
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::ConfigLoadFailed(_)));

    let path = temp_dir.path().join("bad.yaml");
    tokio::fs::write(&path, "plugins: [not, a, map]").await.unwrap();
    let err = RuntimeConfig::from_file(&path).await.unwrap_err();
    assert!(matches!(err, PluginError::Yaml(_)));
}

/// 测试无效配置无法构建管理器
#[tokio::test]
async fn test_invalid_config_rejected_by_manager() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("runtime.yaml");
    tokio::fs::write(&path, "cleanup:\n  warn_every: 0\n").await.unwrap();

    let config = RuntimeConfig::from_file(&path).await.unwrap();
    let err = PluginManager::builder(config).build().unwrap_err();
    assert!(
        matches!(err, PluginError::InvalidConfigValue { ref key, .. } if key == "cleanup.warn_every")
    );
}

/// 测试文件配置与命令行覆盖的合并
#[tokio::test]
async fn test_file_config_with_overrides() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("runtime.yaml");
    tokio::fs::write(
        &path,
        "plugins:\n  mandatory: [accounts]\n  check_frequency_ms: 1000\n",
    )
    .await
    .unwrap();

    let mut config = RuntimeConfig::from_file(&path).await.unwrap();
    let overrides = RuntimeConfig::builder()
        .plugins_dir(temp_dir.path().join("plugins"))
        .mandatory("audit")
        .file_logging(temp_dir.path().join("logs"))
        .build();
    config.merge(overrides);

    assert_eq!(config.plugins.plugins_dir, temp_dir.path().join("plugins"));
    assert_eq!(config.plugins.mandatory, vec!["accounts", "audit"]);
    assert_eq!(config.plugins.check_frequency_ms, 1000);
    assert!(config.logging.file_output);
    assert_eq!(config.logging.log_dir, Some(temp_dir.path().join("logs")));
}
