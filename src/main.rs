//! Chips Plugins 命令行入口
//!
//! 独立运行插件运行时，用于调试插件目录与配置。
//!
//! # 命令概览
//!
//! - `start` - 加载插件目录并运行，直到收到 Ctrl+C
//! - `check` - 不执行插件代码，检查插件包并输出加载顺序
//! - `check-config` - 验证配置文件
//! - `version` - 显示版本信息
//!
//! # 使用示例
//!
//! ```bash
//! # 使用默认配置启动
//! chips-plugins start
//!
//! # 指定插件目录
//! chips-plugins -c runtime.yaml start --plugins-dir ./plugins
//!
//! # 检查插件目录
//! chips-plugins check --plugins-dir ./plugins
//! ```

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

use chips_plugins::{
    HostEnvironment, Logger, LoggerConfig, PluginManager, RuntimeConfig,
};

/// Chips Plugins - 薯片插件运行时
#[derive(Parser)]
#[command(name = "chips-plugins")]
#[command(version, about = "薯片插件运行时", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "runtime.yaml", global = true)]
    config: PathBuf,

    /// 日志级别 (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// 子命令
    #[command(subcommand)]
    command: Option<Commands>,
}

/// 可用的子命令
#[derive(Subcommand)]
enum Commands {
    /// 启动插件运行时
    ///
    /// 加载插件目录中的全部插件，按配置周期扫描变化。
    /// 按 Ctrl+C 按依赖逆序停止全部插件后退出。
    Start {
        /// 插件目录（覆盖配置文件）
        #[arg(long)]
        plugins_dir: Option<PathBuf>,
    },

    /// 检查插件目录
    ///
    /// 解码全部已启用的插件包并计算加载顺序，不执行插件代码。
    Check {
        /// 插件目录（覆盖配置文件）
        #[arg(long)]
        plugins_dir: Option<PathBuf>,
    },

    /// 验证配置文件
    CheckConfig {
        /// 配置文件路径（不指定则使用全局 -c 选项）
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// 查看版本信息
    Version,
}

/// 加载配置文件，不存在时使用默认配置
async fn load_config(path: &Path) -> Result<RuntimeConfig, Box<dyn std::error::Error>> {
    if path.exists() {
        Ok(RuntimeConfig::from_file(path).await?)
    } else {
        Ok(RuntimeConfig::default())
    }
}

/// 运行插件运行时
async fn run_start(config: RuntimeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let manager = Arc::new(
        PluginManager::builder(config)
            .host(HostEnvironment::empty())
            .build()?,
    );

    let report = manager.start().await?;
    for (name, e) in &report.failed {
        warn!(plugin = %name, "插件未能启动: {}", e);
    }
    manager.spawn_scanner();

    println!();
    println!("╔════════════════════════════════════════════════════════╗");
    println!("║        薯片插件运行时已启动 (Chips Plugins Started)    ║");
    println!("╠════════════════════════════════════════════════════════╣");
    println!("  版本:     {}", chips_plugins::VERSION);
    println!("  插件目录: {}", manager.config().plugins.plugins_dir.display());
    println!("  已启动:   {}", report.started.len());
    println!("  失败:     {}", report.failed.len());
    println!("  按 Ctrl+C 停止");
    println!("╚════════════════════════════════════════════════════════╝");
    println!();

    signal::ctrl_c().await?;

    info!("收到关闭信号，正在停止全部插件...");
    manager.stop().await?;
    info!("插件运行时已关闭");
    Ok(())
}

/// 检查插件目录
async fn run_check(config: RuntimeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let dir = config.plugins.plugins_dir.clone();
    tokio::fs::create_dir_all(&config.plugins.tmp_dir).await?;
    let manager = PluginManager::builder(config).build()?;

    println!("检查插件目录: {}", dir.display());
    println!();
    match manager.resolve_order() {
        Ok(order) => {
            println!("✅ 插件包有效，加载顺序:");
            println!("────────────────────────────────────────");
            for (i, name) in order.iter().enumerate() {
                println!("  {:>3}. {}", i + 1, name);
            }
            println!("────────────────────────────────────────");
            Ok(())
        }
        Err(e) => {
            println!("❌ [{}] {}", e.error_code(), e);
            Err(Box::new(e))
        }
    }
}

/// 检查配置文件
async fn check_config(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("检查配置文件: {}", path.display());
    println!();

    if !path.exists() {
        println!("⚠️  警告: 配置文件不存在，将使用默认配置");
        println!();
        print_config(&RuntimeConfig::default());
        return Ok(());
    }

    let config = RuntimeConfig::from_file(path).await?;
    match config.validate() {
        Ok(()) => {
            println!("✅ 配置文件有效！");
            println!();
            print_config(&config);
            Ok(())
        }
        Err(e) => {
            println!("❌ 配置文件无效: {}", e);
            Err(Box::new(e))
        }
    }
}

fn print_config(config: &RuntimeConfig) {
    let plugins = &config.plugins;
    println!("配置内容:");
    println!("────────────────────────────────────────");
    println!("  [插件配置]");
    println!("    插件目录:       {}", plugins.plugins_dir.display());
    println!("    数据目录:       {}", plugins.data_dir.display());
    println!("    临时目录:       {}", plugins.tmp_dir.display());
    match plugins.check_frequency() {
        Some(period) => println!("    扫描周期:       {} ms", period.as_millis()),
        None => println!("    扫描周期:       禁用"),
    }
    println!("    远程管理:       {}", if plugins.allow_remote_admin { "启用" } else { "禁用" });
    println!("    必需插件:       {:?}", plugins.mandatory);
    println!("    包格式优先级:   {:?}", plugins.format_priority);
    println!();
    println!("  [回收配置]");
    println!("    初始间隔:       {} ms", config.cleanup.initial_delay_ms);
    println!("    最大间隔:       {} ms", config.cleanup.max_delay_ms);
    println!("    关闭等待:       {} ms", config.cleanup.shutdown_timeout_ms);
    println!();
    println!("  [日志配置]");
    println!("    日志级别:       {}", config.logging.level);
    println!("    文件输出:       {}", if config.logging.file_output { "是" } else { "否" });
    println!("────────────────────────────────────────");
}

fn print_version() {
    println!();
    println!("Chips Plugins - 薯片插件运行时");
    println!("═══════════════════════════════════════");
    println!("  版本:             {}", chips_plugins::VERSION);
    println!("  原生库 ABI 版本:  {}", chips_plugins::ABI_VERSION);
    println!();
    println!("构建信息:");
    println!("  目标平台:         {}", std::env::consts::ARCH);
    println!("  操作系统:         {}", std::env::consts::OS);
    println!("═══════════════════════════════════════");
    println!();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => print_version(),

        Some(Commands::CheckConfig { config }) => {
            check_config(&config.unwrap_or(cli.config)).await?;
        }

        Some(Commands::Check { plugins_dir }) => {
            let mut config = load_config(&cli.config).await?;
            if let Some(dir) = plugins_dir {
                config.plugins.plugins_dir = dir;
            }
            run_check(config).await?;
        }

        Some(Commands::Start { plugins_dir: None }) | None => {
            let config = load_config(&cli.config).await?;
            start_with_logging(config, cli.log_level).await?;
        }

        Some(Commands::Start { plugins_dir: Some(dir) }) => {
            let mut config = load_config(&cli.config).await?;
            config.plugins.plugins_dir = dir;
            start_with_logging(config, cli.log_level).await?;
        }
    }

    Ok(())
}

async fn start_with_logging(
    mut config: RuntimeConfig,
    level: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(level) = level {
        config.logging.level = level;
    }
    let _guard = Logger::init(LoggerConfig::from_log_config(&config.logging))?;
    if let Some(ref path) = config.config_path {
        info!("已加载配置文件: {}", path.display());
    }
    run_start(config).await
}
