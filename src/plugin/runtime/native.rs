//! 原生动态库
//!
//! 插件包可以携带一个动态库（`library: native:<path>`）。库必须导出：
//!
//! - `CHIPS_PLUGIN_ABI_VERSION`：`u32`，与宿主的 [`ABI_VERSION`] 一致
//! - `chips_plugin_register`：向 [`StaticLibrary`] 写入模块与扩展工厂
//!
//! 两端必须由同一编译器版本构建；ABI 版本号用于拒绝不兼容的库。
//! 插件侧用 [`declare_plugin!`](crate::declare_plugin) 生成这两个符号。

use super::{StaticLibrary, Symbol, SymbolLibrary};
use crate::utils::{PluginError, Result};
use libloading::Library;
use std::fmt;
use std::path::Path;
use tracing::info;

/// 宿主 ABI 版本
pub const ABI_VERSION: u32 = 1;

/// ABI 版本符号
pub const ABI_VERSION_SYMBOL: &[u8] = b"CHIPS_PLUGIN_ABI_VERSION\0";

/// 注册入口符号
pub const REGISTER_SYMBOL: &[u8] = b"chips_plugin_register\0";

/// 注册入口签名
pub type RegisterFn = unsafe extern "C" fn(library: *mut StaticLibrary);

/// 已加载的原生库
pub struct NativeLibrary {
    // 字段按声明顺序析构：符号（闭包代码位于库中）必须先于库卸载
    symbols: StaticLibrary,
    _library: Library,
}

impl NativeLibrary {
    /// 加载原生库并执行注册入口
    ///
    /// # Arguments
    ///
    /// * `plugin` - 插件名称（用于错误信息）
    /// * `path` - 动态库路径
    ///
    /// # Errors
    ///
    /// - 库无法加载时返回 `InvalidPackage`
    /// - ABI 版本不一致时返回 `AbiMismatch`
    /// - 缺少导出符号时返回 `SymbolNotFound`
    pub fn load(plugin: &str, path: &Path) -> Result<Self> {
        let location = path.display().to_string();

        // SAFETY: 加载插件提供的库会执行其初始化代码，宿主信任插件目录中的内容
        let library = unsafe { Library::new(path) }.map_err(|e| {
            PluginError::invalid_package(plugin, format!("无法加载原生库 '{}': {}", location, e))
        })?;

        // SAFETY: 符号按约定为 u32 静态变量
        let found = unsafe {
            let symbol = library
                .get::<*const u32>(ABI_VERSION_SYMBOL)
                .map_err(|_| PluginError::SymbolNotFound {
                    plugin: plugin.to_string(),
                    symbol: "CHIPS_PLUGIN_ABI_VERSION".to_string(),
                })?;
            **symbol
        };
        if found != ABI_VERSION {
            return Err(PluginError::AbiMismatch {
                library: location,
                expected: ABI_VERSION,
                found,
            });
        }

        let mut symbols = StaticLibrary::new(plugin);
        // SAFETY: ABI 版本已校验，入口签名按约定为 RegisterFn
        unsafe {
            let register = library
                .get::<RegisterFn>(REGISTER_SYMBOL)
                .map_err(|_| PluginError::SymbolNotFound {
                    plugin: plugin.to_string(),
                    symbol: "chips_plugin_register".to_string(),
                })?;
            register(&mut symbols);
        }

        info!(plugin = %plugin, library = %path.display(), symbols = symbols.len(), "原生库已加载");
        Ok(Self {
            symbols,
            _library: library,
        })
    }
}

impl SymbolLibrary for NativeLibrary {
    fn name(&self) -> &str {
        self.symbols.name()
    }

    fn resolve(&self, symbol: &str) -> Option<Symbol> {
        self.symbols.resolve(symbol)
    }

    fn symbols(&self) -> Vec<String> {
        self.symbols.symbols()
    }
}

impl fmt::Debug for NativeLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeLibrary")
            .field("symbols", &self.symbols)
            .finish()
    }
}

/// 在插件库中声明 ABI 版本与注册入口
///
/// ```rust,ignore
/// fn register(library: &mut chips_plugins::plugin::runtime::StaticLibrary) {
///     library.add_module("hello::Module", std::sync::Arc::new(HelloModule));
/// }
///
/// chips_plugins::declare_plugin!(register);
/// ```
#[macro_export]
macro_rules! declare_plugin {
    ($register:path) => {
        #[no_mangle]
        pub static CHIPS_PLUGIN_ABI_VERSION: u32 = $crate::plugin::runtime::native::ABI_VERSION;

        /// # Safety
        ///
        /// 由宿主以有效的符号库指针调用
        #[no_mangle]
        pub unsafe extern "C" fn chips_plugin_register(
            library: *mut $crate::plugin::runtime::StaticLibrary,
        ) {
            if let Some(library) = library.as_mut() {
                $register(library);
            }
        }
    };
}
