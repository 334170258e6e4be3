//! 注册句柄
//!
//! 每个贡献到动态集合的绑定对应一个可撤销的句柄。
//! 集合句柄都是可重载的：热重载时在原位替换提供者，句柄标识保持不变。

use super::provider::{NamedProvider, Provider};
use super::{CollectionKind, Key, TypeToken};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// 句柄标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    /// 分配新的句柄标识
    pub fn next() -> Self {
        HandleId(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }

    /// 数值形式
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// 注册句柄
pub trait RegistrationHandle: Send + Sync + fmt::Debug {
    /// 句柄标识
    fn id(&self) -> HandleId;

    /// 撤销绑定，重复调用无副作用
    fn remove(&self);

    /// 绑定是否仍在集合中
    fn is_active(&self) -> bool;

    /// 可重载视图
    fn as_reloadable(&self) -> Option<&dyn ReloadableHandle> {
        None
    }
}

/// 可重载的注册句柄
pub trait ReloadableHandle: RegistrationHandle {
    /// 所在集合类型
    fn kind(&self) -> CollectionKind;

    /// 当前绑定键
    fn key(&self) -> Key;

    /// 当前绑定条目
    fn current(&self) -> Option<Arc<NamedProvider>>;

    /// 原地替换键与提供者
    ///
    /// 句柄已被撤销时返回 `false`，集合内容不变。
    fn replace(&self, key: Key, provider: Arc<dyn Provider>) -> bool;

    /// 类型令牌
    fn token(&self) -> TypeToken {
        self.key().token
    }
}

/// 回调句柄，撤销时执行一次回调
///
/// 用于宿主事件监听等不在动态集合中的注册。
pub struct CallbackHandle {
    id: HandleId,
    on_remove: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    active: AtomicBool,
}

impl CallbackHandle {
    /// 创建回调句柄
    pub fn new(on_remove: impl FnOnce() + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            id: HandleId::next(),
            on_remove: Mutex::new(Some(Box::new(on_remove))),
            active: AtomicBool::new(true),
        })
    }
}

impl RegistrationHandle for CallbackHandle {
    fn id(&self) -> HandleId {
        self.id
    }

    fn remove(&self) {
        self.active.store(false, Ordering::Release);
        if let Some(f) = self.on_remove.lock().take() {
            f();
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackHandle")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
