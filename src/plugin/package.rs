//! 插件包
//!
//! 插件目录中的每个条目（目录或压缩包）由一个格式提供者解码。
//! 提供者按 ID 注册，可由宿主扩展；内置目录包与 zip 包两种格式。
//!
//! 包布局：
//!
//! ```text
//! <package>/
//! ├── plugin.yaml        # 插件描述
//! ├── units/*.yaml       # 代码单元声明（自动注册）
//! └── lib/...            # 可选的原生库
//! ```

use super::metadata::{LibraryRef, PluginDescriptor, DESCRIPTOR_FILE};
use super::parser::DescriptorParser;
use crate::utils::{PluginError, Result};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

/// 禁用标记后缀
pub const DISABLED_SUFFIX: &str = ".disabled";

/// 代码单元目录
pub const UNITS_DIR: &str = "units";

/// 临时文件前缀
pub const TMP_PREFIX: &str = "plugin_";

/// 压缩包中描述文件的大小上限
const MAX_DESCRIPTOR_SIZE: u64 = 64 * 1024;

// ==================== 内容指纹 ====================

/// 内容指纹（修改时间、长度、条目数）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fingerprint {
    /// 最近修改时间
    pub modified: Option<SystemTime>,
    /// 总长度（字节）
    pub len: u64,
    /// 文件条目数
    pub entries: u64,
}

impl Fingerprint {
    /// 计算路径的指纹，目录聚合其下所有文件
    pub fn of(path: &Path) -> io::Result<Self> {
        let meta = fs::metadata(path)?;
        if !meta.is_dir() {
            return Ok(Self {
                modified: meta.modified().ok(),
                len: meta.len(),
                entries: 1,
            });
        }

        let mut fp = Self {
            modified: meta.modified().ok(),
            ..Self::default()
        };
        let mut stack = vec![path.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let meta = entry.metadata()?;
                if meta.is_dir() {
                    stack.push(entry.path());
                    continue;
                }
                fp.len += meta.len();
                fp.entries += 1;
                let modified = meta.modified().ok();
                if modified > fp.modified {
                    fp.modified = modified;
                }
            }
        }
        Ok(fp)
    }
}

// ==================== 包内容 ====================

/// 原始代码单元
#[derive(Debug, Clone)]
pub struct RawUnit {
    /// 包内相对路径
    pub file: String,
    /// 声明的大小
    pub size: u64,
    /// 内容，超过大小上限时为空
    pub content: Vec<u8>,
}

impl RawUnit {
    /// 是否超过大小上限
    pub fn is_oversized(&self, limit: u64) -> bool {
        self.size > limit
    }
}

/// 解码后的包内容
#[derive(Debug, Clone)]
pub struct PackageContents {
    /// 插件描述
    pub descriptor: PluginDescriptor,
    /// 包根目录（解析原生库相对路径）
    pub root: PathBuf,
    /// 代码单元
    pub units: Vec<RawUnit>,
    /// 该代持有的临时产物，回收时删除
    pub artifacts: Vec<PathBuf>,
}

impl PackageContents {
    /// 原生库的绝对路径
    pub fn native_library(&self) -> Option<PathBuf> {
        match self.descriptor.library_ref() {
            Some(LibraryRef::Native(rel)) => Some(self.root.join(rel)),
            _ => None,
        }
    }
}

/// 解码选项
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// 临时目录
    pub tmp_dir: PathBuf,
    /// 代码单元大小上限
    pub max_unit_size: u64,
}

// ==================== 格式提供者 ====================

/// 插件包格式提供者
pub trait PackageProvider: Send + Sync {
    /// 提供者 ID
    fn id(&self) -> &str;

    /// 是否能解码该路径（路径可能带有禁用后缀）
    fn handles(&self, path: &Path) -> bool;

    /// 读取包声明的插件名称，读取失败时返回 None
    fn plugin_name(&self, path: &Path) -> Option<String>;

    /// 解码插件包
    ///
    /// # Errors
    ///
    /// 描述无效返回 `InvalidPackage`，读取失败返回 IO / Zip 错误
    fn open(&self, path: &Path, options: &OpenOptions) -> Result<PackageContents>;

    /// 是否支持从字节流安装
    fn supports_stream(&self) -> bool {
        false
    }

    /// 从字节流安装时使用的文件扩展名
    fn file_extension(&self) -> Option<&str> {
        None
    }
}

/// 目录格式
#[derive(Debug, Default)]
pub struct DirectoryPackageProvider;

impl PackageProvider for DirectoryPackageProvider {
    fn id(&self) -> &str {
        "directory"
    }

    fn handles(&self, path: &Path) -> bool {
        path.is_dir() && path.join(DESCRIPTOR_FILE).is_file()
    }

    fn plugin_name(&self, path: &Path) -> Option<String> {
        let content = fs::read_to_string(path.join(DESCRIPTOR_FILE)).ok()?;
        read_name(&content)
    }

    fn open(&self, path: &Path, options: &OpenOptions) -> Result<PackageContents> {
        let fallback = name_of(path);
        let descriptor = DescriptorParser::parse_file_sync(&path.join(DESCRIPTOR_FILE), &fallback)?;

        let mut units = Vec::new();
        let units_dir = path.join(UNITS_DIR);
        if units_dir.is_dir() {
            let mut files: Vec<PathBuf> = fs::read_dir(&units_dir)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| is_unit_file(p))
                .collect();
            files.sort();

            for file in files {
                let size = fs::metadata(&file)?.len();
                let content = if size > options.max_unit_size {
                    Vec::new()
                } else {
                    fs::read(&file)?
                };
                let rel = file
                    .strip_prefix(path)
                    .unwrap_or(&file)
                    .to_string_lossy()
                    .replace('\\', "/");
                units.push(RawUnit {
                    file: rel,
                    size,
                    content,
                });
            }
        }

        Ok(PackageContents {
            descriptor,
            root: path.to_path_buf(),
            units,
            artifacts: vec![],
        })
    }
}

/// zip 压缩包格式
///
/// 解码前把压缩包复制到临时目录，运行期间只读取副本，
/// 原文件可以随时被替换或删除。
#[derive(Debug, Default)]
pub struct ArchivePackageProvider;

impl ArchivePackageProvider {
    /// 读取描述文件，按实际解压的字节数限制大小
    fn read_descriptor<R: Read + io::Seek>(
        archive: &mut zip::ZipArchive<R>,
        plugin: &str,
    ) -> Result<Option<Vec<u8>>> {
        match archive.by_name(DESCRIPTOR_FILE) {
            Ok(entry) => {
                let mut buf = Vec::new();
                entry.take(MAX_DESCRIPTOR_SIZE + 1).read_to_end(&mut buf)?;
                if buf.len() as u64 > MAX_DESCRIPTOR_SIZE {
                    return Err(PluginError::invalid_package(
                        plugin,
                        format!("{} 超过 {} 字节", DESCRIPTOR_FILE, MAX_DESCRIPTOR_SIZE),
                    ));
                }
                Ok(Some(buf))
            }
            Err(zip::result::ZipError::FileNotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl PackageProvider for ArchivePackageProvider {
    fn id(&self) -> &str {
        "zip"
    }

    fn handles(&self, path: &Path) -> bool {
        path.is_file() && strip_disabled(path).extension().and_then(|e| e.to_str()) == Some("zip")
    }

    fn plugin_name(&self, path: &Path) -> Option<String> {
        let file = fs::File::open(path).ok()?;
        let mut archive = zip::ZipArchive::new(file).ok()?;
        let content = Self::read_descriptor(&mut archive, &name_of(path)).ok()??;
        read_name(&String::from_utf8_lossy(&content))
    }

    fn open(&self, path: &Path, options: &OpenOptions) -> Result<PackageContents> {
        let fallback = name_of(path);
        fs::create_dir_all(&options.tmp_dir)?;

        let unique = uuid::Uuid::new_v4().simple().to_string();
        let copy = options
            .tmp_dir
            .join(format!("{}{}_{}.zip", TMP_PREFIX, fallback, unique));
        fs::copy(path, &copy)?;
        let mut artifacts = vec![copy.clone()];

        let result = (|| -> Result<PackageContents> {
            let mut archive = zip::ZipArchive::new(fs::File::open(&copy)?)?;

            let raw = Self::read_descriptor(&mut archive, &fallback)?.ok_or_else(|| {
                PluginError::invalid_package(&fallback, format!("压缩包中缺少 {}", DESCRIPTOR_FILE))
            })?;
            let descriptor = DescriptorParser::parse_str(&String::from_utf8_lossy(&raw), &fallback)?;

            let mut units = Vec::new();
            for i in 0..archive.len() {
                let mut entry = archive.by_index(i)?;
                let name = entry.name().to_string();
                if entry.is_dir() || !is_unit_entry(&name) {
                    continue;
                }
                // 头部声明的大小不可信，按实际读取的字节数判断是否超限
                let mut size = entry.size();
                let mut content = Vec::new();
                if size <= options.max_unit_size {
                    (&mut entry)
                        .take(options.max_unit_size + 1)
                        .read_to_end(&mut content)?;
                    if content.len() as u64 > options.max_unit_size {
                        size = content.len() as u64;
                        content.clear();
                    }
                }
                units.push(RawUnit {
                    file: name,
                    size,
                    content,
                });
            }
            units.sort_by(|a, b| a.file.cmp(&b.file));

            // 原生库需要落盘才能被动态加载
            let root = options
                .tmp_dir
                .join(format!("{}{}_{}.d", TMP_PREFIX, fallback, unique));
            if let Some(LibraryRef::Native(rel)) = descriptor.library_ref() {
                let entry_name = rel.to_string_lossy().replace('\\', "/");
                let mut entry = match archive.by_name(&entry_name) {
                    Ok(entry) => entry,
                    Err(zip::result::ZipError::FileNotFound) => {
                        return Err(PluginError::invalid_package(
                            &descriptor.name,
                            format!("压缩包中缺少原生库 '{}'", entry_name),
                        ))
                    }
                    Err(e) => return Err(e.into()),
                };
                let target = root.join(&rel);
                artifacts.push(root.clone());
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                io::copy(&mut entry, &mut fs::File::create(&target)?)?;
            }

            Ok(PackageContents {
                descriptor,
                root,
                units,
                artifacts: artifacts.clone(),
            })
        })();

        if result.is_err() {
            for artifact in &artifacts {
                remove_artifact(artifact);
            }
        }
        result
    }

    fn supports_stream(&self) -> bool {
        true
    }

    fn file_extension(&self) -> Option<&str> {
        Some("zip")
    }
}

// ==================== 提供者注册表 ====================

/// 格式提供者注册表
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn PackageProvider>>,
}

impl ProviderRegistry {
    /// 空注册表
    pub fn new() -> Self {
        Self { providers: vec![] }
    }

    /// 含内置提供者的注册表
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ArchivePackageProvider));
        registry.register(Arc::new(DirectoryPackageProvider));
        registry
    }

    /// 注册提供者，同 ID 的提供者会被替换
    pub fn register(&mut self, provider: Arc<dyn PackageProvider>) {
        self.providers.retain(|p| p.id() != provider.id());
        self.providers.push(provider);
    }

    /// 按优先级列表重排，未列出的提供者保持原顺序排在后面
    pub fn prioritize(&mut self, priority: &[String]) {
        self.providers.sort_by_key(|p| {
            priority
                .iter()
                .position(|id| id == p.id())
                .unwrap_or(priority.len())
        });
    }

    /// 提供者的优先级（越小越优先）
    pub fn rank(&self, id: &str) -> usize {
        self.providers
            .iter()
            .position(|p| p.id() == id)
            .unwrap_or(usize::MAX)
    }

    /// 查找能解码该路径的提供者
    pub fn find(&self, path: &Path) -> Option<Arc<dyn PackageProvider>> {
        self.providers.iter().find(|p| p.handles(path)).cloned()
    }

    /// 按 ID 查找
    pub fn get(&self, id: &str) -> Option<Arc<dyn PackageProvider>> {
        self.providers.iter().find(|p| p.id() == id).cloned()
    }

    /// 第一个支持字节流安装的提供者
    pub fn stream_provider(&self) -> Option<Arc<dyn PackageProvider>> {
        self.providers.iter().find(|p| p.supports_stream()).cloned()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.providers.iter().map(|p| p.id()))
            .finish()
    }
}

// ==================== 发现 ====================

/// 已发现的插件包
#[derive(Clone)]
pub struct PluginPackage {
    /// 插件名称
    pub name: String,
    /// 包路径
    pub path: PathBuf,
    /// 内容指纹
    pub fingerprint: Fingerprint,
    /// 是否启用
    pub enabled: bool,
    /// 格式提供者
    pub provider: Arc<dyn PackageProvider>,
}

impl std::fmt::Debug for PluginPackage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginPackage")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("enabled", &self.enabled)
            .field("provider", &self.provider.id())
            .finish()
    }
}

/// 路径是否带禁用标记
pub fn is_disabled(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(DISABLED_SUFFIX))
        .unwrap_or(false)
}

/// 去掉禁用标记后的路径
pub fn strip_disabled(path: &Path) -> PathBuf {
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) if name.ends_with(DISABLED_SUFFIX) => {
            path.with_file_name(&name[..name.len() - DISABLED_SUFFIX.len()])
        }
        _ => path.to_path_buf(),
    }
}

/// 加上禁用标记后的路径
pub fn with_disabled(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(DISABLED_SUFFIX);
    path.with_file_name(name)
}

/// 由文件名推断插件名（去掉禁用标记与扩展名）
pub fn name_of(path: &Path) -> String {
    let is_dir = path.is_dir();
    let path = strip_disabled(path);
    let name = if is_dir {
        path.file_name()
    } else {
        path.file_stem()
    };
    name.map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// 列出插件目录中的候选条目
///
/// 跳过隐藏条目，以及安装过程中的 `.next_` 临时文件与 `.last_` 备份。
pub fn list_entries(dir: &Path) -> io::Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(vec![]);
    }
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| !n.starts_with('.'))
                .unwrap_or(false)
        })
        .collect();
    entries.sort();
    Ok(entries)
}

/// 扫描插件目录
///
/// 无法识别格式的条目记录调试日志后跳过。
pub fn discover(dir: &Path, registry: &ProviderRegistry) -> io::Result<Vec<PluginPackage>> {
    let mut packages = Vec::new();
    for path in list_entries(dir)? {
        let Some(provider) = registry.find(&path) else {
            debug!(path = %path.display(), "跳过无法识别的插件包");
            continue;
        };
        let fingerprint = match Fingerprint::of(&path) {
            Ok(fp) => fp,
            Err(e) => {
                warn!(path = %path.display(), "无法读取插件包指纹: {}", e);
                continue;
            }
        };
        let name = provider
            .plugin_name(&path)
            .unwrap_or_else(|| name_of(&path));
        packages.push(PluginPackage {
            name,
            enabled: !is_disabled(&path),
            path,
            fingerprint,
            provider,
        });
    }
    Ok(packages)
}

/// 处理同名插件包
///
/// 多个启用的包声明同一名称时按格式优先级、再按路径保留一个，
/// 其余重命名为 `.disabled` 并作为禁用包返回。
pub fn prune_duplicates(
    packages: Vec<PluginPackage>,
    registry: &ProviderRegistry,
) -> Vec<PluginPackage> {
    let mut groups: HashMap<String, Vec<PluginPackage>> = HashMap::new();
    let mut result = Vec::new();

    for pkg in packages {
        if pkg.enabled {
            groups.entry(pkg.name.clone()).or_default().push(pkg);
        } else {
            result.push(pkg);
        }
    }

    for (name, mut group) in groups {
        group.sort_by(|a, b| {
            registry
                .rank(a.provider.id())
                .cmp(&registry.rank(b.provider.id()))
                .then_with(|| a.path.cmp(&b.path))
        });
        let mut iter = group.into_iter();
        if let Some(winner) = iter.next() {
            for mut loser in iter {
                let target = with_disabled(&loser.path);
                warn!(
                    plugin = %name,
                    path = %loser.path.display(),
                    kept = %winner.path.display(),
                    "插件名称重复，禁用该插件包"
                );
                match fs::rename(&loser.path, &target) {
                    Ok(()) => {
                        loser.path = target;
                        loser.enabled = false;
                        result.push(loser);
                    }
                    Err(e) => warn!(path = %loser.path.display(), "无法禁用重复插件包: {}", e),
                }
            }
            result.push(winner);
        }
    }

    result.sort_by(|a, b| a.path.cmp(&b.path));
    result
}

/// 删除临时产物（文件或目录），返回是否成功
pub fn remove_artifact(path: &Path) -> bool {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => true,
        Err(_) => false,
    }
}

fn read_name(descriptor: &str) -> Option<String> {
    #[derive(serde::Deserialize)]
    struct NameOnly {
        name: String,
    }
    serde_yaml::from_str::<NameOnly>(descriptor)
        .ok()
        .map(|n| n.name)
        .filter(|n| !n.is_empty())
}

fn is_unit_file(path: &Path) -> bool {
    path.is_file()
        && matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        )
}

fn is_unit_entry(name: &str) -> bool {
    name.starts_with("units/") && (name.ends_with(".yaml") || name.ends_with(".yml"))
}
