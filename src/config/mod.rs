// 配置管理模块
//
// 两个配置面：
// - 上传清单（YAML/JSON）：目标仓库、凭证、数据集 PID、文件描述列表
// - 应用配置（config/app.toml）：重试/退避等调优参数 + 日志配置
//
// 所有可调参数在进程启动时固化为不可变快照（UploadConfig），
// 之后只读共享，组件不读取任何环境变量。

use crate::uploader::checksum::ChecksumType;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// 默认最大重试次数
pub const DEFAULT_MAX_RETRIES: u32 = 15;

/// 默认最大退避时间（秒）
pub const DEFAULT_MAX_RETRY_SECS: u64 = 240;

/// 默认最小退避时间（秒）
pub const DEFAULT_MIN_RETRY_SECS: u64 = 1;

/// 默认退避乘数
pub const DEFAULT_RETRY_MULTIPLIER: f64 = 0.1;

/// 默认单包大小上限: 2GB（超过则必须走分片上传）
pub const DEFAULT_MAX_PACKAGE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// 默认并行上传文件数
pub const DEFAULT_PARALLEL_UPLOADS: usize = 1;

/// 上传调优配置（不可变快照）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 最大退避时间（秒）
    #[serde(default = "default_max_retry_secs")]
    pub max_retry_secs: u64,
    /// 最小退避时间（秒）
    #[serde(default = "default_min_retry_secs")]
    pub min_retry_secs: u64,
    /// 退避乘数
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,
    /// 单包大小上限（字节），超过则必须分片
    #[serde(default = "default_max_package_size")]
    pub max_package_size: u64,
    /// 最大并行上传文件数
    #[serde(default = "default_parallel_uploads")]
    pub n_parallel_uploads: usize,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_max_retry_secs() -> u64 {
    DEFAULT_MAX_RETRY_SECS
}

fn default_min_retry_secs() -> u64 {
    DEFAULT_MIN_RETRY_SECS
}

fn default_retry_multiplier() -> f64 {
    DEFAULT_RETRY_MULTIPLIER
}

fn default_max_package_size() -> u64 {
    DEFAULT_MAX_PACKAGE_SIZE
}

fn default_parallel_uploads() -> usize {
    DEFAULT_PARALLEL_UPLOADS
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            max_retry_secs: DEFAULT_MAX_RETRY_SECS,
            min_retry_secs: DEFAULT_MIN_RETRY_SECS,
            retry_multiplier: DEFAULT_RETRY_MULTIPLIER,
            max_package_size: DEFAULT_MAX_PACKAGE_SIZE,
            n_parallel_uploads: DEFAULT_PARALLEL_UPLOADS,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    false
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

/// 应用配置（config/app.toml）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传调优配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("读取配置文件失败")?;

        let config: AppConfig = toml::from_str(&content).context("解析配置文件失败")?;

        Ok(config)
    }

    /// 从文件加载配置，失败时回退到默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => config,
            Err(_) => Self::default(),
        }
    }
}

/// 单个待上传文件的描述
///
/// 字段与控制 API 的注册负载一一对应，缺省值在反序列化时填充，
/// 之后不再做动态查找。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    /// 本地文件路径
    pub filepath: PathBuf,
    /// 数据集内目标子目录
    #[serde(default)]
    pub directory_label: Option<String>,
    /// 文件描述
    #[serde(default)]
    pub description: Option<String>,
    /// MIME 类型
    #[serde(default = "default_mimetype")]
    pub mimetype: String,
    /// 分类标签
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,
    /// 是否受限访问
    #[serde(default)]
    pub restrict: bool,
    /// 是否进行表格摄取（csv/tsv 等；关闭可避开摄取锁）
    #[serde(default = "default_tab_ingest")]
    pub tab_ingest: bool,
    /// 校验和算法
    #[serde(default)]
    pub checksum_type: ChecksumType,
}

fn default_mimetype() -> String {
    "application/octet-stream".to_string()
}

fn default_categories() -> Vec<String> {
    vec!["DATA".to_string()]
}

fn default_tab_ingest() -> bool {
    true
}

impl FileEntry {
    /// 用默认元数据构造一个文件描述
    pub fn new<P: AsRef<Path>>(filepath: P) -> Self {
        Self {
            filepath: filepath.as_ref().to_path_buf(),
            directory_label: None,
            description: None,
            mimetype: default_mimetype(),
            categories: default_categories(),
            restrict: false,
            tab_ingest: default_tab_ingest(),
            checksum_type: ChecksumType::default(),
        }
    }
}

/// 上传清单（YAML/JSON）
///
/// 对应命令行的 --config-path 文件。YAML 是 JSON 的超集，
/// 两种格式走同一个解析入口。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadManifest {
    /// 仓库基础 URL
    pub dataverse_url: String,
    /// API 令牌（对核心来说是不透明字符串）
    pub api_token: String,
    /// 数据集持久标识符
    pub persistent_id: String,
    /// 待上传文件列表
    pub files: Vec<FileEntry>,
    /// 并行上传文件数
    #[serde(default = "default_parallel_uploads")]
    pub n_parallel_uploads: usize,
    /// 调优参数覆盖（可选，优先于 app.toml）
    #[serde(default)]
    pub upload: Option<UploadConfig>,
}

impl UploadManifest {
    /// 从 YAML/JSON 文件加载清单
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取上传清单失败: {:?}", path))?;

        let manifest: UploadManifest =
            serde_yaml::from_str(&content).context("解析上传清单失败")?;

        Ok(manifest)
    }

    /// 合并出最终的调优配置
    ///
    /// 清单中的 upload 段优先，其次是应用配置，
    /// 清单的 n_parallel_uploads 始终生效。
    pub fn resolve_config(&self, app: &AppConfig) -> UploadConfig {
        let mut config = self.upload.clone().unwrap_or_else(|| app.upload.clone());
        config.n_parallel_uploads = self.n_parallel_uploads;
        config
    }
}
