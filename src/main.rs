use anyhow::Result;
use clap::Parser;
use dataverse_uploader_rust::{
    config::AppConfig, logging, DataverseClient, FileEntry, LogSink, UploadManager,
    UploadManifest,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// 把本地文件直传到 Dataverse 数据集
///
/// 两种用法：
/// - 命令行直接给文件路径，外加 --pid / --api-token / --dataverse-url
/// - --config-path 指向 YAML/JSON 上传清单（包含凭证和文件元数据）
#[derive(Parser, Debug)]
#[command(name = "dataverse-uploader", version, about = "Dataverse 直传客户端")]
struct Cli {
    /// 待上传的文件路径列表
    filepaths: Vec<PathBuf>,

    /// 数据集持久标识符（如 doi:10.5072/FK2/ABC123）
    #[arg(long)]
    pid: Option<String>,

    /// API 令牌
    #[arg(long)]
    api_token: Option<String>,

    /// 仓库基础 URL
    #[arg(long)]
    dataverse_url: Option<String>,

    /// 上传清单路径（YAML/JSON）
    #[arg(long)]
    config_path: Option<PathBuf>,

    /// 并行上传文件数
    #[arg(long, default_value_t = 1)]
    n_parallel: usize,
}

/// 从命令行参数或清单文件组装上传清单
async fn build_manifest(cli: &Cli) -> Result<UploadManifest> {
    if let Some(path) = &cli.config_path {
        if !cli.filepaths.is_empty() {
            anyhow::bail!("不能同时指定清单文件和文件路径列表");
        }
        let mut manifest = UploadManifest::load_from_file(path).await?;
        if cli.n_parallel != 1 {
            // 命令行显式指定的并行数覆盖清单
            manifest.n_parallel_uploads = cli.n_parallel;
        }
        return Ok(manifest);
    }

    if cli.filepaths.is_empty() {
        anyhow::bail!("没有指定要上传的文件，用文件路径参数或 --config-path 提供");
    }

    let (Some(pid), Some(api_token), Some(dataverse_url)) =
        (&cli.pid, &cli.api_token, &cli.dataverse_url)
    else {
        anyhow::bail!("缺少元数据参数：需要 --pid、--api-token、--dataverse-url，或改用 --config-path");
    };

    Ok(UploadManifest {
        dataverse_url: dataverse_url.clone(),
        api_token: api_token.clone(),
        persistent_id: pid.clone(),
        files: cli.filepaths.iter().map(FileEntry::new).collect(),
        n_parallel_uploads: cli.n_parallel,
        upload: None,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 先加载应用配置（失败时用默认值），再初始化日志
    let app_config = AppConfig::load_or_default("config/app.toml").await;
    let _log_guard = logging::init_logging(&app_config.log);

    info!("Dataverse Uploader v{} 启动", env!("CARGO_PKG_VERSION"));

    let manifest = build_manifest(&cli).await?;
    let config = manifest.resolve_config(&app_config);

    info!(
        "目标: {} / {} ({} 个文件, 并行 {})",
        manifest.dataverse_url,
        manifest.persistent_id,
        manifest.files.len(),
        config.n_parallel_uploads
    );

    let client = DataverseClient::new(
        &manifest.dataverse_url,
        &manifest.api_token,
        &manifest.persistent_id,
    )?;
    let manager = Arc::new(UploadManager::new(client, config, Arc::new(LogSink)));

    // Ctrl+C 触发显式全批中止，已在途的单元在检查点退出
    {
        let manager = manager.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("收到 Ctrl+C，中止剩余上传...");
                manager.abort_all();
            }
        });
    }

    let (results, summary) = manager.upload_all(manifest.files.clone()).await;

    for result in &results {
        if result.success {
            info!(
                "✓ {} -> {}",
                result.file_name,
                result.storage_identifier.as_deref().unwrap_or("-")
            );
        } else {
            warn!(
                "✗ {} [{}] {} (重试 {} 次)",
                result.file_name,
                result.error_kind.as_deref().unwrap_or("unknown"),
                result.error.as_deref().unwrap_or("-"),
                result.retries
            );
        }
    }

    info!(
        "完成: 共 {} 个, 成功 {}, 失败 {}",
        summary.total, summary.completed, summary.failed
    );

    if !summary.all_succeeded() {
        std::process::exit(1);
    }

    Ok(())
}
