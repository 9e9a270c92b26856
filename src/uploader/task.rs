// 上传单元定义
//
// 一个 UploadUnit 对应一个待上传文件，由唯一的 runner 独占驱动，
// 不会被两个 runner 并发修改。
// 生命周期: Pending -> Planned -> InProgress -> {Completed, Failed}
// 终态不可逆；失败的单元不会被整体自动重试（只有内部操作按策略重试）。

use crate::config::FileEntry;
use crate::error::{Result, UploadError};
use crate::uploader::checksum::{Checksum, ChecksumType};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// 上传单元状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    /// 等待中
    Pending,
    /// 已规划（策略已确定）
    Planned,
    /// 上传中
    InProgress,
    /// 已完成
    Completed,
    /// 失败
    Failed,
}

/// 上传策略
///
/// 在 Pending -> Planned 转换时一次性确定，
/// 下游代码只对这个带标签的变体做分支。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum UploadStrategy {
    /// 单包直传
    SingleShot,
    /// 分片上传
    Multipart {
        /// 协商的分片大小
        part_size: u64,
        /// 分片总数
        total_chunks: usize,
    },
}

/// 上传单元
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadUnit {
    /// 单元ID
    pub id: String,
    /// 本地文件路径
    pub filepath: PathBuf,
    /// 文件名
    pub file_name: String,
    /// 数据集内目标子目录
    pub directory_label: Option<String>,
    /// 文件描述
    pub description: Option<String>,
    /// MIME 类型
    pub mime_type: String,
    /// 分类标签
    pub categories: Vec<String>,
    /// 是否受限访问
    pub restrict: bool,
    /// 是否进行表格摄取
    pub tab_ingest: bool,
    /// 校验和算法
    pub checksum_type: ChecksumType,
    /// 文件大小（构造时解析）
    pub total_size: u64,
    /// 已上传大小
    pub uploaded_size: u64,
    /// 单元状态
    pub status: UnitStatus,
    /// 上传策略（Planned 时填充）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<UploadStrategy>,
    /// 存储标识符（控制 API 分配后填充）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_identifier: Option<String>,
    /// 文件校验和（传输前计算）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
    /// 错误信息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 消耗的重试次数
    pub retries: u32,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 完成时间 (Unix timestamp)
    pub completed_at: Option<i64>,
    /// 总分片数（单包为 1）
    pub total_chunks: usize,
    /// 已完成分片数
    pub completed_chunks: usize,
}

impl UploadUnit {
    /// 从文件描述构造上传单元
    ///
    /// 构造时即校验：路径存在、是文件，并解析字节大小。
    /// 校验失败返回 ValidationError，不触发任何重试。
    pub async fn from_entry(entry: FileEntry) -> Result<Self> {
        let metadata = tokio::fs::metadata(&entry.filepath).await.map_err(|e| {
            UploadError::Validation(format!("文件不存在或不可读 {:?}: {}", entry.filepath, e))
        })?;

        if metadata.is_dir() {
            return Err(UploadError::Validation(format!(
                "路径是目录而不是文件: {:?}",
                entry.filepath
            )));
        }

        let file_name = entry
            .filepath
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.to_string())
            .ok_or_else(|| {
                UploadError::Validation(format!("无法解析文件名: {:?}", entry.filepath))
            })?;

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            filepath: entry.filepath,
            file_name,
            directory_label: entry.directory_label,
            description: entry.description,
            mime_type: entry.mimetype,
            categories: entry.categories,
            restrict: entry.restrict,
            tab_ingest: entry.tab_ingest,
            checksum_type: entry.checksum_type,
            total_size: metadata.len(),
            uploaded_size: 0,
            status: UnitStatus::Pending,
            strategy: None,
            storage_identifier: None,
            checksum: None,
            error: None,
            retries: 0,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
            total_chunks: 0,
            completed_chunks: 0,
        })
    }

    /// 进度百分比
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return if self.status == UnitStatus::Completed {
                100.0
            } else {
                0.0
            };
        }
        (self.uploaded_size as f64 / self.total_size as f64) * 100.0
    }

    /// 标记为已规划（策略确定）
    pub fn mark_planned(&mut self, strategy: UploadStrategy) {
        self.total_chunks = match &strategy {
            UploadStrategy::SingleShot => 1,
            UploadStrategy::Multipart { total_chunks, .. } => *total_chunks,
        };
        self.strategy = Some(strategy);
        self.status = UnitStatus::Planned;
    }

    /// 标记为上传中
    pub fn mark_in_progress(&mut self) {
        self.status = UnitStatus::InProgress;
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
    }

    /// 标记为已完成
    pub fn mark_completed(&mut self) {
        self.status = UnitStatus::Completed;
        self.completed_at = Some(chrono::Utc::now().timestamp());
        self.uploaded_size = self.total_size;
        self.completed_chunks = self.total_chunks;
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, error: String) {
        self.status = UnitStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }

    /// 是否已进入终态
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, UnitStatus::Completed | UnitStatus::Failed)
    }
}

/// 单个上传单元的终态记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResult {
    /// 单元ID
    pub unit_id: String,
    /// 文件名
    pub file_name: String,
    /// 是否成功
    pub success: bool,
    /// 存储标识符（成功时）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_identifier: Option<String>,
    /// 错误分类（失败时）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    /// 错误信息（失败时）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 消耗的重试次数
    pub retries: u32,
}

impl UploadResult {
    /// 从完成的单元生成成功记录
    pub fn completed(unit: &UploadUnit) -> Self {
        Self {
            unit_id: unit.id.clone(),
            file_name: unit.file_name.clone(),
            success: true,
            storage_identifier: unit.storage_identifier.clone(),
            error_kind: None,
            error: None,
            retries: unit.retries,
        }
    }

    /// 从失败的单元生成失败记录
    pub fn failed(unit: &UploadUnit, error: &UploadError) -> Self {
        Self {
            unit_id: unit.id.clone(),
            file_name: unit.file_name.clone(),
            success: false,
            storage_identifier: None,
            error_kind: Some(error.kind().to_string()),
            error: Some(error.to_string()),
            retries: unit.retries,
        }
    }
}

/// 整批上传的汇总
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    /// 单元总数
    pub total: usize,
    /// 成功数
    pub completed: usize,
    /// 失败数
    pub failed: usize,
}

impl BatchSummary {
    pub fn from_results(results: &[UploadResult]) -> Self {
        let completed = results.iter().filter(|r| r.success).count();
        Self {
            total: results.len(),
            completed,
            failed: results.len() - completed,
        }
    }

    /// 整批是否全部成功
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}
