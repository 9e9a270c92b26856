// 上传编排器
//
// 接收整批上传单元和配置，负责：
// - 单元级并发：信号量限制同时处于 InProgress 的单元数（n_parallel_uploads）
// - 分片级并发：池级分片槽位全所有单元共享，总并发网络操作数有界
// - 每个单元必然产出一条 UploadResult；单元失败被记录，不打断整批
// - abort_all() 提供显式的全批中止开关（默认单元之间互不牵连）

use crate::config::{FileEntry, UploadConfig};
use crate::dataverse::DataverseClient;
use crate::error::UploadError;
use crate::events::{EventSink, NullSink, UploadEvent};
use crate::uploader::engine::UploadEngine;
use crate::uploader::task::{BatchSummary, UploadResult, UploadUnit};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// 上传编排器
pub struct UploadManager {
    /// 控制 API 客户端
    client: DataverseClient,
    /// 调优配置（只读快照）
    config: Arc<UploadConfig>,
    /// 事件接收器
    sink: Arc<dyn EventSink>,
    /// 全批取消令牌
    cancel_token: CancellationToken,
    /// 单元级槽位
    unit_slots: Arc<Semaphore>,
    /// 池级分片槽位（与单元级同源，见 DESIGN.md）
    chunk_slots: Arc<Semaphore>,
    /// 活跃单元注册表（unit_id -> 文件名）
    active: Arc<DashMap<String, String>>,
}

impl UploadManager {
    /// 创建编排器
    pub fn new(client: DataverseClient, config: UploadConfig, sink: Arc<dyn EventSink>) -> Self {
        let n_parallel = config.n_parallel_uploads.max(1);

        info!(
            "创建上传编排器: 并行单元数={}, 最大重试={}, 单包上限={} bytes",
            n_parallel, config.max_retries, config.max_package_size
        );

        Self {
            client,
            config: Arc::new(config),
            sink,
            cancel_token: CancellationToken::new(),
            unit_slots: Arc::new(Semaphore::new(n_parallel)),
            chunk_slots: Arc::new(Semaphore::new(n_parallel)),
            active: Arc::new(DashMap::new()),
        }
    }

    /// 创建不推送事件的编排器
    pub fn with_null_sink(client: DataverseClient, config: UploadConfig) -> Self {
        Self::new(client, config, Arc::new(NullSink))
    }

    /// 显式中止整批上传
    ///
    /// 在途单元会在下一个检查点失败为 Cancelled，已完成的不受影响。
    pub fn abort_all(&self) {
        info!("收到全批中止请求");
        self.cancel_token.cancel();
    }

    /// 当前活跃单元数
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// 当前活跃单元列表 (unit_id, 文件名)
    pub fn active_units(&self) -> Vec<(String, String)> {
        self.active
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// 校验文件描述并构造上传单元
    ///
    /// 校验失败（文件不存在等）立即生成失败记录，不进入上传流程，
    /// 也不触发任何重试。
    pub async fn prepare_units(
        &self,
        entries: Vec<FileEntry>,
    ) -> (Vec<UploadUnit>, Vec<UploadResult>) {
        let outcomes = futures::future::join_all(
            entries
                .into_iter()
                .map(|entry| async move { (entry.filepath.clone(), UploadUnit::from_entry(entry).await) }),
        )
        .await;

        let mut units = Vec::new();
        let mut rejected = Vec::new();

        for (filepath, outcome) in outcomes {
            match outcome {
                Ok(unit) => units.push(unit),
                Err(e) => {
                    let file_name = filepath
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| filepath.to_string_lossy().to_string());
                    error!("跳过无效文件 {:?}: {}", filepath, e);
                    rejected.push(UploadResult {
                        unit_id: String::new(),
                        file_name,
                        success: false,
                        storage_identifier: None,
                        error_kind: Some(e.kind().to_string()),
                        error: Some(e.to_string()),
                        retries: 0,
                    });
                }
            }
        }

        (units, rejected)
    }

    /// 上传一组已构造的单元，按完成顺序收集结果
    pub async fn upload_units(&self, units: Vec<UploadUnit>) -> Vec<UploadResult> {
        let mut join_set: JoinSet<UploadResult> = JoinSet::new();

        for unit in units {
            let engine = UploadEngine::new(
                self.client.clone(),
                self.config.clone(),
                self.chunk_slots.clone(),
                self.cancel_token.clone(),
                self.sink.clone(),
            );
            let unit_slots = self.unit_slots.clone();
            let cancel_token = self.cancel_token.clone();
            let active = self.active.clone();

            join_set.spawn(async move {
                // 占到单元级槽位才开始；等待期间收到中止则直接失败
                let _permit = tokio::select! {
                    permit = unit_slots.acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => return cancelled_result(unit),
                    },
                    _ = cancel_token.cancelled() => return cancelled_result(unit),
                };

                if cancel_token.is_cancelled() {
                    return cancelled_result(unit);
                }

                active.insert(unit.id.clone(), unit.file_name.clone());
                let unit_id = unit.id.clone();
                let (_unit, result) = engine.run(unit).await;
                active.remove(&unit_id);

                result
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => {
                    // 任务 panic：记录并合成一条失败记录，保证每单元都有结果
                    error!("上传任务异常: {}", e);
                    results.push(UploadResult {
                        unit_id: String::new(),
                        file_name: String::new(),
                        success: false,
                        storage_identifier: None,
                        error_kind: Some("packaging".to_string()),
                        error: Some(format!("上传任务异常: {}", e)),
                        retries: 0,
                    });
                }
            }
        }

        results
    }

    /// 上传整批文件：校验、调度、汇总
    ///
    /// 永远不向上抛单元级错误；返回每个单元的终态记录和整批汇总。
    pub async fn upload_all(&self, entries: Vec<FileEntry>) -> (Vec<UploadResult>, BatchSummary) {
        let total = entries.len();
        info!(
            "开始批量上传: {} 个文件, 数据集 {}",
            total,
            self.client.persistent_id()
        );

        let (units, mut results) = self.prepare_units(entries).await;
        results.extend(self.upload_units(units).await);

        let summary = BatchSummary::from_results(&results);
        info!(
            "批量上传结束: 共 {} 个, 成功 {}, 失败 {}",
            summary.total, summary.completed, summary.failed
        );

        self.sink.publish(UploadEvent::BatchFinished {
            total: summary.total,
            completed: summary.completed,
            failed: summary.failed,
        });

        (results, summary)
    }
}

/// 单元在开始前就被中止时的终态记录
fn cancelled_result(mut unit: UploadUnit) -> UploadResult {
    unit.mark_failed(UploadError::Cancelled.to_string());
    UploadResult::failed(&unit, &UploadError::Cancelled)
}
