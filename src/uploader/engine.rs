// 上传引擎
//
// 驱动单个上传单元的完整生命周期：
// 1. 计算文件校验和（注册负载需要）
// 2. 请求上传票据，一次性确定单包/分片策略（Pending -> Planned）
// 3. 单包直传，或在信号量约束下并发分片上传（Planned -> InProgress）
// 4. 所有分片拿到完整性令牌后按序合并（完成屏障）
// 5. 注册文件元数据（InProgress -> Completed）
//
// 不可重试错误和重试预算耗尽都让单元进入 Failed；
// 分片失败时不强行打断同单元在途分片（单写者），
// 随后尽力调用 abort 丢弃孤儿分片，且绝不发起注册。

use crate::config::UploadConfig;
use crate::dataverse::{DataverseClient, FileMetadata, UploadTicket};
use crate::error::{Result, UploadError};
use crate::events::{EventSink, ProgressThrottler, UploadEvent};
use crate::uploader::checksum::compute_checksum;
use crate::uploader::chunk::{plan_chunks, ChunkManager, UploadChunk};
use crate::uploader::retry::RetryPolicy;
use crate::uploader::stream;
use crate::uploader::task::{UploadResult, UploadStrategy, UploadUnit};
use crate::uploader::unit_chunk_limit;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 上传引擎
///
/// 无单元状态，可被编排器为每个单元复用；
/// 单元本身由 run() 独占持有。
pub struct UploadEngine {
    /// 控制 API 客户端
    client: DataverseClient,
    /// 调优配置（只读快照）
    config: Arc<UploadConfig>,
    /// 重试策略
    retry: RetryPolicy,
    /// 池级分片槽位（所有单元共享，约束总并发网络操作数）
    chunk_slots: Arc<Semaphore>,
    /// 取消令牌
    cancel_token: CancellationToken,
    /// 事件接收器
    sink: Arc<dyn EventSink>,
}

impl UploadEngine {
    pub fn new(
        client: DataverseClient,
        config: Arc<UploadConfig>,
        chunk_slots: Arc<Semaphore>,
        cancel_token: CancellationToken,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            client,
            config,
            retry,
            chunk_slots,
            cancel_token,
            sink,
        }
    }

    /// 驱动一个单元到终态
    ///
    /// 任何错误都被吸收为 Failed 终态记录，绝不向上抛异常。
    pub async fn run(&self, mut unit: UploadUnit) -> (UploadUnit, UploadResult) {
        self.sink.publish(UploadEvent::Created {
            unit_id: unit.id.clone(),
            file_name: unit.file_name.clone(),
            total_size: unit.total_size,
        });

        let retries = Arc::new(AtomicU32::new(0));
        let outcome = self.drive(&mut unit, &retries).await;
        unit.retries = retries.load(Ordering::SeqCst);

        match outcome {
            Ok(()) => {
                unit.mark_completed();
                info!(
                    "上传完成: {} -> {}",
                    unit.file_name,
                    unit.storage_identifier.as_deref().unwrap_or("-")
                );
                self.sink.publish(UploadEvent::Completed {
                    unit_id: unit.id.clone(),
                    storage_identifier: unit
                        .storage_identifier
                        .clone()
                        .unwrap_or_default(),
                });
                let result = UploadResult::completed(&unit);
                (unit, result)
            }
            Err(e) => {
                warn!("上传失败: {} ({})", unit.file_name, e);
                unit.mark_failed(e.to_string());
                self.sink.publish(UploadEvent::Failed {
                    unit_id: unit.id.clone(),
                    error_kind: e.kind().to_string(),
                    error: e.to_string(),
                });
                let result = UploadResult::failed(&unit, &e);
                (unit, result)
            }
        }
    }

    /// 单元生命周期主干
    async fn drive(&self, unit: &mut UploadUnit, retries: &Arc<AtomicU32>) -> Result<()> {
        if self.cancel_token.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        // 1. 校验和（传输前计算，注册时随元数据提交）
        let checksum = compute_checksum(&unit.filepath, unit.checksum_type).await?;
        unit.checksum = Some(checksum);

        // 2. 请求票据（带重试），确定策略
        let size = unit.total_size;
        let (result, state) = self
            .retry
            .run("allocate", || self.client.request_ticket(size))
            .await;
        retries.fetch_add(state.retries(), Ordering::SeqCst);
        let ticket = result?;

        unit.storage_identifier = Some(ticket.storage_identifier.clone());

        let strategy = self.decide_strategy(unit, &ticket)?;
        unit.mark_planned(strategy.clone());
        self.publish_status(unit, "pending", "planned");

        // 3. 传输
        unit.mark_in_progress();
        self.publish_status(unit, "planned", "in_progress");

        match strategy {
            UploadStrategy::SingleShot => {
                self.upload_single_shot(unit, &ticket, retries).await?
            }
            UploadStrategy::Multipart { part_size, .. } => {
                self.upload_multipart(unit, &ticket, part_size, retries)
                    .await?
            }
        }

        // 4. 注册（带重试，摄取锁冲突在这里被吸收）
        let metadata = FileMetadata::from_unit(unit)?;
        let (result, state) = self
            .retry
            .run("register", || {
                self.client.register_files(std::slice::from_ref(&metadata))
            })
            .await;
        retries.fetch_add(state.retries(), Ordering::SeqCst);
        result?;

        Ok(())
    }

    /// 策略决定（Pending -> Planned 的一次性判断）
    ///
    /// 边界策略：大小 ≤ 单包上限走单包，严格大于走分片。
    /// 空文件总是单包。超阈值却只拿到单个 URL、或分片 URL 数量
    /// 与分片规划不一致，都是上游契约错误。
    fn decide_strategy(&self, unit: &UploadUnit, ticket: &UploadTicket) -> Result<UploadStrategy> {
        if !ticket.is_multipart() {
            if unit.total_size > self.config.max_package_size {
                return Err(UploadError::Packaging(format!(
                    "文件大小 {} 超过单包上限 {}，但票据只有单个 URL",
                    unit.total_size, self.config.max_package_size
                )));
            }
            return Ok(UploadStrategy::SingleShot);
        }

        let part_size = ticket
            .part_size
            .ok_or_else(|| UploadError::Packaging("分片票据缺少 partSize".to_string()))?;
        let chunks = plan_chunks(unit.total_size, part_size)?;
        let urls = ticket.part_urls()?;

        if urls.len() != chunks.len() {
            return Err(UploadError::Packaging(format!(
                "分片 URL 数量 ({}) 与分片规划 ({}) 不一致",
                urls.len(),
                chunks.len()
            )));
        }

        Ok(UploadStrategy::Multipart {
            part_size,
            total_chunks: chunks.len(),
        })
    }

    /// 单包直传
    async fn upload_single_shot(
        &self,
        unit: &mut UploadUnit,
        ticket: &UploadTicket,
        retries: &Arc<AtomicU32>,
    ) -> Result<()> {
        let url = ticket
            .url
            .clone()
            .ok_or_else(|| UploadError::Packaging("单包票据缺少 url".to_string()))?;
        let path = unit.filepath.clone();
        let size = unit.total_size;
        let cancel_token = self.cancel_token.clone();

        debug!("单包直传: {} ({} bytes)", unit.file_name, size);

        // 单包传输同样占用一个池级分片槽位，保持总并发网络操作数有界
        let _permit = self
            .chunk_slots
            .acquire()
            .await
            .map_err(|_| UploadError::Cancelled)?;

        // 请求体流不可重放，每次尝试重新打开文件
        let (result, state) = self
            .retry
            .run("upload", || {
                let client = self.client.clone();
                let url = url.clone();
                let path = path.clone();
                let cancel_token = cancel_token.clone();
                async move {
                    if cancel_token.is_cancelled() {
                        return Err(UploadError::Cancelled);
                    }
                    let body = stream::open_file_body(&path, size).await?;
                    client.upload_single(&url, body, size).await
                }
            })
            .await;
        retries.fetch_add(state.retries(), Ordering::SeqCst);
        result?;

        unit.uploaded_size = size;
        unit.completed_chunks = 1;
        self.sink.publish(UploadEvent::Progress {
            unit_id: unit.id.clone(),
            uploaded_size: size,
            total_size: size,
            progress: 100.0,
        });

        Ok(())
    }

    /// 分片上传（并发模式）
    ///
    /// 两级并发约束：单元级上限由文件大小推导，池级槽位全局共享。
    async fn upload_multipart(
        &self,
        unit: &mut UploadUnit,
        ticket: &UploadTicket,
        part_size: u64,
        retries: &Arc<AtomicU32>,
    ) -> Result<()> {
        let chunks = plan_chunks(unit.total_size, part_size)?;
        let urls = ticket.part_urls()?;
        let chunk_count = chunks.len();

        let max_concurrent = unit_chunk_limit(unit.total_size);
        info!(
            "[并发上传] {}: {} 个分片, 单元级并发上限: {}",
            unit.file_name, chunk_count, max_concurrent
        );

        let manager = Arc::new(Mutex::new(ChunkManager::new(unit.total_size, part_size)?));
        let uploaded_bytes = Arc::new(AtomicU64::new(0));
        let throttler = Arc::new(ProgressThrottler::default());
        let unit_slots = Arc::new(Semaphore::new(max_concurrent));

        let mut join_set: JoinSet<Result<()>> = JoinSet::new();

        for (chunk, url) in chunks.into_iter().zip(urls) {
            if self.cancel_token.is_cancelled() {
                join_set.abort_all();
                self.try_abort(ticket).await;
                return Err(UploadError::Cancelled);
            }

            // 先占单元级槽位，再占池级槽位；两个守卫都随任务结束释放
            let unit_permit = unit_slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| UploadError::Cancelled)?;
            let pool_permit = self
                .chunk_slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| UploadError::Cancelled)?;

            let ctx = ChunkContext {
                client: self.client.clone(),
                retry: self.retry.clone(),
                path: unit.filepath.clone(),
                unit_id: unit.id.clone(),
                total_size: unit.total_size,
                manager: manager.clone(),
                uploaded_bytes: uploaded_bytes.clone(),
                throttler: throttler.clone(),
                sink: self.sink.clone(),
                cancel_token: self.cancel_token.clone(),
            };

            join_set.spawn(async move {
                let result = upload_one_chunk(ctx, chunk, url).await;
                drop(pool_permit);
                drop(unit_permit);
                result
            });
        }

        // 完成屏障：等待所有分片任务结束，首个错误保留，其余任其自然收尾
        let mut first_error: Option<UploadError> = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(UploadError::Packaging(format!(
                            "分片任务异常: {}",
                            e
                        )));
                    }
                }
            }
        }

        {
            let m = manager.lock().await;
            unit.completed_chunks = m.completed_count();
            unit.uploaded_size = m.uploaded_bytes();
            retries.fetch_add(m.total_retries(), Ordering::SeqCst);
        }

        if let Some(e) = first_error {
            self.try_abort(ticket).await;
            return Err(e);
        }

        info!("[并发上传] {}: 所有 {} 个分片完成", unit.file_name, chunk_count);

        // 合并分片：令牌按索引严格升序（带重试）
        let etags = manager.lock().await.etag_list()?;
        let complete_url = ticket
            .complete
            .clone()
            .ok_or_else(|| UploadError::Packaging("分片票据缺少 complete URL".to_string()))?;

        let (result, state) = self
            .retry
            .run("complete", || {
                self.client.complete_multipart(&complete_url, &etags)
            })
            .await;
        retries.fetch_add(state.retries(), Ordering::SeqCst);
        result?;

        Ok(())
    }

    /// 尽力丢弃孤儿分片；abort 失败只记日志，不改变单元结局
    async fn try_abort(&self, ticket: &UploadTicket) {
        if let Some(abort_url) = &ticket.abort {
            if let Err(e) = self.client.abort_multipart(abort_url).await {
                warn!("放弃分片上传失败（忽略）: {}", e);
            }
        }
    }

    fn publish_status(&self, unit: &UploadUnit, old_status: &str, new_status: &str) {
        self.sink.publish(UploadEvent::StatusChanged {
            unit_id: unit.id.clone(),
            old_status: old_status.to_string(),
            new_status: new_status.to_string(),
        });
    }
}

/// 单个分片任务携带的共享上下文
struct ChunkContext {
    client: DataverseClient,
    retry: RetryPolicy,
    path: PathBuf,
    unit_id: String,
    total_size: u64,
    manager: Arc<Mutex<ChunkManager>>,
    uploaded_bytes: Arc<AtomicU64>,
    throttler: Arc<ProgressThrottler>,
    sink: Arc<dyn EventSink>,
    cancel_token: CancellationToken,
}

/// 上传单个分片（带重试），成功后记录完整性令牌并推进进度
async fn upload_one_chunk(ctx: ChunkContext, chunk: UploadChunk, url: String) -> Result<()> {
    let offset = chunk.offset();
    let len = chunk.size();

    debug!(
        "[分片#{}] 开始上传 (范围: {}-{}, 大小: {} bytes)",
        chunk.index,
        offset,
        chunk.range.end - 1,
        len
    );

    let op_name = format!("chunk#{}", chunk.index);
    let (result, state) = ctx
        .retry
        .run(&op_name, || {
            let client = ctx.client.clone();
            let url = url.clone();
            let path = ctx.path.clone();
            let cancel_token = ctx.cancel_token.clone();
            async move {
                if cancel_token.is_cancelled() {
                    return Err(UploadError::Cancelled);
                }
                // 流不可重放，每次尝试重新打开范围
                let body = stream::open_range_body(&path, offset, len).await?;
                client.upload_part(&url, body, len).await
            }
        })
        .await;

    let etag = match result {
        Ok(etag) => etag,
        Err(e) => {
            // 失败分片的重试消耗也要计入单元
            ctx.manager
                .lock()
                .await
                .record_retries(chunk.index, state.retries());
            return Err(e);
        }
    };

    let new_uploaded = ctx.uploaded_bytes.fetch_add(len, Ordering::SeqCst) + len;

    let (completed, total) = {
        let mut m = ctx.manager.lock().await;
        m.mark_completed(chunk.index, etag, state.retries());
        (m.completed_count(), m.chunk_count())
    };

    if ctx.throttler.should_emit() {
        ctx.sink.publish(UploadEvent::Progress {
            unit_id: ctx.unit_id.clone(),
            uploaded_size: new_uploaded,
            total_size: ctx.total_size,
            progress: (new_uploaded as f64 / ctx.total_size as f64) * 100.0,
        });
    }

    info!("[分片#{}] 上传成功 ({}/{} 完成)", chunk.index, completed, total);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const THRESHOLD: u64 = 1024;

    fn test_engine() -> UploadEngine {
        let config = UploadConfig {
            max_package_size: THRESHOLD,
            ..UploadConfig::default()
        };
        let client =
            DataverseClient::new("https://demo.dataverse.org", "token", "doi:10.5072/FK2/X")
                .unwrap();
        UploadEngine::new(
            client,
            Arc::new(config),
            Arc::new(Semaphore::new(2)),
            CancellationToken::new(),
            Arc::new(NullSink),
        )
    }

    async fn unit_of_size(size: usize) -> UploadUnit {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&vec![0u8; size]).unwrap();
        // 临时文件随返回 drop，策略判断只看 size，不再碰文件
        UploadUnit::from_entry(crate::config::FileEntry::new(file.path()))
            .await
            .unwrap()
    }

    fn single_ticket() -> UploadTicket {
        UploadTicket {
            url: Some("https://bucket.s3.amazonaws.com/key?sig=abc".to_string()),
            urls: None,
            abort: None,
            complete: None,
            part_size: Some(THRESHOLD),
            storage_identifier: "s3://bucket:abc".to_string(),
        }
    }

    fn multipart_ticket(part_urls: usize) -> UploadTicket {
        let urls = (1..=part_urls)
            .map(|i| (i.to_string(), format!("https://bucket.s3/part/{}", i)))
            .collect();
        UploadTicket {
            url: None,
            urls: Some(urls),
            abort: Some("/api/datasets/mpupload?a".to_string()),
            complete: Some("/api/datasets/mpupload?c".to_string()),
            part_size: Some(THRESHOLD),
            storage_identifier: "s3://bucket:abc".to_string(),
        }
    }

    #[tokio::test]
    async fn test_strategy_below_threshold_is_single_shot() {
        let engine = test_engine();
        let unit = unit_of_size((THRESHOLD - 1) as usize).await;

        let strategy = engine.decide_strategy(&unit, &single_ticket()).unwrap();
        assert_eq!(strategy, UploadStrategy::SingleShot);
    }

    #[tokio::test]
    async fn test_strategy_at_threshold_is_single_shot() {
        // 边界策略：恰好等于单包上限仍走单包
        let engine = test_engine();
        let unit = unit_of_size(THRESHOLD as usize).await;

        let strategy = engine.decide_strategy(&unit, &single_ticket()).unwrap();
        assert_eq!(strategy, UploadStrategy::SingleShot);
    }

    #[tokio::test]
    async fn test_strategy_above_threshold_is_multipart() {
        // threshold+1 字节、分片大小 threshold -> 2 个分片
        let engine = test_engine();
        let unit = unit_of_size((THRESHOLD + 1) as usize).await;

        let strategy = engine.decide_strategy(&unit, &multipart_ticket(2)).unwrap();
        assert_eq!(
            strategy,
            UploadStrategy::Multipart {
                part_size: THRESHOLD,
                total_chunks: 2,
            }
        );
    }

    #[tokio::test]
    async fn test_strategy_oversize_single_ticket_rejected() {
        // 超过阈值却只有单个 URL：上游契约错误
        let engine = test_engine();
        let unit = unit_of_size((THRESHOLD + 1) as usize).await;

        let err = engine.decide_strategy(&unit, &single_ticket()).unwrap_err();
        assert!(matches!(err, UploadError::Packaging(_)));
    }

    #[tokio::test]
    async fn test_strategy_url_count_mismatch_rejected() {
        // 规划出 2 个分片却拿到 3 个 URL
        let engine = test_engine();
        let unit = unit_of_size((THRESHOLD + 1) as usize).await;

        let err = engine
            .decide_strategy(&unit, &multipart_ticket(3))
            .unwrap_err();
        assert!(matches!(err, UploadError::Packaging(_)));
    }

    #[tokio::test]
    async fn test_strategy_empty_file_is_single_shot() {
        let engine = test_engine();
        let unit = unit_of_size(0).await;

        let strategy = engine.decide_strategy(&unit, &single_ticket()).unwrap();
        assert_eq!(strategy, UploadStrategy::SingleShot);
    }
}
