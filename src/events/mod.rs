//! 上传进度事件
//!
//! 核心通过 EventSink 向外部观察者推送事件；观察者是协作方，
//! 不属于核心。单个单元的事件由其 runner 串行发出，
//! 因此同一单元内的事件顺序单调（completed 不会先于 uploading 类事件）。
//! 跨单元之间不保证任何顺序。

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// 默认进度节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

/// 上传事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 单元创建
    Created {
        unit_id: String,
        file_name: String,
        total_size: u64,
    },
    /// 状态变更
    StatusChanged {
        unit_id: String,
        old_status: String,
        new_status: String,
    },
    /// 进度更新（字节）
    Progress {
        unit_id: String,
        uploaded_size: u64,
        total_size: u64,
        progress: f64,
    },
    /// 单元完成
    Completed {
        unit_id: String,
        storage_identifier: String,
    },
    /// 单元失败
    Failed {
        unit_id: String,
        error_kind: String,
        error: String,
    },
    /// 整批结束
    BatchFinished {
        total: usize,
        completed: usize,
        failed: usize,
    },
}

/// 事件接收器
///
/// 由调用方实现；publish 必须快速返回，耗时处理放到接收端自己的队列里。
pub trait EventSink: Send + Sync {
    fn publish(&self, event: UploadEvent);
}

/// 丢弃所有事件的接收器
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: UploadEvent) {}
}

/// 写入 tracing 日志的接收器（CLI 默认）
pub struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, event: UploadEvent) {
        match &event {
            UploadEvent::Created {
                file_name,
                total_size,
                ..
            } => info!("开始上传: {} ({} bytes)", file_name, total_size),
            UploadEvent::StatusChanged {
                unit_id,
                old_status,
                new_status,
            } => info!("单元 {} 状态: {} -> {}", unit_id, old_status, new_status),
            UploadEvent::Progress {
                unit_id, progress, ..
            } => info!("单元 {} 进度: {:.1}%", unit_id, progress),
            UploadEvent::Completed {
                unit_id,
                storage_identifier,
            } => info!("单元 {} 完成: storage={}", unit_id, storage_identifier),
            UploadEvent::Failed {
                unit_id,
                error_kind,
                error,
            } => warn!("单元 {} 失败 [{}]: {}", unit_id, error_kind, error),
            UploadEvent::BatchFinished {
                total,
                completed,
                failed,
            } => info!("批次结束: 共 {} 个, 成功 {}, 失败 {}", total, completed, failed),
        }
    }
}

/// 进度事件节流器
///
/// 分片级进度更新频率很高，用时间门限压制事件风暴。
/// 原子 CAS 实现，多个分片任务共享时无锁竞争。
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 计时起点
    started: Instant,
    /// 上次放行的时间（相对起点的毫秒数）
    last_emit_ms: AtomicU64,
    /// 节流间隔（毫秒）
    interval_ms: u64,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            started: Instant::now(),
            last_emit_ms: AtomicU64::new(0),
            interval_ms: interval.as_millis() as u64,
        }
    }

    /// 是否放行本次进度事件
    ///
    /// 距上次放行超过间隔时返回 true 并原子推进时间戳；
    /// CAS 失败说明别的分片抢先放行，本次不发。
    pub fn should_emit(&self) -> bool {
        // 偏移 1ms，保证第一次调用必然放行
        let now_ms = self.started.elapsed().as_millis() as u64 + self.interval_ms + 1;
        let last = self.last_emit_ms.load(Ordering::Relaxed);

        if now_ms.saturating_sub(last) > self.interval_ms {
            self.last_emit_ms
                .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        } else {
            false
        }
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_THROTTLE_INTERVAL_MS))
    }
}
