// 上传引擎模块
//
// 单元生命周期: Pending -> Planned -> InProgress -> {Completed, Failed}
// 并发模型是两级的：编排器限制同时处理的单元数，
// 池级分片槽位限制总的在途网络操作数。

pub mod checksum;
pub mod chunk;
pub mod engine;
pub mod manager;
pub mod retry;
pub mod stream;
pub mod task;

pub use checksum::{compute_checksum, Checksum, ChecksumType};
pub use chunk::{plan_chunks, ChunkManager, UploadChunk};
pub use engine::UploadEngine;
pub use manager::UploadManager;
pub use retry::{RetryPolicy, RetryState};
pub use task::{BatchSummary, UnitStatus, UploadResult, UploadStrategy, UploadUnit};

/// 根据文件大小计算单元内最大并发分片数
///
/// 上传侧保守取值，避免触发存储端限流；
/// 小文件单线程，大文件最多 4 线程。
///
/// # 参数
/// * `file_size` - 文件大小（字节）
///
/// # 返回
/// 单元内最大并发分片数
pub fn unit_chunk_limit(file_size: u64) -> usize {
    match file_size {
        0..=100_000_000 => 1,             // <100MB: 单线程最佳
        100_000_001..=500_000_000 => 2,   // 100MB-500MB: 2线程
        500_000_001..=1_073_741_824 => 3, // 500MB-1GB: 3线程
        _ => 4,                           // >1GB: 最多4线程
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_chunk_limit_ladder() {
        assert_eq!(unit_chunk_limit(0), 1);
        assert_eq!(unit_chunk_limit(50_000_000), 1);
        assert_eq!(unit_chunk_limit(200_000_000), 2);
        assert_eq!(unit_chunk_limit(800_000_000), 3);
        assert_eq!(unit_chunk_limit(5_000_000_000), 4);
    }
}
