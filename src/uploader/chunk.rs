// 上传分片规划与状态管理
//
// 分片规则：
// - 分片大小由控制 API 在分配票据时协商（partSize），不在本地猜测
// - 分片按偏移严格递增、互不重叠，长度之和恰好等于文件大小
// - 只有最后一个分片允许短于协商的分片大小
// - 空文件不产生分片，走单包路径

use crate::error::{Result, UploadError};
use std::ops::Range;
use tracing::debug;

/// 上传分片
#[derive(Debug, Clone)]
pub struct UploadChunk {
    /// 分片索引（从 0 开始）
    pub index: usize,
    /// 字节范围
    pub range: Range<u64>,
    /// 是否已完成
    pub completed: bool,
    /// 完整性令牌（上传后由存储端返回，如 ETag）
    pub etag: Option<String>,
    /// 该分片消耗的重试次数
    pub retries: u32,
}

impl UploadChunk {
    pub fn new(index: usize, range: Range<u64>) -> Self {
        Self {
            index,
            range,
            completed: false,
            etag: None,
            retries: 0,
        }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    /// 分片起始偏移
    pub fn offset(&self) -> u64 {
        self.range.start
    }
}

/// 计算分片列表
///
/// # 参数
/// * `total_size` - 文件总大小
/// * `part_size` - 协商的分片大小
///
/// # 返回
/// 偏移递增、互不重叠、恰好覆盖整个文件的分片列表；
/// 空文件返回空列表。
pub fn plan_chunks(total_size: u64, part_size: u64) -> Result<Vec<UploadChunk>> {
    if total_size == 0 {
        return Ok(Vec::new());
    }
    if part_size == 0 {
        // 分片大小由控制 API 协商，0 说明上游契约被破坏
        return Err(UploadError::Packaging(
            "协商的分片大小为 0".to_string(),
        ));
    }

    let mut chunks = Vec::with_capacity(total_size.div_ceil(part_size) as usize);
    let mut offset = 0u64;
    let mut index = 0;

    while offset < total_size {
        let end = std::cmp::min(offset + part_size, total_size);
        chunks.push(UploadChunk::new(index, offset..end));
        offset = end;
        index += 1;
    }

    Ok(chunks)
}

/// 分片状态管理器
///
/// 归一个上传单元独占，记录每个分片的完成状态和完整性令牌，
/// 为 completeMultipart 提供升序的令牌列表。
#[derive(Debug)]
pub struct ChunkManager {
    /// 所有分片
    chunks: Vec<UploadChunk>,
    /// 文件总大小
    total_size: u64,
}

impl ChunkManager {
    /// 创建分片管理器
    pub fn new(total_size: u64, part_size: u64) -> Result<Self> {
        let chunks = plan_chunks(total_size, part_size)?;

        debug!(
            "创建分片管理器: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
            total_size,
            part_size,
            chunks.len()
        );

        Ok(Self { chunks, total_size })
    }

    /// 获取所有分片
    pub fn chunks(&self) -> &[UploadChunk] {
        &self.chunks
    }

    /// 分片数量
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// 已完成的分片数量
    pub fn completed_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.completed).count()
    }

    /// 已上传的字节数
    pub fn uploaded_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| c.completed)
            .map(|c| c.size())
            .sum()
    }

    /// 上传进度（0-100）
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        (self.uploaded_bytes() as f64 / self.total_size as f64) * 100.0
    }

    /// 是否全部完成
    pub fn is_completed(&self) -> bool {
        self.chunks.iter().all(|c| c.completed)
    }

    /// 标记分片完成并记录完整性令牌
    pub fn mark_completed(&mut self, index: usize, etag: String, retries: u32) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.completed = true;
            chunk.etag = Some(etag);
            chunk.retries = retries;
        }
    }

    /// 记录失败分片消耗的重试次数（不标记完成）
    pub fn record_retries(&mut self, index: usize, retries: u32) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.retries = retries;
        }
    }

    /// 所有分片消耗的重试总数
    pub fn total_retries(&self) -> u32 {
        self.chunks.iter().map(|c| c.retries).sum()
    }

    /// 按分片索引升序返回 (索引, 令牌) 列表
    ///
    /// 只有全部分片都持有令牌时才可调用，否则说明完成屏障被绕过。
    pub fn etag_list(&self) -> Result<Vec<(usize, String)>> {
        let mut list = Vec::with_capacity(self.chunks.len());
        for chunk in &self.chunks {
            match &chunk.etag {
                Some(etag) => list.push((chunk.index, etag.clone())),
                None => {
                    return Err(UploadError::Packaging(format!(
                        "分片 #{} 缺少完整性令牌，无法合并",
                        chunk.index
                    )))
                }
            }
        }
        Ok(list)
    }
}
