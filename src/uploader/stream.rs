// 分片字节流读取
//
// 按分片的字节范围打开独立文件句柄，以流式请求体发送，
// 同一时刻内存中最多只有一个读缓冲区，绝不整块物化分片。
// 每次调用打开自己的句柄，因此同一文件的多个分片可以并发读取；
// 重试时重新打开（请求体流不可重放）。

use crate::error::Result;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, Take};
use tokio_util::io::ReaderStream;

/// 流式读取的缓冲区大小: 64KB
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// 打开文件指定字节范围的读取流
///
/// # 参数
/// * `path` - 本地文件路径
/// * `offset` - 起始偏移
/// * `len` - 读取长度
///
/// # 返回
/// 恰好产出 `len` 字节的异步流；句柄随流的 drop 一起释放
pub async fn open_range_stream(
    path: &Path,
    offset: u64,
    len: u64,
) -> Result<ReaderStream<Take<File>>> {
    let mut file = File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;

    let limited = file.take(len);
    Ok(ReaderStream::with_capacity(limited, STREAM_BUFFER_SIZE))
}

/// 打开文件指定字节范围的流式请求体
pub async fn open_range_body(path: &Path, offset: u64, len: u64) -> Result<reqwest::Body> {
    let stream = open_range_stream(path, offset, len).await?;
    Ok(reqwest::Body::wrap_stream(stream))
}

/// 打开整个文件的流式请求体（单包路径）
pub async fn open_file_body(path: &Path, total_size: u64) -> Result<reqwest::Body> {
    open_range_body(path, 0, total_size).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UploadError;
    use futures::StreamExt;
    use std::io::Write;
    use tempfile::NamedTempFile;

    async fn collect(mut stream: ReaderStream<Take<File>>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_range_stream_exact_bytes() {
        let mut file = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..=255u8).cycle().take(1024).collect();
        file.write_all(&data).unwrap();

        let stream = open_range_stream(file.path(), 100, 300).await.unwrap();
        let bytes = collect(stream).await;

        assert_eq!(bytes.len(), 300);
        assert_eq!(&bytes[..], &data[100..400]);
    }

    #[tokio::test]
    async fn test_range_stream_at_file_start_and_end() {
        let mut file = NamedTempFile::new().unwrap();
        let data = vec![7u8; 500];
        file.write_all(&data).unwrap();

        let head = collect(open_range_stream(file.path(), 0, 200).await.unwrap()).await;
        assert_eq!(head.len(), 200);

        let tail = collect(open_range_stream(file.path(), 400, 100).await.unwrap()).await;
        assert_eq!(tail.len(), 100);
    }

    #[tokio::test]
    async fn test_concurrent_ranges_independent_handles() {
        let mut file = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        file.write_all(&data).unwrap();

        // 两个范围并发读取，各自独立句柄，互不干扰
        let (a, b) = tokio::join!(
            async { collect(open_range_stream(file.path(), 0, 100_000).await.unwrap()).await },
            async {
                collect(
                    open_range_stream(file.path(), 100_000, 100_000)
                        .await
                        .unwrap(),
                )
                .await
            },
        );

        assert_eq!(&a[..], &data[..100_000]);
        assert_eq!(&b[..], &data[100_000..]);
    }

    #[tokio::test]
    async fn test_missing_file_is_validation_error() {
        let err = open_range_stream(Path::new("./no/such/file"), 0, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));
    }

    #[tokio::test]
    async fn test_zero_length_range() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();

        let bytes = collect(open_range_stream(file.path(), 0, 0).await.unwrap()).await;
        assert!(bytes.is_empty());
    }
}
