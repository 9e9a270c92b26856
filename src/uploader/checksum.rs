// 文件校验和计算
//
// 控制 API 的注册负载要求每个文件携带校验和（默认 MD5）。
// 在阻塞线程池中以 64KB 缓冲增量计算，避免把整个文件读进内存。

use crate::error::{Result, UploadError};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use sha2::{Sha256, Sha512};
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// 读缓冲区大小: 64KB
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// 校验和算法
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumType {
    /// MD5（默认）
    #[default]
    #[serde(rename = "MD5")]
    Md5,
    /// SHA-1
    #[serde(rename = "SHA-1")]
    Sha1,
    /// SHA-256
    #[serde(rename = "SHA-256")]
    Sha256,
    /// SHA-512
    #[serde(rename = "SHA-512")]
    Sha512,
}

impl ChecksumType {
    /// 控制 API 使用的算法名称
    pub fn algo_name(&self) -> &'static str {
        match self {
            ChecksumType::Md5 => "MD5",
            ChecksumType::Sha1 => "SHA-1",
            ChecksumType::Sha256 => "SHA-256",
            ChecksumType::Sha512 => "SHA-512",
        }
    }
}

/// 计算完成的校验和（注册负载中的 `checksum` 字段）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    /// 算法名称
    #[serde(rename = "@type")]
    pub algo: String,
    /// 十六进制摘要值
    #[serde(rename = "@value")]
    pub value: String,
}

/// 计算文件校验和
///
/// # 参数
/// * `path` - 本地文件路径
/// * `checksum_type` - 校验和算法
pub async fn compute_checksum(path: &Path, checksum_type: ChecksumType) -> Result<Checksum> {
    let path = path.to_path_buf();

    // 文件 I/O 放到阻塞线程池
    tokio::task::spawn_blocking(move || compute_checksum_sync(&path, checksum_type))
        .await
        .map_err(|e| UploadError::Validation(format!("校验和计算任务执行失败: {}", e)))?
}

/// 同步计算文件校验和（内部方法）
fn compute_checksum_sync(path: &Path, checksum_type: ChecksumType) -> Result<Checksum> {
    let file = std::fs::File::open(path)
        .map_err(|e| UploadError::Validation(format!("无法打开文件 {:?}: {}", path, e)))?;
    let mut reader = std::io::BufReader::with_capacity(1024 * 1024, file);

    let mut buffer = [0u8; HASH_BUFFER_SIZE];
    let mut hasher = Hasher::new(checksum_type);

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    let value = hasher.finalize();
    debug!("校验和计算完成: path={:?}, {}={}", path, checksum_type.algo_name(), value);

    Ok(Checksum {
        algo: checksum_type.algo_name().to_string(),
        value,
    })
}

/// 统一的增量哈希器
enum Hasher {
    Md5(md5::Context),
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    fn new(checksum_type: ChecksumType) -> Self {
        match checksum_type {
            ChecksumType::Md5 => Hasher::Md5(md5::Context::new()),
            ChecksumType::Sha1 => Hasher::Sha1(Sha1::new()),
            ChecksumType::Sha256 => Hasher::Sha256(Sha256::new()),
            ChecksumType::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(ctx) => ctx.consume(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    fn finalize(self) -> String {
        match self {
            Hasher::Md5(ctx) => format!("{:x}", ctx.compute()),
            Hasher::Sha1(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}
