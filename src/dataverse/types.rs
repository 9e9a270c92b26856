// 控制 API 数据类型

use crate::error::{Result, UploadError};
use crate::uploader::checksum::Checksum;
use crate::uploader::task::UploadUnit;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// API 响应信封
///
/// 控制 API 的 JSON 响应统一包在 `{"status": "...", "data": ...}` 里
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    /// "OK" 或 "ERROR"
    #[serde(default)]
    pub status: String,
    /// 负载
    pub data: T,
}

/// 上传票据（allocate 响应）
///
/// 两种形态：
/// - 单包: `{url, storageIdentifier, partSize}`
/// - 分片: `{urls: {"1": ..., "2": ...}, abort, complete, partSize, storageIdentifier}`
///
/// 分片 URL 的键是从 1 开始的分片序号，短时效，只能用一次。
#[derive(Debug, Clone, Deserialize)]
pub struct UploadTicket {
    /// 单包上传 URL
    #[serde(default)]
    pub url: Option<String>,
    /// 分片上传 URL 表
    #[serde(default)]
    pub urls: Option<HashMap<String, String>>,
    /// 放弃分片上传的 URL（相对于仓库基础 URL）
    #[serde(default)]
    pub abort: Option<String>,
    /// 完成分片上传的 URL（相对于仓库基础 URL）
    #[serde(default)]
    pub complete: Option<String>,
    /// 协商的分片大小
    #[serde(default, rename = "partSize")]
    pub part_size: Option<u64>,
    /// 存储标识符
    #[serde(rename = "storageIdentifier")]
    pub storage_identifier: String,
}

impl UploadTicket {
    /// 是否为分片票据
    pub fn is_multipart(&self) -> bool {
        self.urls.is_some()
    }

    /// 校验票据形态完整
    ///
    /// 分片票据必须同时携带 urls/abort/complete/partSize；
    /// 单包票据必须携带 url。缺字段属于上游契约错误。
    pub fn validate(&self) -> Result<()> {
        if self.is_multipart() {
            if self.abort.is_none() || self.complete.is_none() || self.part_size.is_none() {
                return Err(UploadError::Packaging(
                    "分片票据缺少 abort/complete/partSize 字段".to_string(),
                ));
            }
        } else if self.url.is_none() {
            return Err(UploadError::Packaging(
                "单包票据缺少 url 字段".to_string(),
            ));
        }
        Ok(())
    }

    /// 按分片序号升序返回上传 URL 列表
    pub fn part_urls(&self) -> Result<Vec<String>> {
        let urls = self
            .urls
            .as_ref()
            .ok_or_else(|| UploadError::Packaging("单包票据没有分片 URL".to_string()))?;

        let mut numbered: Vec<(usize, &String)> = Vec::with_capacity(urls.len());
        for (key, url) in urls {
            let number: usize = key.parse().map_err(|_| {
                UploadError::Packaging(format!("分片序号不是数字: {:?}", key))
            })?;
            numbered.push((number, url));
        }
        numbered.sort_by_key(|(number, _)| *number);

        Ok(numbered.into_iter().map(|(_, url)| url.clone()).collect())
    }
}

/// 注册负载中的单个文件元数据（addFiles 的 jsonData 元素）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    /// 存储标识符
    #[serde(rename = "storageIdentifier")]
    pub storage_identifier: String,
    /// 文件名
    #[serde(rename = "fileName")]
    pub file_name: String,
    /// MIME 类型
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    /// 数据集内目标子目录
    #[serde(rename = "directoryLabel", skip_serializing_if = "Option::is_none")]
    pub directory_label: Option<String>,
    /// 文件描述
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// 分类标签
    pub categories: Vec<String>,
    /// 是否受限访问
    pub restrict: bool,
    /// 是否进行表格摄取
    #[serde(rename = "tabIngest")]
    pub tab_ingest: bool,
    /// 文件校验和
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
}

impl FileMetadata {
    /// 从已完成传输的上传单元组装注册元数据
    ///
    /// 单元必须已持有存储标识符，否则说明完成屏障被绕过。
    pub fn from_unit(unit: &UploadUnit) -> Result<Self> {
        let storage_identifier = unit.storage_identifier.clone().ok_or_else(|| {
            UploadError::Packaging(format!("单元 {} 缺少存储标识符，无法注册", unit.id))
        })?;

        Ok(Self {
            storage_identifier,
            file_name: unit.file_name.clone(),
            mime_type: unit.mime_type.clone(),
            directory_label: unit.directory_label.clone(),
            description: unit.description.clone(),
            categories: unit.categories.clone(),
            restrict: unit.restrict,
            tab_ingest: unit.tab_ingest,
            checksum: unit.checksum.clone(),
        })
    }
}

/// 注册响应
#[derive(Debug, Deserialize)]
pub struct RegisterResponse {
    /// "OK" 或 "ERROR"
    #[serde(default)]
    pub status: String,
    /// 错误信息（status 为 ERROR 时）
    #[serde(default)]
    pub message: String,
}

impl RegisterResponse {
    pub fn is_success(&self) -> bool {
        self.status == "OK"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_ticket_parsing() {
        let json = r#"{
            "url": "https://bucket.s3.amazonaws.com/key?X-Amz-Signature=abc",
            "partSize": 1073741824,
            "storageIdentifier": "s3://bucket:18ab123"
        }"#;
        let ticket: UploadTicket = serde_json::from_str(json).unwrap();

        assert!(!ticket.is_multipart());
        assert!(ticket.validate().is_ok());
        assert_eq!(ticket.storage_identifier, "s3://bucket:18ab123");
    }

    #[test]
    fn test_multipart_ticket_parsing_sorted_urls() {
        // 键是无序的字符串序号，取出时必须按数字升序
        let json = r#"{
            "urls": {"10": "u10", "2": "u2", "1": "u1", "3": "u3"},
            "abort": "/api/datasets/mpupload?...",
            "complete": "/api/datasets/mpupload?...",
            "partSize": 5242880,
            "storageIdentifier": "s3://bucket:xyz"
        }"#;
        let ticket: UploadTicket = serde_json::from_str(json).unwrap();

        assert!(ticket.is_multipart());
        assert!(ticket.validate().is_ok());
        let urls = ticket.part_urls().unwrap();
        assert_eq!(urls, vec!["u1", "u2", "u3", "u10"]);
    }

    #[test]
    fn test_incomplete_multipart_ticket_rejected() {
        let json = r#"{
            "urls": {"1": "u1"},
            "partSize": 5242880,
            "storageIdentifier": "s3://bucket:xyz"
        }"#;
        let ticket: UploadTicket = serde_json::from_str(json).unwrap();
        let err = ticket.validate().unwrap_err();
        assert!(matches!(err, UploadError::Packaging(_)));
    }

    #[test]
    fn test_bad_part_number_rejected() {
        let json = r#"{
            "urls": {"one": "u1"},
            "abort": "/a",
            "complete": "/c",
            "partSize": 5242880,
            "storageIdentifier": "s3://bucket:xyz"
        }"#;
        let ticket: UploadTicket = serde_json::from_str(json).unwrap();
        assert!(matches!(
            ticket.part_urls().unwrap_err(),
            UploadError::Packaging(_)
        ));
    }

    #[test]
    fn test_file_metadata_serialization() {
        let metadata = FileMetadata {
            storage_identifier: "s3://bucket:abc".into(),
            file_name: "data.csv".into(),
            mime_type: "text/csv".into(),
            directory_label: Some("raw".into()),
            description: None,
            categories: vec!["DATA".into()],
            restrict: false,
            tab_ingest: false,
            checksum: Some(Checksum {
                algo: "MD5".into(),
                value: "deadbeef".into(),
            }),
        };

        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json["storageIdentifier"], "s3://bucket:abc");
        assert_eq!(json["fileName"], "data.csv");
        assert_eq!(json["directoryLabel"], "raw");
        assert_eq!(json["tabIngest"], false);
        assert_eq!(json["checksum"]["@type"], "MD5");
        // 空字段不出现在负载里
        assert!(json.get("description").is_none());
    }
}
