// 控制 API 客户端实现
//
// 四个远程操作，全部无状态、可独立重试：
// - request_ticket:     请求上传票据（单包或分片）
// - upload_single/part: 把字节流 PUT 到存储端的短时效 URL
// - complete_multipart: 通知控制 API 按序合并分片
// - register_files:     把文件元数据登记到数据集
//
// 凭证对客户端是不透明字符串，随请求头 X-Dataverse-key 透传。

use crate::dataverse::types::{ApiEnvelope, FileMetadata, RegisterResponse, UploadTicket};
use crate::error::{Result, UploadError};
use reqwest::header::{CONTENT_LENGTH, ETAG};
use reqwest::multipart;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

/// 票据端点
const TICKET_ENDPOINT: &str = "/api/datasets/:persistentId/uploadurls";

/// 注册端点
const ADD_FILES_ENDPOINT: &str = "/api/datasets/:persistentId/addFiles";

/// 凭证请求头
const API_KEY_HEADER: &str = "X-Dataverse-key";

/// 直传对象的临时标记，注册完成前对象处于 temp 状态
const TAGGING_HEADER: (&str, &str) = ("x-amz-tagging", "dv-state=temp");

/// 控制 API 客户端
#[derive(Debug, Clone)]
pub struct DataverseClient {
    /// HTTP 客户端
    client: reqwest::Client,
    /// 仓库基础 URL（无结尾斜杠）
    base_url: String,
    /// API 令牌
    api_token: String,
    /// 数据集持久标识符
    persistent_id: String,
}

impl DataverseClient {
    /// 创建控制 API 客户端
    ///
    /// # 参数
    /// * `base_url` - 仓库基础 URL
    /// * `api_token` - API 令牌
    /// * `persistent_id` - 数据集持久标识符
    pub fn new(base_url: &str, api_token: &str, persistent_id: &str) -> Result<Self> {
        // 不设整体超时：分片 PUT 可能持续很久，连接级超时足够
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| UploadError::Network(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: api_token.to_string(),
            persistent_id: persistent_id.to_string(),
        })
    }

    /// 数据集持久标识符
    pub fn persistent_id(&self) -> &str {
        &self.persistent_id
    }

    /// 把票据里的相对路径解析成完整 URL
    fn resolve_url(&self, path_or_url: &str) -> String {
        if path_or_url.starts_with("http://") || path_or_url.starts_with("https://") {
            path_or_url.to_string()
        } else {
            format!("{}{}", self.base_url, path_or_url)
        }
    }

    /// 读取响应并解析 JSON，HTTP 失败时按状态码分类错误
    async fn parse_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        let text = response.text().await?;

        debug!("响应: status={}, body={}", status, text);

        if !status.is_success() {
            return Err(UploadError::from_status(status, &text));
        }

        serde_json::from_str(&text)
            .map_err(|e| UploadError::Packaging(format!("解析响应失败: {} (body: {})", e, text)))
    }

    /// 请求上传票据（allocate）
    ///
    /// # 参数
    /// * `file_size` - 文件大小，控制 API 据此决定单包或分片
    pub async fn request_ticket(&self, file_size: u64) -> Result<UploadTicket> {
        let url = format!(
            "{}{}?persistentId={}&size={}",
            self.base_url,
            TICKET_ENDPOINT,
            urlencoding::encode(&self.persistent_id),
            file_size
        );

        debug!("请求上传票据: size={}", file_size);

        let response = self
            .client
            .get(&url)
            .header(API_KEY_HEADER, &self.api_token)
            .send()
            .await?;

        let ticket = Self::parse_json::<ApiEnvelope<UploadTicket>>(response)
            .await?
            .data;
        ticket.validate()?;

        info!(
            "获得上传票据: storage={}, multipart={}",
            ticket.storage_identifier,
            ticket.is_multipart()
        );

        Ok(ticket)
    }

    /// 单包直传：把整个文件 PUT 到存储 URL
    ///
    /// 必须恰好发送 `len` 字节。
    pub async fn upload_single(&self, url: &str, body: reqwest::Body, len: u64) -> Result<()> {
        let response = self
            .client
            .put(url)
            .header(API_KEY_HEADER, &self.api_token)
            .header(TAGGING_HEADER.0, TAGGING_HEADER.1)
            .header(CONTENT_LENGTH, len)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(UploadError::from_status(status, &text));
        }

        debug!("单包上传成功: {} bytes", len);
        Ok(())
    }

    /// 分片上传：把一个分片 PUT 到存储 URL，返回完整性令牌
    ///
    /// # 参数
    /// * `url` - 该分片的短时效上传 URL
    /// * `body` - 恰好 `len` 字节的流式请求体
    ///
    /// # 返回
    /// 存储端返回的 ETag（去除引号）
    pub async fn upload_part(&self, url: &str, body: reqwest::Body, len: u64) -> Result<String> {
        let response = self
            .client
            .put(url)
            .header(CONTENT_LENGTH, len)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(UploadError::from_status(status, &text));
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string())
            .ok_or_else(|| {
                UploadError::Packaging("存储端未返回 ETag，无法完成分片合并".to_string())
            })?;

        debug!("分片上传成功: {} bytes, etag={}", len, etag);
        Ok(etag)
    }

    /// 完成分片上传（completeMultipart）
    ///
    /// # 参数
    /// * `complete_url` - 票据携带的完成 URL
    /// * `etags` - (分片索引, 完整性令牌)，必须按索引严格升序
    ///
    /// 负载键是从 1 开始的分片序号。
    pub async fn complete_multipart(
        &self,
        complete_url: &str,
        etags: &[(usize, String)],
    ) -> Result<()> {
        // 调用方负责完成屏障，这里再守一道升序不变量
        if etags.windows(2).any(|w| w[0].0 >= w[1].0) {
            return Err(UploadError::Packaging(
                "分片令牌列表不是严格升序".to_string(),
            ));
        }

        let mut payload = serde_json::Map::new();
        for (index, etag) in etags {
            payload.insert((index + 1).to_string(), json!(etag));
        }

        let url = self.resolve_url(complete_url);
        info!("合并 {} 个分片", etags.len());

        let response = self
            .client
            .put(&url)
            .header(API_KEY_HEADER, &self.api_token)
            .json(&Value::Object(payload))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(UploadError::from_status(status, &text));
        }

        Ok(())
    }

    /// 放弃分片上传，让存储端丢弃已上传的孤儿分片
    pub async fn abort_multipart(&self, abort_url: &str) -> Result<()> {
        let url = self.resolve_url(abort_url);
        warn!("放弃分片上传: {}", url);

        let response = self
            .client
            .delete(&url)
            .header(API_KEY_HEADER, &self.api_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(UploadError::from_status(status, &text));
        }

        Ok(())
    }

    /// 注册文件元数据（registerFile）
    ///
    /// 以 multipart 表单发送 jsonData（控制 API 不接受裸 JSON 体）。
    /// 数据集摄取锁会让该调用返回锁冲突，由重试策略兜底。
    pub async fn register_files(&self, files: &[FileMetadata]) -> Result<()> {
        let url = format!(
            "{}{}?persistentId={}",
            self.base_url,
            ADD_FILES_ENDPOINT,
            urlencoding::encode(&self.persistent_id)
        );

        let json_data = serde_json::to_string(files)
            .map_err(|e| UploadError::Packaging(format!("序列化注册负载失败: {}", e)))?;

        let form = multipart::Form::new().part(
            "jsonData",
            multipart::Part::text(json_data).mime_str("application/json")?,
        );

        debug!("注册 {} 个文件", files.len());

        let response = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, &self.api_token)
            .multipart(form)
            .send()
            .await?;

        let register = Self::parse_json::<RegisterResponse>(response).await?;
        if !register.is_success() {
            // HTTP 200 但业务失败，按消息内容分类（摄取锁以文本形式出现）
            if register.message.to_lowercase().contains("lock") {
                return Err(UploadError::LockConflict(register.message));
            }
            return Err(UploadError::Validation(format!(
                "注册失败: {}",
                register.message
            )));
        }

        Ok(())
    }
}
