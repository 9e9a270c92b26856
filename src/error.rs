// 上传错误类型定义
//
// 错误分为两类：
// - 可重试：Network / LockConflict（由 RetryPolicy 按指数退避重试）
// - 不可重试：Validation / Auth / Packaging / Cancelled（立即失败，不消耗重试预算）

use reqwest::StatusCode;
use thiserror::Error;

/// 统一的 Result 别名
pub type Result<T> = std::result::Result<T, UploadError>;

/// 上传错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    /// 本地输入校验失败（文件不存在、不是文件、描述不合法等）
    #[error("校验失败: {0}")]
    Validation(String),

    /// 凭证被控制 API 拒绝（401/403）
    #[error("认证失败: {0}")]
    Auth(String),

    /// 网络错误（连接失败、超时、5xx）
    #[error("网络错误: {0}")]
    Network(String),

    /// 控制 API 端并发锁冲突（多个表格文件同时注册时常见）
    #[error("数据集锁冲突: {0}")]
    LockConflict(String),

    /// 分片协商或字节范围不变量被破坏（逻辑错误或上游契约错误）
    #[error("分包错误: {0}")]
    Packaging(String),

    /// 上传被调用方取消
    #[error("上传已取消")]
    Cancelled,
}

impl UploadError {
    /// 是否可重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, UploadError::Network(_) | UploadError::LockConflict(_))
    }

    /// 错误分类标识（用于 UploadResult 和事件）
    pub fn kind(&self) -> &'static str {
        match self {
            UploadError::Validation(_) => "validation",
            UploadError::Auth(_) => "auth",
            UploadError::Network(_) => "network",
            UploadError::LockConflict(_) => "lock_conflict",
            UploadError::Packaging(_) => "packaging",
            UploadError::Cancelled => "cancelled",
        }
    }

    /// 从 HTTP 状态码和响应体分类错误
    ///
    /// # 分类规则
    /// - 401/403 -> Auth
    /// - 423/409 或响应体含 "lock" -> LockConflict
    /// - 408/429/5xx -> Network
    /// - 其余 4xx -> Validation
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = format!("HTTP {}: {}", status.as_u16(), truncate(body, 200));

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return UploadError::Auth(message);
        }
        if status == StatusCode::LOCKED
            || status == StatusCode::CONFLICT
            || body.to_lowercase().contains("lock")
        {
            return UploadError::LockConflict(message);
        }
        if status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
        {
            return UploadError::Network(message);
        }

        UploadError::Validation(message)
    }
}

/// 截断过长的响应体，避免日志和错误信息爆炸
fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            // 响应能收到但解析不了，属于上游契约问题
            UploadError::Packaging(format!("响应解析失败: {}", err))
        } else {
            // 连接失败、超时、发送中断等都按网络错误处理
            UploadError::Network(err.to_string())
        }
    }
}

impl From<std::io::Error> for UploadError {
    fn from(err: std::io::Error) -> Self {
        // 本地文件读取失败按校验错误处理（不可重试）
        UploadError::Validation(format!("本地文件读取失败: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(UploadError::Network("timeout".into()).is_retryable());
        assert!(UploadError::LockConflict("locked".into()).is_retryable());

        assert!(!UploadError::Validation("missing".into()).is_retryable());
        assert!(!UploadError::Auth("bad token".into()).is_retryable());
        assert!(!UploadError::Packaging("bad part size".into()).is_retryable());
        assert!(!UploadError::Cancelled.is_retryable());
    }

    #[test]
    fn test_from_status_classification() {
        let auth = UploadError::from_status(StatusCode::UNAUTHORIZED, "bad key");
        assert!(matches!(auth, UploadError::Auth(_)));

        let forbidden = UploadError::from_status(StatusCode::FORBIDDEN, "");
        assert!(matches!(forbidden, UploadError::Auth(_)));

        let server = UploadError::from_status(StatusCode::BAD_GATEWAY, "");
        assert!(matches!(server, UploadError::Network(_)));

        let throttled = UploadError::from_status(StatusCode::TOO_MANY_REQUESTS, "");
        assert!(matches!(throttled, UploadError::Network(_)));

        let bad_request = UploadError::from_status(StatusCode::BAD_REQUEST, "missing field");
        assert!(matches!(bad_request, UploadError::Validation(_)));
    }

    #[test]
    fn test_lock_conflict_detection() {
        // 423 Locked 直接判定
        let locked = UploadError::from_status(StatusCode::LOCKED, "");
        assert!(matches!(locked, UploadError::LockConflict(_)));

        // 响应体提到 lock 也判定为锁冲突（Dataverse 摄取锁返回 400 + 文本）
        let worded = UploadError::from_status(
            StatusCode::BAD_REQUEST,
            "Dataset cannot be edited due to dataset lock: Ingest",
        );
        assert!(matches!(worded, UploadError::LockConflict(_)));
        assert!(worded.is_retryable());
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(UploadError::Validation(String::new()).kind(), "validation");
        assert_eq!(UploadError::Network(String::new()).kind(), "network");
        assert_eq!(
            UploadError::LockConflict(String::new()).kind(),
            "lock_conflict"
        );
        assert_eq!(UploadError::Cancelled.kind(), "cancelled");
    }

    #[test]
    fn test_truncate_long_body() {
        let long_body = "x".repeat(500);
        let err = UploadError::from_status(StatusCode::INTERNAL_SERVER_ERROR, &long_body);
        let text = err.to_string();
        assert!(text.len() < 300);
        assert!(text.contains("..."));
    }
}
