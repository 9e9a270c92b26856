// Dataverse Direct Uploader
// Dataverse 直传客户端核心库

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 控制 API 模块
pub mod dataverse;

// 上传引擎模块
pub mod uploader;

// 进度事件模块
pub mod events;

// 日志模块
pub mod logging;

// 导出常用类型
pub use config::{AppConfig, FileEntry, LogConfig, UploadConfig, UploadManifest};
pub use dataverse::{DataverseClient, FileMetadata, UploadTicket};
pub use error::{Result, UploadError};
pub use events::{EventSink, LogSink, NullSink, UploadEvent};
pub use uploader::{
    BatchSummary, ChecksumType, UnitStatus, UploadManager, UploadResult, UploadStrategy,
    UploadUnit,
};
