// 控制 API 模块

pub mod client;
pub mod types;

pub use client::DataverseClient;
pub use types::{ApiEnvelope, FileMetadata, RegisterResponse, UploadTicket};
