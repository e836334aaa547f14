//! Swift Downloader：分段并发、可断点续传的 HTTP(S) 文件下载器。
//!
//! 代码结构（读代码入口）：
//! - `base_system`：配置/日志/重试/路径等基础设施
//! - `download`：下载引擎（协商、分段、续传、并发下载、校验）

pub mod base_system;
pub mod download;

pub use base_system::context::Config;
pub use download::{
    DownloadError, DownloadRequest, DownloadResult, Downloader, ProgressSnapshot, run,
};
