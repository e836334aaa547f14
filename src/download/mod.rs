//! 下载引擎模块入口。
//!
//! 子模块：
//! - `transport`   — HTTP 传输层抽象与 reqwest 实现
//! - `negotiate`   — 探测文件大小与 Range 支持
//! - `plan`        — 分段计划
//! - `resume`      — 断点记录（sidecar）读写
//! - `worker`      — 分段下载线程与工作池
//! - `downloader`  — 下载主流程编排
//! - `hasher`      — SHA-256 校验
//! - `progress`    — 进度上报与 CLI 进度条
//! - `models`      — 数据模型
//! - `error`       — 错误类型

pub mod downloader;
pub mod error;
pub mod hasher;
pub mod models;
pub mod negotiate;
pub mod plan;
pub mod progress;
pub mod resume;
pub mod transport;
pub mod worker;

pub use downloader::{DownloadRequest, Downloader, run};
pub use error::{DownloadError, FetchError, SegmentFailure};
pub use models::{DownloadJob, DownloadResult, ProgressSnapshot};
pub use progress::ProgressCallback;
