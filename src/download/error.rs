//! 下载引擎错误类型。
//!
//! - `FetchError`：单次 HTTP 请求层面的错误，区分可重试（瞬时）与不可重试
//! - `DownloadError`：对调用方暴露的任务级错误，附带 URL / 分段编号 / 路径等诊断信息

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("redirect limit of {0} hops exceeded")]
    Redirects(usize),
    #[error("unexpected http status {0}")]
    Status(u16),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("server ignored range request (expected 206, got {0})")]
    RangeIgnored(u16),
}

impl FetchError {
    /// 是否值得在同一分段上重试。
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Connect(_) | FetchError::Timeout(_) | FetchError::Stream(_) => true,
            FetchError::Status(code) => *code == 408 || *code == 429 || (500..600).contains(code),
            FetchError::Redirects(_) | FetchError::RangeIgnored(_) => false,
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error, redirect_limit: usize) -> Self {
        if err.is_redirect() {
            return FetchError::Redirects(redirect_limit);
        }
        if err.is_timeout() {
            return FetchError::Timeout(err.to_string());
        }
        if err.is_connect() {
            return FetchError::Connect(err.to_string());
        }
        if let Some(status) = err.status() {
            return FetchError::Status(status.as_u16());
        }
        FetchError::Stream(err.to_string())
    }
}

/// 单个分段的最终失败信息。
#[derive(Debug, Clone)]
pub struct SegmentFailure {
    pub index: usize,
    pub attempts: u32,
    pub cause: FetchError,
}

impl fmt::Display for SegmentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "segment {} after {} attempt(s): {}",
            self.index, self.attempts, self.cause
        )
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("cannot reach {url}: {cause}")]
    Unreachable { url: String, cause: FetchError },
    #[error("{url} answered http status {status}")]
    HttpStatus { url: String, status: u16 },
    #[error("too many redirects for {url} (limit {limit})")]
    TooManyRedirects { url: String, limit: usize },
    #[error("{} segment(s) of {url} failed: {}", failures.len(), join_failures(failures))]
    SegmentDownload {
        url: String,
        failures: Vec<SegmentFailure>,
    },
    #[error("failed to read {path}: {source}")]
    FileRead { path: PathBuf, source: io::Error },
    #[error("failed to write {path}: {source}")]
    FileWrite { path: PathBuf, source: io::Error },
    #[error("download cancelled")]
    Cancelled,
}

fn join_failures(failures: &[SegmentFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl DownloadError {
    /// 出错的组件名，供 CLI 输出定位问题。
    pub fn component(&self) -> &'static str {
        match self {
            DownloadError::InvalidUrl { .. }
            | DownloadError::Unreachable { .. }
            | DownloadError::HttpStatus { .. }
            | DownloadError::TooManyRedirects { .. } => "negotiate",
            DownloadError::SegmentDownload { .. } => "worker",
            DownloadError::FileRead { .. } => "hasher",
            DownloadError::FileWrite { .. } => "io",
            DownloadError::Cancelled => "coordinator",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            DownloadError::Cancelled => 130,
            _ => 1,
        }
    }

    /// 失败分段编号（仅 `SegmentDownload`）。
    pub fn failed_segments(&self) -> Vec<usize> {
        match self {
            DownloadError::SegmentDownload { failures, .. } => {
                failures.iter().map(|f| f.index).collect()
            }
            _ => Vec::new(),
        }
    }

    /// 将探测阶段的请求错误映射到任务级错误。
    pub(crate) fn from_probe(url: &str, err: FetchError) -> Self {
        match err {
            FetchError::Redirects(limit) => DownloadError::TooManyRedirects {
                url: url.to_string(),
                limit,
            },
            FetchError::Status(status) | FetchError::RangeIgnored(status) => {
                DownloadError::HttpStatus {
                    url: url.to_string(),
                    status,
                }
            }
            other => DownloadError::Unreachable {
                url: url.to_string(),
                cause: other,
            },
        }
    }
}
