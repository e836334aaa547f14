//! HTTP 传输层抽象。
//!
//! 下载引擎只依赖 `Transport` trait，生产环境使用基于 `reqwest::blocking` 的
//! `HttpTransport`；测试中可以替换为内存实现并注入故障。

use std::io::Read;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::{
    ACCEPT, ACCEPT_ENCODING, ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE,
    HeaderMap, HeaderValue, RANGE, USER_AGENT,
};
use reqwest::redirect::Policy;
use reqwest::StatusCode;

use super::error::FetchError;
use crate::base_system::context::Config;

/// 请求的字节区间，`end` 为 `None` 表示直到文件末尾。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// 元数据探测的结果（HEAD 或 1 字节 Range GET）。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub accept_ranges: bool,
    /// `Content-Range: bytes a-b/N` 中的 N。
    pub range_total: Option<u64>,
    pub content_disposition: Option<String>,
}

impl ProbeResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub trait Transport: Send + Sync {
    /// HEAD 请求。非 2xx 状态同样返回 `Ok`，由调用方判断。
    fn head(&self, url: &str) -> Result<ProbeResponse, FetchError>;

    /// `Range: bytes=0-0` 的 GET 请求，只读取响应头。
    fn probe_range(&self, url: &str) -> Result<ProbeResponse, FetchError>;

    /// 打开响应体。带区间时服务端必须以 206 响应，且起点一致。
    fn open(&self, url: &str, range: Option<ByteRange>) -> Result<Box<dyn Read + Send>, FetchError>;
}

// ── reqwest 实现 ────────────────────────────────────────────────

pub struct HttpTransport {
    client: Client,
    max_redirects: usize,
}

impl HttpTransport {
    pub fn new(cfg: &Config) -> Result<Self, FetchError> {
        // 请求 identity 编码，保证 Content-Length / Range 与落盘字节一致。
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        if let Ok(ua) = HeaderValue::from_str(cfg.user_agent.trim()) {
            headers.insert(USER_AGENT, ua);
        }

        let client = Client::builder()
            .default_headers(headers)
            .redirect(Policy::limited(cfg.max_redirects))
            .connect_timeout(Duration::from_secs(cfg.connect_timeout.max(1)))
            .timeout(Duration::from_secs(cfg.request_timeout.max(1)))
            .build()
            .map_err(|e| FetchError::Connect(format!("init http client: {e}")))?;

        Ok(Self {
            client,
            max_redirects: cfg.max_redirects,
        })
    }

    fn send(&self, req: reqwest::blocking::RequestBuilder) -> Result<Response, FetchError> {
        req.send()
            .map_err(|e| FetchError::from_reqwest(e, self.max_redirects))
    }
}

impl Transport for HttpTransport {
    fn head(&self, url: &str) -> Result<ProbeResponse, FetchError> {
        let resp = self.send(self.client.head(url))?;
        Ok(probe_from_headers(resp.status(), resp.headers()))
    }

    fn probe_range(&self, url: &str) -> Result<ProbeResponse, FetchError> {
        let resp = self.send(
            self.client
                .get(url)
                .header(RANGE, ByteRange::new(0, 0).header_value()),
        )?;
        // 响应体不读取，drop 时连接直接关闭
        Ok(probe_from_headers(resp.status(), resp.headers()))
    }

    fn open(&self, url: &str, range: Option<ByteRange>) -> Result<Box<dyn Read + Send>, FetchError> {
        let mut req = self.client.get(url);
        if let Some(r) = range {
            req = req.header(RANGE, r.header_value());
        }
        let resp = self.send(req)?;
        let status = resp.status();

        match range {
            Some(r) => {
                if status == StatusCode::OK {
                    return Err(FetchError::RangeIgnored(status.as_u16()));
                }
                if status != StatusCode::PARTIAL_CONTENT {
                    return Err(FetchError::Status(status.as_u16()));
                }
                let served_start = header_str(resp.headers(), CONTENT_RANGE.as_str())
                    .and_then(parse_content_range)
                    .map(|(start, _, _)| start);
                if served_start.is_some_and(|s| s != r.start) {
                    return Err(FetchError::RangeIgnored(status.as_u16()));
                }
            }
            None => {
                if !status.is_success() {
                    return Err(FetchError::Status(status.as_u16()));
                }
            }
        }

        Ok(Box::new(resp))
    }
}

// ── 响应头解析 ──────────────────────────────────────────────────

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn probe_from_headers(status: StatusCode, headers: &HeaderMap) -> ProbeResponse {
    ProbeResponse {
        status: status.as_u16(),
        content_length: header_str(headers, CONTENT_LENGTH.as_str())
            .and_then(|s| s.parse::<u64>().ok()),
        accept_ranges: header_str(headers, ACCEPT_RANGES.as_str())
            .map(accepts_byte_ranges)
            .unwrap_or(false),
        range_total: header_str(headers, CONTENT_RANGE.as_str())
            .and_then(parse_content_range)
            .and_then(|(_, _, total)| total),
        content_disposition: header_str(headers, CONTENT_DISPOSITION.as_str())
            .map(str::to_string),
    }
}

pub(crate) fn accepts_byte_ranges(value: &str) -> bool {
    value
        .split(',')
        .any(|unit| unit.trim().eq_ignore_ascii_case("bytes"))
}

/// 解析 `bytes a-b/N`（N 可能为 `*`）。
pub(crate) fn parse_content_range(value: &str) -> Option<(u64, u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (span, total) = rest.split_once('/')?;
    let (start, end) = span.trim().split_once('-')?;
    let start = start.trim().parse::<u64>().ok()?;
    let end = end.trim().parse::<u64>().ok()?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse::<u64>().ok()?),
    };
    Some((start, end, total))
}
