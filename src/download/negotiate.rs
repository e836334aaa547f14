//! 探测远端资源：总大小与是否支持 Range 请求。
//!
//! 先发 HEAD；HEAD 不可用或信息不全时，退回 `Range: bytes=0-0` 的 GET 探测。

use tracing::{debug, info};

use super::error::{DownloadError, FetchError};
use super::transport::{ProbeResponse, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub total_size: Option<u64>,
    pub supports_ranges: bool,
    /// 实际并发数；不支持分段时固定为 1。
    pub threads: usize,
    pub content_disposition: Option<String>,
}

pub fn negotiate(
    transport: &dyn Transport,
    url: &str,
    threads: usize,
) -> Result<Negotiated, DownloadError> {
    let head = match transport.head(url) {
        Ok(h) => Some(h),
        Err(e @ FetchError::Redirects(_)) => return Err(DownloadError::from_probe(url, e)),
        Err(e) => {
            debug!(target: "negotiate", "HEAD 失败，改用 Range 探测: {e}");
            None
        }
    };

    if let Some(h) = head.as_ref()
        && h.is_success()
        && h.accept_ranges
        && let Some(len) = h.content_length
    {
        return Ok(finish(Some(len), true, threads, h.content_disposition.clone()));
    }

    let head_ok = head.filter(ProbeResponse::is_success);
    let probe = transport.probe_range(url);

    let (total, ranges, disposition) = match probe {
        Ok(p) if p.status == 206 => {
            let total = p
                .range_total
                .or_else(|| head_ok.as_ref().and_then(|h| h.content_length));
            let disposition = p
                .content_disposition
                .or_else(|| head_ok.as_ref().and_then(|h| h.content_disposition.clone()));
            (total, total.is_some(), disposition)
        }
        Ok(p) if p.is_success() => {
            // 服务端忽略了 Range，200 的 Content-Length 即为全文长度
            let total = p
                .content_length
                .or_else(|| head_ok.as_ref().and_then(|h| h.content_length));
            let disposition = p
                .content_disposition
                .or_else(|| head_ok.as_ref().and_then(|h| h.content_disposition.clone()));
            (total, false, disposition)
        }
        Ok(p) => match head_ok {
            Some(h) => (h.content_length, false, h.content_disposition),
            None => {
                return Err(DownloadError::HttpStatus {
                    url: url.to_string(),
                    status: p.status,
                });
            }
        },
        Err(e @ FetchError::Redirects(_)) => return Err(DownloadError::from_probe(url, e)),
        Err(e) => match head_ok {
            Some(h) => (h.content_length, false, h.content_disposition),
            None => return Err(DownloadError::from_probe(url, e)),
        },
    };

    Ok(finish(total, ranges, threads, disposition))
}

fn finish(
    total_size: Option<u64>,
    supports_ranges: bool,
    threads: usize,
    content_disposition: Option<String>,
) -> Negotiated {
    let supports_ranges = supports_ranges && total_size.is_some();
    if !supports_ranges {
        info!(
            target: "negotiate",
            size = ?total_size,
            "服务端不支持分段下载，使用单线程模式"
        );
    }
    Negotiated {
        total_size,
        supports_ranges,
        threads: if supports_ranges { threads.max(1) } else { 1 },
        content_disposition,
    }
}
