//! 下载相关的数据模型定义。
//!
//! 包含下载任务、分段、断点记录、下载结果、进度快照等核心数据结构。

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 协商完成后的下载任务描述，创建后不再修改。
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub url: String,
    pub output_path: PathBuf,
    pub total_size: Option<u64>,
    pub threads: usize,
    pub supports_ranges: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

/// 目标文件中的一段连续字节区间 `[start, end]`（闭区间）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub start: u64,
    pub end: u64,
    pub bytes_written: u64,
    pub status: SegmentStatus,
}

#[allow(clippy::len_without_is_empty)]
impl Segment {
    pub fn new(index: usize, start: u64, end: u64) -> Self {
        Self {
            index,
            start,
            end,
            bytes_written: 0,
            status: SegmentStatus::Pending,
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn remaining(&self) -> u64 {
        self.len().saturating_sub(self.bytes_written)
    }

    /// 下一次写入的绝对偏移。
    pub fn next_offset(&self) -> u64 {
        self.start + self.bytes_written
    }

    pub fn is_done(&self) -> bool {
        self.status == SegmentStatus::Done
    }

    pub(crate) fn mark_done(&mut self) {
        self.bytes_written = self.len();
        self.status = SegmentStatus::Done;
    }
}

/// 断点文件中单个分段的检查点。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentCheckpoint {
    pub index: usize,
    pub start: u64,
    pub end: u64,
    pub bytes_written: u64,
}

/// 断点续传记录（sidecar 文件内容）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeRecord {
    pub version: u32,
    pub url: String,
    pub total_size: u64,
    pub segments: Vec<SegmentCheckpoint>,
}

impl ResumeRecord {
    pub const VERSION: u32 = 1;

    pub fn from_segments(url: &str, total_size: u64, segments: &[Segment]) -> Self {
        Self {
            version: Self::VERSION,
            url: url.to_string(),
            total_size,
            segments: segments
                .iter()
                .map(|s| SegmentCheckpoint {
                    index: s.index,
                    start: s.start,
                    end: s.end,
                    // 仅在整段完成后才持久化进度
                    bytes_written: if s.is_done() { s.len() } else { 0 },
                })
                .collect(),
        }
    }

    /// 还原分段；未完整完成的分段一律从段首重来。
    pub fn to_segments(&self) -> Vec<Segment> {
        self.segments
            .iter()
            .map(|c| {
                let mut seg = Segment::new(c.index, c.start, c.end);
                if c.bytes_written == seg.len() {
                    seg.mark_done();
                }
                seg
            })
            .collect()
    }

    /// 更新单个分段为已完成（同一分段重复写入以最后一次为准）。
    pub fn mark_done(&mut self, index: usize) {
        if let Some(cp) = self.segments.iter_mut().find(|c| c.index == index) {
            cp.bytes_written = cp.end - cp.start + 1;
        }
    }

    pub fn done_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|c| c.bytes_written == c.end - c.start + 1)
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub path: PathBuf,
    pub total_bytes: u64,
    pub elapsed: Duration,
    pub sha256: String,
    /// 按分段编号排列的重试次数。
    pub segment_retries: Vec<u32>,
    /// 本次运行直接沿用断点、未发起请求的分段数。
    pub resumed_segments: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub downloaded: u64,
    pub total: Option<u64>,
    pub segments_done: usize,
    pub segments_total: usize,
}
