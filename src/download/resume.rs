//! 断点续传记录（sidecar 文件）。
//!
//! sidecar 与输出文件位于同一目录，文件名为 `<输出文件名>.resume`，内容为 JSON。
//! 读取失败、内容损坏或与当前任务不匹配时一律视为"无记录"，从头下载。

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::models::ResumeRecord;
use super::plan::validate_layout;

const SIDECAR_SUFFIX: &str = "resume";

/// 放弃 sidecar 的原因，只用于日志，不向上传播。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeRejection {
    Missing,
    Unreadable(String),
    /// 无法解析或布局非法。
    ResumeStateCorrupt(String),
    VersionMismatch(u32),
    UrlMismatch,
    SizeMismatch { recorded: u64, actual: u64 },
}

impl fmt::Display for ResumeRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumeRejection::Missing => write!(f, "no resume file"),
            ResumeRejection::Unreadable(e) => write!(f, "resume file unreadable: {e}"),
            ResumeRejection::ResumeStateCorrupt(e) => write!(f, "resume state corrupt: {e}"),
            ResumeRejection::VersionMismatch(v) => write!(f, "unsupported resume version {v}"),
            ResumeRejection::UrlMismatch => write!(f, "resume file belongs to another url"),
            ResumeRejection::SizeMismatch { recorded, actual } => {
                write!(f, "recorded size {recorded} != remote size {actual}")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResumeStore {
    path: PathBuf,
}

impl ResumeStore {
    /// 输出文件对应的 sidecar。
    pub fn for_output(output: &Path) -> Self {
        Self {
            path: sidecar_path(output),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// 读取并校验；不可用时返回 `None`。
    pub fn load(&self, url: &str, total_size: u64) -> Option<ResumeRecord> {
        match self.try_load(url, total_size) {
            Ok(record) => {
                debug!(
                    target: "resume",
                    path = %self.path.display(),
                    done = record.done_count(),
                    total = record.segments.len(),
                    "断点记录可用"
                );
                Some(record)
            }
            Err(ResumeRejection::Missing) => None,
            Err(reason) => {
                warn!(
                    target: "resume",
                    path = %self.path.display(),
                    "丢弃断点记录，重新下载: {reason}"
                );
                None
            }
        }
    }

    pub fn try_load(&self, url: &str, total_size: u64) -> Result<ResumeRecord, ResumeRejection> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ResumeRejection::Missing);
            }
            Err(e) => return Err(ResumeRejection::Unreadable(e.to_string())),
        };

        let record: ResumeRecord = serde_json::from_slice(&raw)
            .map_err(|e| ResumeRejection::ResumeStateCorrupt(e.to_string()))?;

        if record.version != ResumeRecord::VERSION {
            return Err(ResumeRejection::VersionMismatch(record.version));
        }
        if record.url != url {
            return Err(ResumeRejection::UrlMismatch);
        }
        if record.total_size != total_size {
            return Err(ResumeRejection::SizeMismatch {
                recorded: record.total_size,
                actual: total_size,
            });
        }
        if record.segments.iter().any(|c| c.end < c.start) {
            return Err(ResumeRejection::ResumeStateCorrupt(
                "segment ends before it starts".to_string(),
            ));
        }
        let segments = record.to_segments();
        if segments.is_empty() || !validate_layout(&segments, total_size) {
            return Err(ResumeRejection::ResumeStateCorrupt(
                "segment layout does not cover the file".to_string(),
            ));
        }
        if record
            .segments
            .iter()
            .any(|c| c.bytes_written > c.end - c.start + 1)
        {
            return Err(ResumeRejection::ResumeStateCorrupt(
                "segment progress exceeds its length".to_string(),
            ));
        }

        Ok(record)
    }

    /// 覆盖写入（先写临时文件再 rename）。
    pub fn save(&self, record: &ResumeRecord) -> io::Result<()> {
        let bytes = serde_json::to_vec_pretty(record).map_err(io::Error::other)?;
        write_atomic(&self.path, &bytes)
    }

    /// 删除 sidecar；文件不存在不算错误。
    pub fn clear(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

pub fn sidecar_path(output: &Path) -> PathBuf {
    let mut name = output
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(SIDECAR_SUFFIX);
    output.with_file_name(name)
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension(format!(
        "{}part",
        path.extension().and_then(|s| s.to_str()).unwrap_or("")
    ));
    std::fs::write(&tmp, bytes)?;
    // rename 在 Windows 上不能覆盖已存在文件
    #[cfg(windows)]
    let _ = std::fs::remove_file(path);
    std::fs::rename(tmp, path)?;
    Ok(())
}
