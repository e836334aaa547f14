//! 下载主流程编排：协商 → 分段/续传 → 并发下载 → 校验。
//!
//! 协调线程独占 `Vec<Segment>` 与断点记录，worker 只通过事件通道汇报，
//! 因此断点文件只有一个写入者。

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use reqwest::Url;
use tracing::{debug, error, info, warn};

use super::error::{DownloadError, FetchError, SegmentFailure};
use super::hasher::sha256_file;
use super::models::{
    DownloadJob, DownloadResult, ProgressSnapshot, ResumeRecord, Segment, SegmentStatus,
};
use super::negotiate::negotiate;
use super::plan::plan_segments_with_min;
use super::progress::{ProgressCallback, ProgressReporter};
use super::resume::ResumeStore;
use super::transport::{HttpTransport, Transport};
use super::worker::{SegmentTask, SegmentWorker, WorkerEvent, WorkerOutcome, WorkerPool};
use crate::base_system::context::Config;
use crate::base_system::file_paths::{output_path, resolve_file_name, safe_fs_name};
use crate::base_system::retry::RetryPolicy;

const EVENT_POLL: Duration = Duration::from_millis(200);

/// 一次下载请求；未填写的字段使用配置默认值。
#[derive(Debug, Clone, Default)]
pub struct DownloadRequest {
    pub url: String,
    pub output_dir: Option<PathBuf>,
    pub threads: Option<usize>,
    /// 指定文件名，覆盖服务端与 URL 推断的名称。
    pub file_name: Option<String>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }
}

pub struct Downloader {
    config: Config,
    transport: Arc<dyn Transport>,
    show_progress: bool,
}

impl Downloader {
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            show_progress: false,
        }
    }

    /// 使用 reqwest 传输层。
    pub fn with_http(config: Config) -> Result<Self, FetchError> {
        let transport = HttpTransport::new(&config)?;
        Ok(Self::new(config, Arc::new(transport)))
    }

    /// 是否在 stderr 绘制进度条。
    pub fn progress_bar(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// 校验 URL、探测远端并确定输出路径，不写任何文件。
    pub fn prepare(&self, request: &DownloadRequest) -> Result<DownloadJob, DownloadError> {
        let url = request.url.trim();
        validate_url(url)?;

        let threads = self.config.threads_or_default(request.threads);
        let negotiated = negotiate(self.transport.as_ref(), url, threads)?;

        let dir = request
            .output_dir
            .clone()
            .filter(|d| !d.as_os_str().is_empty())
            .unwrap_or_else(|| self.config.default_save_dir());
        let name = match request.file_name.as_deref().map(str::trim) {
            Some(n) if !n.is_empty() => safe_fs_name(n, "_", 200),
            _ => resolve_file_name(url, negotiated.content_disposition.as_deref()),
        };

        let job = DownloadJob {
            url: url.to_string(),
            output_path: output_path(&dir, &name),
            total_size: negotiated.total_size,
            threads: negotiated.threads,
            supports_ranges: negotiated.supports_ranges,
        };
        info!(
            target: "download",
            url = %job.url,
            path = %job.output_path.display(),
            size = ?job.total_size,
            threads = job.threads,
            "下载任务已确定"
        );
        Ok(job)
    }

    pub fn run(
        &self,
        request: &DownloadRequest,
        cancel: Arc<AtomicBool>,
        progress: Option<ProgressCallback>,
    ) -> Result<DownloadResult, DownloadError> {
        let job = self.prepare(request)?;
        self.execute(&job, cancel, progress)
    }

    /// 执行已协商好的任务。
    pub fn execute(
        &self,
        job: &DownloadJob,
        cancel: Arc<AtomicBool>,
        progress: Option<ProgressCallback>,
    ) -> Result<DownloadResult, DownloadError> {
        let started = Instant::now();
        let write_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| DownloadError::FileWrite { path, source }
        };

        if let Some(parent) = job.output_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(write_err(parent))?;
        }

        let store = ResumeStore::for_output(&job.output_path);
        let (mut segments, fresh) = self.initial_segments(job, &store);
        let resumed_segments = segments.iter().filter(|s| s.is_done()).count();

        let file = open_output(&job.output_path, job.total_size, fresh)
            .map_err(write_err(job.output_path.as_path()))?;
        let file = Arc::new(file);

        let mut record = match job.total_size {
            Some(total) if !segments.is_empty() => {
                Some(ResumeRecord::from_segments(&job.url, total, &segments))
            }
            _ => None,
        };
        if let Some(rec) = record.as_ref() {
            store.save(rec).map_err(write_err(store.path()))?;
        }

        let tasks: Vec<SegmentTask> = match job.total_size {
            Some(_) => segments
                .iter()
                .filter(|s| !s.is_done())
                .map(|s| SegmentTask {
                    index: s.index,
                    start: s.start,
                    end: Some(s.end),
                    bytes_written: s.bytes_written,
                    ranged: job.supports_ranges,
                })
                .collect(),
            None => vec![SegmentTask {
                index: 0,
                start: 0,
                end: None,
                bytes_written: 0,
                ranged: false,
            }],
        };

        let segments_total = if job.total_size.is_some() {
            segments.len()
        } else {
            1
        };
        let snapshot = ProgressSnapshot {
            downloaded: segments
                .iter()
                .filter(|s| s.is_done())
                .map(Segment::len)
                .sum(),
            total: job.total_size,
            segments_done: resumed_segments,
            segments_total,
        };
        let mut reporter = ProgressReporter::new(snapshot, self.show_progress, progress);

        if resumed_segments > 0 {
            info!(
                target: "download",
                resumed = resumed_segments,
                pending = tasks.len(),
                remaining_bytes = segments.iter().map(Segment::remaining).sum::<u64>(),
                "检测到断点记录，继续未完成的分段"
            );
        }

        let mut retries = vec![0u32; segments_total];
        let mut failures: Vec<SegmentFailure> = Vec::new();
        let mut write_error: Option<io::Error> = None;
        let mut streamed: u64 = 0;
        let mut stream_done = false;

        if !tasks.is_empty() {
            let worker = SegmentWorker::new(
                self.transport.clone(),
                &job.url,
                file.clone(),
                RetryPolicy::from_config(&self.config),
                cancel.clone(),
            );
            let mut pool = WorkerPool::new(worker, job.threads.min(tasks.len()));
            debug!(target: "download", workers = pool.len(), tasks = tasks.len(), "启动下载线程");

            for task in &tasks {
                if let Some(seg) = segments.get_mut(task.index) {
                    seg.status = SegmentStatus::InProgress;
                }
                pool.submit(*task);
            }
            pool.close();

            let mut finished = 0usize;
            while finished < tasks.len() {
                let event = match pool.events().recv_timeout(EVENT_POLL) {
                    Ok(ev) => ev,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                };

                match event {
                    WorkerEvent::Progress { index, bytes } => {
                        match segments.get_mut(index) {
                            Some(seg) => seg.bytes_written += bytes,
                            None => streamed += bytes,
                        }
                        reporter.add_bytes(bytes);
                    }
                    WorkerEvent::Rewind { index, bytes } => {
                        match segments.get_mut(index) {
                            Some(seg) => seg.bytes_written = seg.bytes_written.saturating_sub(bytes),
                            None => streamed = streamed.saturating_sub(bytes),
                        }
                        reporter.rewind_bytes(bytes);
                    }
                    WorkerEvent::Finished { index, outcome } => {
                        finished += 1;
                        if let Some(r) = retries.get_mut(index) {
                            *r = outcome.retries();
                        }
                        let seg = segments.get_mut(index);
                        match outcome {
                            WorkerOutcome::Done { .. } => {
                                match seg {
                                    Some(seg) => seg.mark_done(),
                                    None => stream_done = true,
                                }
                                if let Some(rec) = record.as_mut() {
                                    rec.mark_done(index);
                                    if let Err(e) = store.save(rec) {
                                        warn!(target: "download", "写入断点记录失败: {e}");
                                    }
                                }
                                reporter.inc_segment_done();
                            }
                            WorkerOutcome::Failed { retries, error } => {
                                if let Some(seg) = seg {
                                    seg.status = SegmentStatus::Failed;
                                }
                                failures.push(SegmentFailure {
                                    index,
                                    attempts: retries + 1,
                                    cause: error,
                                });
                            }
                            WorkerOutcome::Cancelled { .. } => {
                                if let Some(seg) = seg {
                                    seg.status = SegmentStatus::Pending;
                                }
                            }
                            WorkerOutcome::WriteFailed { error, .. } => {
                                error!(target: "download", segment = index, "写入输出文件失败: {error}");
                                if let Some(seg) = seg {
                                    seg.status = SegmentStatus::Failed;
                                }
                                write_error.get_or_insert(error);
                            }
                        }
                    }
                }
            }
            pool.shutdown();
        }

        reporter.finish();

        if let Some(source) = write_error {
            return Err(DownloadError::FileWrite {
                path: job.output_path.clone(),
                source,
            });
        }

        let complete = match job.total_size {
            Some(_) => segments.iter().all(Segment::is_done),
            None => stream_done,
        };
        if !complete {
            if cancel.load(Ordering::Relaxed) {
                info!(
                    target: "download",
                    sidecar = %store.path().display(),
                    "下载已取消，断点记录已保留"
                );
                return Err(DownloadError::Cancelled);
            }
            // worker 线程异常退出时不会回报结果
            for task in &tasks {
                let unreported = match segments.get(task.index) {
                    Some(seg) => seg.status == SegmentStatus::InProgress,
                    None => !stream_done && failures.is_empty(),
                };
                if unreported {
                    failures.push(SegmentFailure {
                        index: task.index,
                        attempts: retries.get(task.index).copied().unwrap_or(0) + 1,
                        cause: FetchError::Stream("worker exited unexpectedly".to_string()),
                    });
                }
            }
            failures.sort_by_key(|f| f.index);
            error!(
                target: "download",
                failed = ?failures.iter().map(|f| f.index).collect::<Vec<_>>(),
                "部分分段下载失败，已保留断点记录"
            );
            return Err(DownloadError::SegmentDownload {
                url: job.url.clone(),
                failures,
            });
        }

        let total_bytes = job.total_size.unwrap_or(streamed);
        if job.total_size.is_none() {
            // 整流重试后可能残留上一轮多写的尾部
            file.set_len(total_bytes)
                .map_err(write_err(job.output_path.as_path()))?;
        }
        file.sync_all().map_err(write_err(job.output_path.as_path()))?;
        drop(file);

        let sha256 = sha256_file(&job.output_path)?;
        store.clear().map_err(write_err(store.path()))?;

        let elapsed = started.elapsed();
        info!(
            target: "download",
            path = %job.output_path.display(),
            bytes = total_bytes,
            sha256 = %sha256,
            "下载完成，用时 {:.1}s",
            elapsed.as_secs_f32()
        );

        Ok(DownloadResult {
            path: job.output_path.clone(),
            total_bytes,
            elapsed,
            sha256,
            segment_retries: retries,
            resumed_segments,
        })
    }

    /// 本次执行是否会续传已有的输出文件（不记录日志、不改动任何文件）。
    pub fn will_resume(&self, job: &DownloadJob) -> bool {
        let Some(total) = job.total_size else {
            return false;
        };
        ResumeStore::for_output(&job.output_path)
            .try_load(&job.url, total)
            .is_ok_and(|record| resume_usable(job, total, &record.to_segments()))
    }

    /// 返回初始分段与是否为全新下载。
    fn initial_segments(&self, job: &DownloadJob, store: &ResumeStore) -> (Vec<Segment>, bool) {
        let Some(total) = job.total_size else {
            // 长度未知的任务不可续传，顺手清掉旧记录
            if let Err(e) = store.clear() {
                warn!(target: "download", "清理旧断点记录失败: {e}");
            }
            return (Vec::new(), true);
        };

        if let Some(record) = store.load(&job.url, total) {
            let segments = record.to_segments();
            if resume_usable(job, total, &segments) {
                return (segments, false);
            }
            warn!(
                target: "download",
                path = %job.output_path.display(),
                "输出文件与断点记录不一致，重新下载"
            );
        }

        let segments = plan_segments_with_min(total, job.threads, self.config.min_segment_size);
        debug!(target: "download", segments = segments.len(), "生成分段计划");
        (segments, true)
    }
}

/// 断点记录只有在输出文件长度一致、且分段布局可用时才采用。
fn resume_usable(job: &DownloadJob, total: u64, segments: &[Segment]) -> bool {
    let file_matches = fs::metadata(&job.output_path)
        .map(|m| m.is_file() && m.len() == total)
        .unwrap_or(false);
    let layout_usable =
        job.supports_ranges || segments.len() == 1 || segments.iter().all(Segment::is_done);
    file_matches && layout_usable
}

/// 以默认配置下载单个 URL。
///
/// `output_dir` 为空时使用系统下载目录，`threads` 为 0 时使用默认并发数。
pub fn run(
    url: &str,
    output_dir: Option<&Path>,
    threads: usize,
) -> Result<DownloadResult, DownloadError> {
    let downloader = Downloader::with_http(Config::default())
        .map_err(|e| DownloadError::from_probe(url, e))?;
    let mut request = DownloadRequest::new(url).threads(threads);
    request.output_dir = output_dir.map(Path::to_path_buf);
    downloader.run(&request, Arc::new(AtomicBool::new(false)), None)
}

fn validate_url(url: &str) -> Result<(), DownloadError> {
    let invalid = |reason: String| DownloadError::InvalidUrl {
        url: url.to_string(),
        reason,
    };
    let parsed = Url::parse(url).map_err(|e| invalid(e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(invalid(format!("unsupported scheme '{other}'"))),
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }
    Ok(())
}

fn open_output(path: &Path, total: Option<u64>, fresh: bool) -> io::Result<File> {
    let file = File::options()
        .create(true)
        .read(true)
        .write(true)
        .truncate(fresh)
        .open(path)?;
    if let Some(total) = total {
        file.set_len(total)?;
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_validation() {
        assert!(validate_url("https://example.com/a.bin").is_ok());
        assert!(validate_url("http://127.0.0.1:8080/x").is_ok());
        assert!(matches!(
            validate_url("ftp://example.com/a.bin"),
            Err(DownloadError::InvalidUrl { .. })
        ));
        assert!(matches!(
            validate_url("not a url"),
            Err(DownloadError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn request_builder_sets_fields() {
        let req = DownloadRequest::new("https://h/f")
            .output_dir("/tmp/out")
            .threads(3)
            .file_name("x.bin");
        assert_eq!(req.output_dir.as_deref(), Some(Path::new("/tmp/out")));
        assert_eq!(req.threads, Some(3));
        assert_eq!(req.file_name.as_deref(), Some("x.bin"));
    }

    #[test]
    fn fresh_open_truncates_and_presizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        std::fs::write(&path, vec![7u8; 50]).unwrap();

        let file = open_output(&path, Some(20), true).unwrap();
        drop(file);
        assert_eq!(std::fs::read(&path).unwrap(), vec![0u8; 20]);

        std::fs::write(&path, vec![7u8; 20]).unwrap();
        let file = open_output(&path, Some(20), false).unwrap();
        drop(file);
        assert_eq!(std::fs::read(&path).unwrap(), vec![7u8; 20]);
    }
}
