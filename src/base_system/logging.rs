//! 日志系统。
//!
//! - 控制台：INFO（`--debug` 时 DEBUG），显示进度条时关闭
//! - 文件：`<data>/logs/latest.log`，始终 DEBUG，屏蔽 HTTP 栈的底层噪音
//! - 退出或 panic 时把 `latest.log` 压缩为 zip，只保留最近若干份

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use time::OffsetDateTime;
use time::macros::format_description;
use tracing::{debug, error};
use tracing_appender::non_blocking::{NonBlockingBuilder, WorkerGuard};
use tracing_subscriber::Layer;
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use zip::CompressionMethod;
use zip::write::FileOptions;

const LATEST_LOG: &str = "latest.log";
const ARCHIVE_PREFIX: &str = "swift-downloader_";
/// 启动时超过该大小的旧日志先归档。
const ROTATE_BYTES: u64 = 8 * 1024 * 1024;
const KEEP_ARCHIVES: usize = 20;
// Windows 上等待写线程释放文件句柄
const SETTLE: Duration = Duration::from_millis(150);

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("time formatting failed: {0}")]
    Time(#[from] time::error::Format),
}

#[derive(Clone, Copy, Debug)]
pub struct LogOptions {
    pub debug: bool,
    pub use_color: bool,
    pub archive_on_exit: bool,
    /// 是否输出到控制台（stdout）。进度条绘制在 stderr。
    pub console: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            debug: false,
            use_color: true,
            archive_on_exit: true,
            console: true,
        }
    }
}

/// 持有日志写线程；drop 时刷新并归档。
pub struct LogSystem {
    inner: Arc<LogState>,
}

struct LogState {
    dir: PathBuf,
    guard: Mutex<Option<WorkerGuard>>,
    archive_on_exit: bool,
    closed: AtomicBool,
}

impl LogSystem {
    /// 日志目录为 `base_dir/logs`，未指定时为当前目录下的 `logs`。
    pub fn init_with_base(options: LogOptions, base_dir: Option<&Path>) -> Result<Self, LogError> {
        let dir = base_dir.unwrap_or(Path::new(".")).join("logs");
        fs::create_dir_all(&dir)?;

        let latest = dir.join(LATEST_LOG);
        if fs::metadata(&latest).is_ok_and(|m| m.len() >= ROTATE_BYTES) {
            archive_log_file(&latest, &dir)?;
        }

        let appender = tracing_appender::rolling::never(&dir, LATEST_LOG);
        let (writer, guard) = NonBlockingBuilder::default().lossy(false).finish(appender);

        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_thread_names(true)
            .with_writer(writer)
            .with_filter(file_targets());

        let console_layer = options.console.then(|| {
            fmt::layer()
                .with_target(false)
                .with_ansi(options.use_color)
                .with_writer(io::stdout)
                .with_filter(if options.debug {
                    LevelFilter::DEBUG
                } else {
                    LevelFilter::INFO
                })
        });

        tracing_subscriber::registry()
            .with(file_layer)
            .with(console_layer)
            .try_init()
            .map_err(|_| LogError::AlreadyInitialized)?;

        let inner = Arc::new(LogState {
            dir,
            guard: Mutex::new(Some(guard)),
            archive_on_exit: options.archive_on_exit,
            closed: AtomicBool::new(false),
        });
        install_panic_hook(inner.clone());
        debug!(target: "logging", dir = %inner.dir.display(), "日志系统已初始化");

        Ok(Self { inner })
    }

    pub fn logs_dir(&self) -> &Path {
        &self.inner.dir
    }

    /// 刷新日志并（按配置）归档，可重复调用。
    pub fn safe_exit(&self) {
        self.inner.close();
    }
}

impl Drop for LogSystem {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl LogState {
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut guard) = self.guard.lock() {
            guard.take();
        }
        if !self.archive_on_exit {
            return;
        }
        std::thread::sleep(SETTLE);
        let latest = self.dir.join(LATEST_LOG);
        if let Err(err) = archive_log_file(&latest, &self.dir) {
            eprintln!("failed to archive log: {err}");
        }
        if let Err(err) = prune_archives(&self.dir, KEEP_ARCHIVES) {
            eprintln!("failed to prune old logs: {err}");
        }
    }
}

/// 文件日志全量记录本 crate，HTTP 栈只留警告。
fn file_targets() -> Targets {
    Targets::new()
        .with_default(LevelFilter::DEBUG)
        .with_target("hyper", LevelFilter::WARN)
        .with_target("hyper_util", LevelFilter::WARN)
        .with_target("rustls", LevelFilter::WARN)
        .with_target("reqwest", LevelFilter::INFO)
}

fn install_panic_hook(state: Arc<LogState>) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let thread = std::thread::current();
        let name = thread.name().unwrap_or("<unnamed>");
        match info.location() {
            Some(loc) => error!(
                target: "panic",
                thread = name,
                "panic at {}:{}: {info}",
                loc.file(),
                loc.line()
            ),
            None => error!(target: "panic", thread = name, "panic: {info}"),
        }
        // 下载线程 panic 不应结束日志，只有主线程才收尾
        if name == "main" {
            state.close();
        }
        previous(info);
    }));
}

/// 将日志压缩为 `swift-downloader_<时间戳>.zip` 并删除原文件；空日志直接删除。
pub(crate) fn archive_log_file(latest: &Path, dir: &Path) -> Result<Option<PathBuf>, LogError> {
    let len = match fs::metadata(latest) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len == 0 {
        fs::remove_file(latest)?;
        return Ok(None);
    }

    let stamp = OffsetDateTime::now_utc().format(format_description!(
        "[year][month][day]_[hour][minute][second]"
    ))?;
    let mut archive = dir.join(format!("{ARCHIVE_PREFIX}{stamp}.zip"));
    let mut n = 1;
    while archive.exists() {
        archive = dir.join(format!("{ARCHIVE_PREFIX}{stamp}_{n}.zip"));
        n += 1;
    }

    let mut zip = zip::ZipWriter::new(File::create(&archive)?);
    zip.start_file(
        format!("{stamp}.log"),
        FileOptions::default().compression_method(CompressionMethod::Deflated),
    )?;
    io::copy(&mut BufReader::new(File::open(latest)?), &mut zip)?;
    zip.finish()?;

    fs::remove_file(latest)?;
    Ok(Some(archive))
}

/// 只保留最新的 `keep` 份归档（文件名含时间戳，按名称排序即按时间排序）。
pub(crate) fn prune_archives(dir: &Path, keep: usize) -> io::Result<usize> {
    let mut archives: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(ARCHIVE_PREFIX) && n.ends_with(".zip"))
        })
        .collect();
    if archives.len() <= keep {
        return Ok(0);
    }
    archives.sort();
    let excess = archives.len() - keep;
    for old in &archives[..excess] {
        fs::remove_file(old)?;
    }
    Ok(excess)
}
