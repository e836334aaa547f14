//! swift-downloader 命令行入口。
//!
//! 流程：加载配置 → 初始化日志 → 协商并确定输出文件 → （必要时）确认覆盖 →
//! 分段下载 → 打印结果与 SHA-256。

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use indicatif::HumanBytes;
use tracing::{error, info, warn};

use swift_downloader::base_system::config::load_or_create;
use swift_downloader::base_system::context::Config;
use swift_downloader::base_system::logging::{LogOptions, LogSystem};
use swift_downloader::{DownloadError, DownloadRequest, DownloadResult, Downloader};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "swift-downloader", version)]
#[command(about = "Segmented, resumable HTTP(S) downloader with SHA-256 verification")]
struct Cli {
    /// 要下载的文件 URL
    url: String,

    /// 保存目录（必须已存在；缺省时使用配置 save_path 或系统下载目录）
    directory: Option<PathBuf>,

    /// 并发分段数（缺省使用配置 default_threads）
    #[arg(short = 't', long)]
    threads: Option<usize>,

    /// 指定保存的文件名
    #[arg(short = 'o', long)]
    output_name: Option<String>,

    /// 目标文件已存在时不询问，直接覆盖
    #[arg(short = 'y', long, default_value_t = false)]
    yes: bool,

    /// 不显示进度条
    #[arg(long, default_value_t = false)]
    no_progress: bool,

    /// 启用调试日志输出
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// 数据目录路径（用于存放 downloader.yml 和 logs）
    #[arg(long)]
    data_dir: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => match err.downcast_ref::<DownloadError>() {
            Some(e) => {
                eprintln!("[{}] {}", e.component(), e);
                ExitCode::from(e.exit_code() as u8)
            }
            None => {
                eprintln!("[cli] {err:#}");
                ExitCode::FAILURE
            }
        },
    }
}

fn run_cli(cli: Cli) -> Result<()> {
    let data_dir = cli.data_dir.as_deref().map(Path::new);
    let config = load_or_create::<Config>(None, data_dir).context("加载配置失败")?;

    let show_progress = config.show_progress && !cli.no_progress;
    let _log = init_logging(cli.debug, !show_progress, config.archive_logs, data_dir)?;
    info!(target: "startup", "当前版本: v{}", VERSION);

    if let Some(dir) = cli.directory.as_ref()
        && !dir.is_dir()
    {
        bail!("目录不存在: {}", dir.display());
    }

    let cancel = Arc::new(AtomicBool::new(false));
    install_ctrlc(cancel.clone());

    let downloader = Downloader::with_http(config)
        .map_err(|e| anyhow!("初始化 HTTP 客户端失败: {e}"))?
        .progress_bar(show_progress);

    let mut request = DownloadRequest::new(cli.url.as_str());
    request.output_dir = cli.directory.clone();
    request.threads = cli.threads;
    request.file_name = cli.output_name.clone();

    let job = downloader.prepare(&request).inspect_err(log_failure)?;

    // 能续传说明是未完成的下载；否则覆盖已有文件前先确认
    let overwrite = job.output_path.exists() && !downloader.will_resume(&job);
    if overwrite && !cli.yes && !confirm_overwrite(&job.output_path)? {
        info!(target: "startup", path = %job.output_path.display(), "用户取消覆盖");
        println!("已取消：保留现有文件 {}", job.output_path.display());
        return Ok(());
    }

    let result = downloader
        .execute(&job, cancel, None)
        .inspect_err(log_failure)?;
    print_report(&result);
    Ok(())
}

fn log_failure(err: &DownloadError) {
    match err {
        DownloadError::Cancelled => warn!(target: "startup", "下载已取消"),
        other => error!(target: "startup", component = other.component(), "下载失败: {other}"),
    }
}

fn install_ctrlc(cancel: Arc<AtomicBool>) {
    let handler = move || {
        // 第二次 Ctrl-C 直接退出
        if cancel.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        eprintln!("\n正在停止下载，再按一次 Ctrl-C 立即退出…");
    };
    if let Err(e) = ctrlc::set_handler(handler) {
        warn!(target: "startup", "注册 Ctrl-C 处理失败: {e}");
    }
}

fn confirm_overwrite(path: &Path) -> Result<bool> {
    eprint!("文件 {} 已存在，是否覆盖？(y/N) ", path.display());
    io::stderr().flush().ok();

    let mut line = String::new();
    let read = io::stdin().lock().read_line(&mut line)?;
    if read == 0 {
        return Ok(false);
    }
    Ok(matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn print_report(result: &DownloadResult) {
    println!("下载完成: {}", result.path.display());
    println!(
        "大小: {} ({} bytes)",
        HumanBytes(result.total_bytes),
        result.total_bytes
    );
    println!("用时: {:.2}s", result.elapsed.as_secs_f64());
    if result.resumed_segments > 0 {
        println!("续传: {} 个分段沿用断点", result.resumed_segments);
    }
    let retries: u32 = result.segment_retries.iter().sum();
    if retries > 0 {
        println!("重试: {retries} 次");
    }
    println!("SHA-256: {}", result.sha256);
}

fn init_logging(
    debug: bool,
    console: bool,
    archive_on_exit: bool,
    base_dir: Option<&Path>,
) -> Result<LogSystem> {
    let opts = LogOptions {
        debug,
        use_color: true,
        archive_on_exit,
        console,
    };
    LogSystem::init_with_base(opts, base_dir).map_err(|e| anyhow!(e))
}
