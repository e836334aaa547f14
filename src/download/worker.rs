//! 分段下载工作线程与工作池。
//!
//! 每个分段由且仅由一个 worker 写入；worker 直接把数据写到预分配输出文件中
//! 属于自己的区间，通过事件通道把进度和结果交给协调线程。

use std::fs::File;
use std::io::{self, ErrorKind, Read};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crossbeam_channel as channel;
use tracing::{debug, warn};

use super::error::FetchError;
use super::transport::{ByteRange, Transport};
use crate::base_system::retry::RetryPolicy;

const READ_BUF: usize = 64 * 1024;

/// 交给 worker 的一段任务。`end` 为 `None` 表示长度未知的整流下载。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentTask {
    pub index: usize,
    pub start: u64,
    pub end: Option<u64>,
    pub bytes_written: u64,
    pub ranged: bool,
}

impl SegmentTask {
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end - self.start + 1)
    }
}

#[derive(Debug)]
pub enum WorkerOutcome {
    Done { retries: u32, bytes: u64 },
    Failed { retries: u32, error: FetchError },
    Cancelled { retries: u32 },
    WriteFailed { retries: u32, error: io::Error },
}

impl WorkerOutcome {
    pub fn retries(&self) -> u32 {
        match self {
            WorkerOutcome::Done { retries, .. }
            | WorkerOutcome::Failed { retries, .. }
            | WorkerOutcome::Cancelled { retries }
            | WorkerOutcome::WriteFailed { retries, .. } => *retries,
        }
    }
}

#[derive(Debug)]
pub enum WorkerEvent {
    Progress { index: usize, bytes: u64 },
    /// 不支持 Range 时重试需从头开始，之前写入的字节作废。
    Rewind { index: usize, bytes: u64 },
    Finished { index: usize, outcome: WorkerOutcome },
}

enum AttemptError {
    Fetch(FetchError),
    Write(io::Error),
    Cancelled,
}

#[derive(Clone)]
pub struct SegmentWorker {
    transport: Arc<dyn Transport>,
    url: Arc<str>,
    file: Arc<File>,
    policy: RetryPolicy,
    cancel: Arc<AtomicBool>,
}

impl SegmentWorker {
    pub fn new(
        transport: Arc<dyn Transport>,
        url: &str,
        file: Arc<File>,
        policy: RetryPolicy,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            transport,
            url: Arc::from(url),
            file,
            policy,
            cancel,
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// 下载一个分段，瞬时错误按策略重试剩余区间。
    pub fn run(&self, task: SegmentTask, events: &channel::Sender<WorkerEvent>) -> WorkerOutcome {
        let mut written = task.bytes_written;
        let mut attempt: u32 = 0;

        loop {
            if self.cancelled() {
                return WorkerOutcome::Cancelled { retries: attempt };
            }

            let range = if task.ranged {
                Some(ByteRange {
                    start: task.start + written,
                    end: task.end,
                })
            } else {
                if written > 0 {
                    let _ = events.send(WorkerEvent::Rewind {
                        index: task.index,
                        bytes: written,
                    });
                    written = 0;
                }
                None
            };

            match self.fetch_into(&task, range, &mut written, events) {
                Ok(()) => {
                    debug!(
                        target: "worker",
                        segment = task.index,
                        bytes = written,
                        retries = attempt,
                        "分段完成"
                    );
                    return WorkerOutcome::Done {
                        retries: attempt,
                        bytes: written,
                    };
                }
                Err(AttemptError::Cancelled) => {
                    return WorkerOutcome::Cancelled { retries: attempt };
                }
                Err(AttemptError::Write(error)) => {
                    return WorkerOutcome::WriteFailed {
                        retries: attempt,
                        error,
                    };
                }
                Err(AttemptError::Fetch(error)) => {
                    attempt += 1;
                    if !error.is_transient() || attempt >= self.policy.max_attempts {
                        warn!(
                            target: "worker",
                            segment = task.index,
                            attempts = attempt,
                            "分段下载失败: {error}"
                        );
                        return WorkerOutcome::Failed {
                            retries: attempt - 1,
                            error,
                        };
                    }
                    warn!(
                        target: "worker",
                        segment = task.index,
                        attempt,
                        wait_ms = self.policy.delay(attempt - 1).as_millis() as u64,
                        "分段请求失败，稍后重试: {error}"
                    );
                    if !self.policy.sleep(attempt - 1, &self.cancel) {
                        return WorkerOutcome::Cancelled { retries: attempt };
                    }
                }
            }
        }
    }

    fn fetch_into(
        &self,
        task: &SegmentTask,
        range: Option<ByteRange>,
        written: &mut u64,
        events: &channel::Sender<WorkerEvent>,
    ) -> Result<(), AttemptError> {
        let expected = task.len();
        if expected.is_some_and(|len| *written >= len) {
            return Ok(());
        }

        let mut body = self
            .transport
            .open(&self.url, range)
            .map_err(AttemptError::Fetch)?;
        let mut buf = vec![0u8; READ_BUF];

        loop {
            if self.cancelled() {
                return Err(AttemptError::Cancelled);
            }
            let mut n = match body.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(AttemptError::Fetch(fetch_error_from_io(e))),
            };
            // 不写出本段区间之外的数据
            if let Some(len) = expected {
                n = n.min((len - *written) as usize);
            }

            write_all_at(&self.file, &buf[..n], task.start + *written)
                .map_err(AttemptError::Write)?;
            *written += n as u64;
            let _ = events.send(WorkerEvent::Progress {
                index: task.index,
                bytes: n as u64,
            });

            if expected.is_some_and(|len| *written >= len) {
                break;
            }
        }

        match expected {
            Some(len) if *written < len => Err(AttemptError::Fetch(FetchError::Stream(format!(
                "body ended after {} of {} bytes",
                *written, len
            )))),
            _ => Ok(()),
        }
    }
}

fn fetch_error_from_io(e: io::Error) -> FetchError {
    match e.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => FetchError::Timeout(e.to_string()),
        _ => FetchError::Stream(e.to_string()),
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ));
            }
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

// ── WorkerPool ────────────────────────────────────────────────

/// 固定数量的下载线程，从任务队列取分段执行。
pub(crate) struct WorkerPool {
    tx: Option<channel::Sender<SegmentTask>>,
    rx_evt: channel::Receiver<WorkerEvent>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn new(worker: SegmentWorker, workers: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = channel::unbounded::<SegmentTask>();
        let (tx_evt, rx_evt) = channel::unbounded::<WorkerEvent>();

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let rx = rx.clone();
            let tx_evt = tx_evt.clone();
            let worker = worker.clone();

            let spawned = std::thread::Builder::new()
                .name(format!("segment-worker-{i}"))
                .spawn(move || {
                    for task in rx.iter() {
                        // 取消后队列中剩余的任务直接回报，不再发起请求
                        let outcome = if worker.cancelled() {
                            WorkerOutcome::Cancelled { retries: 0 }
                        } else {
                            worker.run(task, &tx_evt)
                        };
                        let _ = tx_evt.send(WorkerEvent::Finished {
                            index: task.index,
                            outcome,
                        });
                    }
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => warn!(target: "worker", "无法创建下载线程: {e}"),
            }
        }

        Self {
            tx: Some(tx),
            rx_evt,
            handles,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    pub(crate) fn submit(&self, task: SegmentTask) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(task);
        }
    }

    /// 不再接收新任务；已排队的任务仍会执行完。
    pub(crate) fn close(&mut self) {
        self.tx.take();
    }

    pub(crate) fn events(&self) -> &channel::Receiver<WorkerEvent> {
        &self.rx_evt
    }

    pub(crate) fn shutdown(&mut self) {
        self.tx.take();
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
