//! 下载引擎端到端测试：内存传输层 + 临时目录，不访问网络。

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};

use swift_downloader::base_system::context::Config;
use swift_downloader::download::models::{ResumeRecord, SegmentCheckpoint};
use swift_downloader::download::resume::sidecar_path;
use swift_downloader::download::transport::{ByteRange, ProbeResponse, Transport};
use swift_downloader::download::{
    DownloadError, DownloadRequest, Downloader, FetchError, ProgressSnapshot,
};

const URL: &str = "https://files.example.test/pub/data.bin";
const ALWAYS: u32 = u32::MAX;

struct FakeServer {
    data: Vec<u8>,
    ranges: bool,
    length_known: bool,
    disposition: Option<String>,
    /// 区间起点 → 剩余失败次数。
    failures: Mutex<HashMap<u64, u32>>,
    /// 打开该起点时触发取消。
    cancel_on: Option<(u64, Arc<AtomicBool>)>,
    /// 该起点的响应体交付若干块后触发取消。
    cancel_mid: Option<MidStreamCancel>,
    opens: Mutex<Vec<Option<ByteRange>>>,
}

#[derive(Clone)]
struct MidStreamCancel {
    start: u64,
    chunk: usize,
    chunks: usize,
    flag: Arc<AtomicBool>,
}

/// 每次 `read` 最多交付 `chunk` 字节；交付第 `chunks` 块时置位取消标志。
struct ChunkedBody {
    inner: Cursor<Vec<u8>>,
    chunk: usize,
    left: usize,
    flag: Arc<AtomicBool>,
}

impl Read for ChunkedBody {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let limit = buf.len().min(self.chunk);
        let n = self.inner.read(&mut buf[..limit])?;
        if n > 0 && self.left > 0 {
            self.left -= 1;
            if self.left == 0 {
                self.flag.store(true, Ordering::SeqCst);
            }
        }
        Ok(n)
    }
}

impl FakeServer {
    fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            ranges: true,
            length_known: true,
            disposition: None,
            failures: Mutex::new(HashMap::new()),
            cancel_on: None,
            cancel_mid: None,
            opens: Mutex::new(Vec::new()),
        }
    }

    fn without_ranges(mut self) -> Self {
        self.ranges = false;
        self
    }

    fn without_length(mut self) -> Self {
        self.length_known = false;
        self
    }

    fn failing(self, start: u64, times: u32) -> Self {
        self.failures.lock().unwrap().insert(start, times);
        self
    }

    fn opened_starts(&self) -> Vec<Option<u64>> {
        let mut starts: Vec<_> = self
            .opens
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.map(|r| r.start))
            .collect();
        starts.sort();
        starts
    }

    fn opened_ranges(&self) -> Vec<ByteRange> {
        let mut ranges: Vec<_> = self.opens.lock().unwrap().iter().flatten().copied().collect();
        ranges.sort_by_key(|r| r.start);
        ranges
    }

    fn open_count(&self, start: u64) -> usize {
        self.opens
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.map(|r| r.start) == Some(start))
            .count()
    }
}

impl Transport for FakeServer {
    fn head(&self, _url: &str) -> Result<ProbeResponse, FetchError> {
        Ok(ProbeResponse {
            status: 200,
            content_length: self.length_known.then_some(self.data.len() as u64),
            accept_ranges: self.ranges,
            range_total: None,
            content_disposition: self.disposition.clone(),
        })
    }

    fn probe_range(&self, _url: &str) -> Result<ProbeResponse, FetchError> {
        if self.ranges {
            Ok(ProbeResponse {
                status: 206,
                content_length: Some(1),
                accept_ranges: true,
                range_total: Some(self.data.len() as u64),
                content_disposition: self.disposition.clone(),
            })
        } else {
            self.head(URL)
        }
    }

    fn open(
        &self,
        _url: &str,
        range: Option<ByteRange>,
    ) -> Result<Box<dyn Read + Send>, FetchError> {
        self.opens.lock().unwrap().push(range);
        let start = range.map(|r| r.start).unwrap_or(0);

        if let Some((at, flag)) = self.cancel_on.as_ref()
            && *at == start
        {
            flag.store(true, Ordering::SeqCst);
        }

        if let Some(left) = self.failures.lock().unwrap().get_mut(&start)
            && *left > 0
        {
            if *left != ALWAYS {
                *left -= 1;
            }
            return Err(FetchError::Timeout("injected".into()));
        }

        let body = match range {
            Some(_) if !self.ranges => return Err(FetchError::RangeIgnored(200)),
            Some(r) => {
                let end = r.end.map_or(self.data.len(), |e| e as usize + 1);
                self.data[r.start as usize..end].to_vec()
            }
            None => self.data.clone(),
        };
        if let Some(mid) = self.cancel_mid.as_ref()
            && mid.start == start
        {
            return Ok(Box::new(ChunkedBody {
                inner: Cursor::new(body),
                chunk: mid.chunk,
                left: mid.chunks,
                flag: mid.flag.clone(),
            }));
        }
        Ok(Box::new(Cursor::new(body)))
    }
}

fn test_config() -> Config {
    Config {
        min_wait_time: 1,
        max_wait_time: 2,
        ..Config::default()
    }
}

fn small_segments() -> Config {
    Config {
        min_segment_size: 1,
        ..test_config()
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn sha_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn request(dir: &Path, threads: usize) -> DownloadRequest {
    DownloadRequest::new(URL).output_dir(dir).threads(threads)
}

fn not_cancelled() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

fn read_sidecar(output: &Path) -> ResumeRecord {
    let raw = std::fs::read(sidecar_path(output)).unwrap();
    serde_json::from_slice(&raw).unwrap()
}

fn done_indices(record: &ResumeRecord) -> Vec<usize> {
    record
        .segments
        .iter()
        .filter(|c| c.bytes_written == c.end - c.start + 1)
        .map(|c| c.index)
        .collect()
}

#[test]
fn four_segments_of_a_million_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(1_000_000);
    let server = Arc::new(FakeServer::new(data.clone()));
    let downloader = Downloader::new(test_config(), server.clone());

    let result = downloader
        .run(&request(dir.path(), 4), not_cancelled(), None)
        .unwrap();

    assert_eq!(result.path, dir.path().join("data.bin"));
    assert_eq!(result.total_bytes, 1_000_000);
    assert_eq!(result.sha256, sha_hex(&data));
    assert_eq!(result.segment_retries, vec![0, 0, 0, 0]);
    assert_eq!(result.resumed_segments, 0);
    assert_eq!(
        server.opened_starts(),
        vec![Some(0), Some(250_000), Some(500_000), Some(750_000)]
    );
    assert_eq!(std::fs::read(&result.path).unwrap(), data);
    assert!(!sidecar_path(&result.path).exists());
}

#[test]
fn tiny_file_uses_a_single_segment() {
    let dir = tempfile::tempdir().unwrap();
    let server = Arc::new(FakeServer::new(b"0123456789".to_vec()));
    let downloader = Downloader::new(test_config(), server.clone());

    let result = downloader
        .run(&request(dir.path(), 8), not_cancelled(), None)
        .unwrap();

    assert_eq!(result.total_bytes, 10);
    assert_eq!(result.segment_retries.len(), 1);
    assert_eq!(server.opened_starts(), vec![Some(0)]);
}

#[test]
fn transient_failures_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(1000);
    let server = Arc::new(FakeServer::new(data.clone()).failing(250, 2));
    let downloader = Downloader::new(small_segments(), server.clone());

    let result = downloader
        .run(&request(dir.path(), 4), not_cancelled(), None)
        .unwrap();

    assert_eq!(result.sha256, sha_hex(&data));
    assert_eq!(result.segment_retries, vec![0, 2, 0, 0]);
    assert_eq!(server.open_count(250), 3);
}

#[test]
fn exhausted_segment_fails_and_rerun_fetches_only_it() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(1000);
    let output = dir.path().join("data.bin");

    let broken = Arc::new(FakeServer::new(data.clone()).failing(500, ALWAYS));
    let err = Downloader::new(small_segments(), broken.clone())
        .run(&request(dir.path(), 4), not_cancelled(), None)
        .unwrap_err();

    assert_eq!(err.failed_segments(), vec![2]);
    assert_eq!(err.exit_code(), 1);
    match &err {
        DownloadError::SegmentDownload { failures, .. } => {
            assert_eq!(failures[0].attempts, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(broken.open_count(500), 3);

    // 部分文件与断点记录保留，记录中 0、1、3 已完成
    assert!(output.exists());
    assert_eq!(done_indices(&read_sidecar(&output)), vec![0, 1, 3]);

    let healthy = Arc::new(FakeServer::new(data.clone()));
    let result = Downloader::new(small_segments(), healthy.clone())
        .run(&request(dir.path(), 4), not_cancelled(), None)
        .unwrap();

    assert_eq!(healthy.opened_starts(), vec![Some(500)]);
    assert_eq!(result.resumed_segments, 3);
    assert_eq!(result.sha256, sha_hex(&data));
    assert_eq!(std::fs::read(&output).unwrap(), data);
    assert!(!sidecar_path(&output).exists());
}

#[test]
fn completed_sidecar_skips_segment_requests() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(1000);
    let output = dir.path().join("data.bin");
    std::fs::write(&output, &data).unwrap();

    let record = ResumeRecord {
        version: ResumeRecord::VERSION,
        url: URL.to_string(),
        total_size: 1000,
        segments: (0..4u64)
            .map(|i| SegmentCheckpoint {
                index: i as usize,
                start: i * 250,
                end: i * 250 + 249,
                bytes_written: 250,
            })
            .collect(),
    };
    std::fs::write(
        sidecar_path(&output),
        serde_json::to_vec_pretty(&record).unwrap(),
    )
    .unwrap();

    let server = Arc::new(FakeServer::new(data.clone()));
    let result = Downloader::new(small_segments(), server.clone())
        .run(&request(dir.path(), 4), not_cancelled(), None)
        .unwrap();

    assert!(server.opened_starts().is_empty());
    assert_eq!(result.resumed_segments, 4);
    assert_eq!(result.sha256, sha_hex(&data));
    assert!(!sidecar_path(&output).exists());
}

#[test]
fn sidecar_for_another_url_restarts_everything() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(1000);
    let output = dir.path().join("data.bin");
    std::fs::write(&output, vec![0xAA; 1000]).unwrap();

    let record = ResumeRecord {
        version: ResumeRecord::VERSION,
        url: "https://elsewhere.example.test/data.bin".to_string(),
        total_size: 1000,
        segments: vec![SegmentCheckpoint {
            index: 0,
            start: 0,
            end: 999,
            bytes_written: 1000,
        }],
    };
    std::fs::write(
        sidecar_path(&output),
        serde_json::to_vec(&record).unwrap(),
    )
    .unwrap();

    let server = Arc::new(FakeServer::new(data.clone()));
    let result = Downloader::new(small_segments(), server.clone())
        .run(&request(dir.path(), 4), not_cancelled(), None)
        .unwrap();

    assert_eq!(server.opened_starts().len(), 4);
    assert_eq!(result.resumed_segments, 0);
    assert_eq!(std::fs::read(&output).unwrap(), data);
}

#[test]
fn corrupt_sidecar_degrades_to_fresh_start() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(600);
    let output = dir.path().join("data.bin");
    std::fs::write(sidecar_path(&output), b"{\"version\": 1, \"url\": ").unwrap();

    let server = Arc::new(FakeServer::new(data.clone()));
    let result = Downloader::new(small_segments(), server.clone())
        .run(&request(dir.path(), 3), not_cancelled(), None)
        .unwrap();

    assert_eq!(server.opened_starts(), vec![Some(0), Some(200), Some(400)]);
    assert_eq!(result.sha256, sha_hex(&data));
}

#[test]
fn cancellation_keeps_sidecar_and_resume_finishes_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(1000);
    let output = dir.path().join("data.bin");
    let cancel = not_cancelled();

    let mut server = FakeServer::new(data.clone());
    server.cancel_on = Some((500, cancel.clone()));
    let server = Arc::new(server);
    let err = Downloader::new(small_segments(), server)
        .run(&request(dir.path(), 4), cancel, None)
        .unwrap_err();

    assert!(matches!(err, DownloadError::Cancelled));
    assert_eq!(err.exit_code(), 130);
    let record = read_sidecar(&output);
    let done = done_indices(&record);
    assert!(!done.contains(&2));

    let rerun = Arc::new(FakeServer::new(data.clone()));
    let result = Downloader::new(small_segments(), rerun.clone())
        .run(&request(dir.path(), 4), not_cancelled(), None)
        .unwrap();

    let expected: Vec<Option<u64>> = record
        .segments
        .iter()
        .filter(|c| !done.contains(&c.index))
        .map(|c| Some(c.start))
        .collect();
    assert_eq!(rerun.opened_starts(), expected);
    assert_eq!(result.resumed_segments, done.len());
    assert_eq!(std::fs::read(&output).unwrap(), data);
}

#[test]
fn interrupted_segment_restarts_from_its_start_on_rerun() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(1_000_000);
    let output = dir.path().join("data.bin");
    let cancel = not_cancelled();

    let mut server = FakeServer::new(data.clone());
    server.cancel_mid = Some(MidStreamCancel {
        start: 500_000,
        chunk: 1000,
        chunks: 10,
        flag: cancel.clone(),
    });
    let err = Downloader::new(test_config(), Arc::new(server))
        .run(&request(dir.path(), 4), cancel, None)
        .unwrap_err();
    assert!(matches!(err, DownloadError::Cancelled));

    // 分段 2 已写入前 10 块，但尚未完成
    let partial = std::fs::read(&output).unwrap();
    assert_eq!(partial.len(), 1_000_000);
    assert_eq!(&partial[500_000..510_000], &data[500_000..510_000]);
    let record = read_sidecar(&output);
    let done = done_indices(&record);
    assert!(!done.contains(&2));

    let rerun = Arc::new(FakeServer::new(data.clone()));
    let downloader = Downloader::new(test_config(), rerun.clone());
    let job = downloader.prepare(&request(dir.path(), 4)).unwrap();
    assert!(downloader.will_resume(&job));
    let result = downloader.execute(&job, not_cancelled(), None).unwrap();

    let ranges = rerun.opened_ranges();
    assert!(ranges.contains(&ByteRange::new(500_000, 749_999)));
    for index in &done {
        let seg = &record.segments[*index];
        assert!(ranges.iter().all(|r| r.start != seg.start));
    }
    assert_eq!(ranges.len(), 4 - done.len());
    assert_eq!(result.resumed_segments, done.len());
    assert_eq!(std::fs::read(&output).unwrap(), data);
    assert!(!sidecar_path(&output).exists());
}

#[test]
fn overwrite_check_only_trusts_a_matching_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("data.bin");
    std::fs::write(&output, vec![0xAA; 1000]).unwrap();

    let downloader = Downloader::new(small_segments(), Arc::new(FakeServer::new(payload(1000))));
    let job = downloader.prepare(&request(dir.path(), 2)).unwrap();
    assert!(!downloader.will_resume(&job));

    let sidecar = |url: &str| ResumeRecord {
        version: ResumeRecord::VERSION,
        url: url.to_string(),
        total_size: 1000,
        segments: vec![
            SegmentCheckpoint {
                index: 0,
                start: 0,
                end: 499,
                bytes_written: 500,
            },
            SegmentCheckpoint {
                index: 1,
                start: 500,
                end: 999,
                bytes_written: 0,
            },
        ],
    };

    std::fs::write(
        sidecar_path(&output),
        serde_json::to_vec(&sidecar("https://elsewhere.example.test/data.bin")).unwrap(),
    )
    .unwrap();
    assert!(!downloader.will_resume(&job));
    // 检查本身不动任何文件
    assert!(sidecar_path(&output).exists());

    std::fs::write(sidecar_path(&output), serde_json::to_vec(&sidecar(URL)).unwrap()).unwrap();
    assert!(downloader.will_resume(&job));

    std::fs::write(&output, vec![0xAA; 10]).unwrap();
    assert!(!downloader.will_resume(&job));
}

#[test]
fn cancelled_before_start_makes_no_requests() {
    let dir = tempfile::tempdir().unwrap();
    let server = Arc::new(FakeServer::new(payload(1000)));

    let err = Downloader::new(small_segments(), server.clone())
        .run(
            &request(dir.path(), 4),
            Arc::new(AtomicBool::new(true)),
            None,
        )
        .unwrap_err();

    assert!(matches!(err, DownloadError::Cancelled));
    assert!(server.opened_starts().is_empty());
    assert!(sidecar_path(&dir.path().join("data.bin")).exists());
}

#[test]
fn unknown_length_streams_without_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(5000);
    let output = dir.path().join("data.bin");
    // 旧的记录会被清理
    std::fs::write(sidecar_path(&output), b"{}").unwrap();

    let server = Arc::new(FakeServer::new(data.clone()).without_ranges().without_length());
    let result = Downloader::new(test_config(), server.clone())
        .run(&request(dir.path(), 8), not_cancelled(), None)
        .unwrap();

    assert_eq!(server.opened_starts(), vec![None]);
    assert_eq!(result.total_bytes, 5000);
    assert_eq!(result.sha256, sha_hex(&data));
    assert!(!sidecar_path(&output).exists());
}

#[test]
fn failed_unknown_length_download_leaves_no_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let server = Arc::new(
        FakeServer::new(payload(100))
            .without_ranges()
            .without_length()
            .failing(0, ALWAYS),
    );

    let err = Downloader::new(test_config(), server)
        .run(&request(dir.path(), 4), not_cancelled(), None)
        .unwrap_err();

    assert_eq!(err.failed_segments(), vec![0]);
    assert!(!sidecar_path(&dir.path().join("data.bin")).exists());
}

#[test]
fn known_length_without_ranges_downloads_in_one_stream() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(300_000);
    let server = Arc::new(FakeServer::new(data.clone()).without_ranges());

    let result = Downloader::new(test_config(), server.clone())
        .run(&request(dir.path(), 8), not_cancelled(), None)
        .unwrap();

    assert_eq!(server.opened_starts(), vec![None]);
    assert_eq!(result.segment_retries.len(), 1);
    assert_eq!(std::fs::read(&result.path).unwrap(), data);
}

#[test]
fn empty_remote_file_produces_empty_output() {
    let dir = tempfile::tempdir().unwrap();
    let server = Arc::new(FakeServer::new(Vec::new()));

    let result = Downloader::new(test_config(), server.clone())
        .run(&request(dir.path(), 4), not_cancelled(), None)
        .unwrap();

    assert_eq!(result.total_bytes, 0);
    assert_eq!(
        result.sha256,
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
    assert!(server.opened_starts().is_empty());
    assert_eq!(std::fs::metadata(&result.path).unwrap().len(), 0);
}

#[test]
fn server_filename_and_explicit_name() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = FakeServer::new(payload(10));
    server.disposition = Some("attachment; filename=\"report 2024.pdf\"".to_string());
    let downloader = Downloader::new(test_config(), Arc::new(server));

    let job = downloader.prepare(&request(dir.path(), 2)).unwrap();
    assert_eq!(job.output_path, dir.path().join("report 2024.pdf"));

    let job = downloader
        .prepare(&request(dir.path(), 2).file_name("custom.bin"))
        .unwrap();
    assert_eq!(job.output_path, dir.path().join("custom.bin"));
}

#[test]
fn progress_callback_reaches_total() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(1000);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();

    Downloader::new(small_segments(), Arc::new(FakeServer::new(data)))
        .run(
            &request(dir.path(), 4),
            not_cancelled(),
            Some(Box::new(move |s: ProgressSnapshot| sink.lock().unwrap().push(s))),
        )
        .unwrap();

    let seen = seen.lock().unwrap();
    let last = seen.last().unwrap();
    assert_eq!(last.downloaded, 1000);
    assert_eq!(last.total, Some(1000));
    assert_eq!(last.segments_done, 4);
    assert!(seen.windows(2).all(|w| w[0].downloaded <= w[1].downloaded));
}

#[test]
fn invalid_url_is_rejected_before_any_request() {
    let dir = tempfile::tempdir().unwrap();
    let server = Arc::new(FakeServer::new(payload(10)));
    let err = Downloader::new(test_config(), server.clone())
        .run(
            &DownloadRequest::new("ftp://files.example.test/a").output_dir(dir.path()),
            not_cancelled(),
            None,
        )
        .unwrap_err();

    assert!(matches!(err, DownloadError::InvalidUrl { .. }));
    assert_eq!(err.component(), "negotiate");
    assert!(server.opened_starts().is_empty());
}
