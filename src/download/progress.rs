//! 进度上报与 CLI 进度条管理。

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use super::models::ProgressSnapshot;

pub type ProgressCallback = Box<dyn FnMut(ProgressSnapshot) + Send>;

pub(crate) struct ProgressReporter {
    pub(crate) snapshot: ProgressSnapshot,
    cb: Option<ProgressCallback>, // optional UI callback
    bar: Option<ProgressBar>,
}

impl ProgressReporter {
    pub(crate) fn new(
        snapshot: ProgressSnapshot,
        show_bar: bool,
        cb: Option<ProgressCallback>,
    ) -> Self {
        let bar = show_bar.then(|| make_bar(snapshot.total, snapshot.downloaded));
        let mut reporter = Self { snapshot, cb, bar };
        reporter.emit();
        reporter
    }

    fn emit(&mut self) {
        if let Some(cb) = self.cb.as_mut() {
            cb(self.snapshot);
        }
    }

    pub(crate) fn add_bytes(&mut self, n: u64) {
        self.snapshot.downloaded += n;
        if let Some(bar) = self.bar.as_ref() {
            bar.inc(n);
        }
        self.emit();
    }

    /// 分段重试时回退该段已计入但未落盘确认的字节。
    pub(crate) fn rewind_bytes(&mut self, n: u64) {
        self.snapshot.downloaded = self.snapshot.downloaded.saturating_sub(n);
        if let Some(bar) = self.bar.as_ref() {
            bar.set_position(self.snapshot.downloaded);
        }
        self.emit();
    }

    pub(crate) fn inc_segment_done(&mut self) {
        self.snapshot.segments_done =
            (self.snapshot.segments_done + 1).min(self.snapshot.segments_total);
        if let Some(bar) = self.bar.as_ref() {
            bar.set_message(format!(
                "{}/{} 段",
                self.snapshot.segments_done, self.snapshot.segments_total
            ));
        }
        self.emit();
    }

    pub(crate) fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.abandon();
        }
    }
}

fn make_bar(total: Option<u64>, position: u64) -> ProgressBar {
    let (bar, template) = match total {
        Some(total) => (
            ProgressBar::new(total),
            "[{elapsed_precise}] {wide_bar} {bytes}/{total_bytes} {bytes_per_sec} ({eta}) {msg}",
        ),
        None => (
            ProgressBar::new_spinner(),
            "[{elapsed_precise}] {spinner} {bytes} {bytes_per_sec} {msg}",
        ),
    };
    bar.set_draw_target(ProgressDrawTarget::stderr());
    bar.set_style(
        ProgressStyle::with_template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-"),
    );
    bar.set_position(position);
    bar
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn callback_sees_every_update() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut reporter = ProgressReporter::new(
            ProgressSnapshot {
                downloaded: 10,
                total: Some(100),
                segments_done: 1,
                segments_total: 2,
            },
            false,
            Some(Box::new(move |s: ProgressSnapshot| sink.lock().unwrap().push(s))),
        );
        reporter.add_bytes(40);
        reporter.rewind_bytes(15);
        reporter.inc_segment_done();
        reporter.inc_segment_done();
        reporter.finish();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 5);
        assert_eq!(seen[1].downloaded, 50);
        assert_eq!(seen[2].downloaded, 35);
        assert_eq!(seen[4].segments_done, 2);
    }
}
