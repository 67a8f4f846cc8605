//! Crawl progress reporting.
//!
//! Reports observable progress during `smartdrive crawl` so the operator sees
//! how far discovery got, which folder is being walked, and how slow OCR is
//! page by page. Progress is emitted on **stderr** so stdout stays reserved
//! for the final summary.

use std::io::Write;
use std::sync::Arc;

/// A single progress event.
#[derive(Clone, Debug)]
pub enum CrawlProgressEvent {
    /// Discovery has found `folders` folders so far.
    Discovering { folders: u64 },
    /// The orchestrator entered a folder.
    Walking { folder: String },
    /// `n` files processed so far (including unchanged and list-only files).
    Processed { n: u64, name: String },
    /// One page went through an OCR engine.
    OcrPage {
        file: String,
        engine: &'static str,
        page: usize,
        total: usize,
    },
    /// Upload stage: `n` of `total` documents handled.
    Uploading { n: u64, total: u64 },
}

/// Reports crawl progress. Implementations write to stderr (human or JSON).
pub trait CrawlProgressReporter: Send + Sync {
    fn report(&self, event: CrawlProgressEvent);
}

/// Human-friendly progress on stderr: "crawl  processed  1,234 files  report.pdf".
pub struct StderrProgress;

impl CrawlProgressReporter for StderrProgress {
    fn report(&self, event: CrawlProgressEvent) {
        let line = match &event {
            CrawlProgressEvent::Discovering { folders } => {
                format!("crawl  discovering  {} folders\n", format_number(*folders))
            }
            CrawlProgressEvent::Walking { folder } => format!("crawl  walking  {}\n", folder),
            CrawlProgressEvent::Processed { n, name } => {
                format!("crawl  processed  {} files  {}\n", format_number(*n), name)
            }
            CrawlProgressEvent::OcrPage {
                file,
                engine,
                page,
                total,
            } => format!("ocr {}  {}  page {}/{}\n", engine, file, page, total),
            CrawlProgressEvent::Uploading { n, total } => format!(
                "upload  {} / {} documents\n",
                format_number(*n),
                format_number(*total)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl CrawlProgressReporter for JsonProgress {
    fn report(&self, event: CrawlProgressEvent) {
        let obj = match &event {
            CrawlProgressEvent::Discovering { folders } => serde_json::json!({
                "event": "progress",
                "phase": "discovering",
                "folders": folders
            }),
            CrawlProgressEvent::Walking { folder } => serde_json::json!({
                "event": "progress",
                "phase": "walking",
                "folder": folder
            }),
            CrawlProgressEvent::Processed { n, name } => serde_json::json!({
                "event": "progress",
                "phase": "processing",
                "n": n,
                "file": name
            }),
            CrawlProgressEvent::OcrPage {
                file,
                engine,
                page,
                total,
            } => serde_json::json!({
                "event": "progress",
                "phase": "ocr",
                "engine": engine,
                "file": file,
                "page": page,
                "total": total
            }),
            CrawlProgressEvent::Uploading { n, total } => serde_json::json!({
                "event": "progress",
                "phase": "uploading",
                "n": n,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl CrawlProgressReporter for NoProgress {
    fn report(&self, _event: CrawlProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Arc<dyn CrawlProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
