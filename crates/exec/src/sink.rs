//! Destinations for the line-by-line output of a running process.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn line(&self, stream: Stream, line: &str);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl OutputSink for NullSink {
    async fn line(&self, _stream: Stream, _line: &str) {}
}

/// Keeps every line in memory.
#[derive(Debug, Default)]
pub struct CaptureSink {
    lines: StdMutex<Vec<(Stream, String)>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdout(&self) -> Vec<String> {
        self.collect(Stream::Stdout)
    }

    pub fn stderr(&self) -> Vec<String> {
        self.collect(Stream::Stderr)
    }

    fn collect(&self, which: Stream) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|(s, _)| *s == which)
            .map(|(_, l)| l.clone())
            .collect()
    }
}

#[async_trait]
impl OutputSink for CaptureSink {
    async fn line(&self, stream: Stream, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((stream, line.to_string()));
    }
}

const STDERR_TAIL: usize = 20;

/// Appends stdout to `<name>.log` and stderr to `<name>_error.log`.
///
/// Files are opened in append mode so a re-run after a failed attempt adds
/// to the earlier output instead of truncating it. The last few stderr lines
/// are kept for error messages.
#[derive(Debug)]
pub struct StageLog {
    name: String,
    out_path: PathBuf,
    out: Mutex<File>,
    err: Mutex<File>,
    tail: StdMutex<VecDeque<String>>,
}

impl StageLog {
    pub async fn open(dir: &Path, name: &str) -> std::io::Result<Self> {
        let out_path = dir.join(format!("{name}.log"));
        let err_path = dir.join(format!("{name}_error.log"));
        let out = append(&out_path).await?;
        let err = append(&err_path).await?;
        Ok(Self {
            name: name.to_string(),
            out_path,
            out: Mutex::new(out),
            err: Mutex::new(err),
            tail: StdMutex::new(VecDeque::with_capacity(STDERR_TAIL)),
        })
    }

    pub fn stdout_path(&self) -> &Path {
        &self.out_path
    }

    /// Most recent stderr lines, oldest first, joined by newlines.
    pub fn stderr_tail(&self) -> String {
        let tail = self.tail.lock().unwrap_or_else(|p| p.into_inner());
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    pub async fn flush(&self) {
        if let Err(e) = self.out.lock().await.flush().await {
            tracing::warn!(log = %self.name, error = %e, "failed to flush stage log");
        }
        if let Err(e) = self.err.lock().await.flush().await {
            tracing::warn!(log = %self.name, error = %e, "failed to flush stage error log");
        }
    }
}

async fn append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path).await
}

#[async_trait]
impl OutputSink for StageLog {
    async fn line(&self, stream: Stream, line: &str) {
        let file = match stream {
            Stream::Stdout => &self.out,
            Stream::Stderr => {
                let mut tail = self.tail.lock().unwrap_or_else(|p| p.into_inner());
                if tail.len() == STDERR_TAIL {
                    tail.pop_front();
                }
                tail.push_back(line.to_string());
                &self.err
            }
        };
        let mut f = file.lock().await;
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        if let Err(e) = f.write_all(buf.as_bytes()).await {
            tracing::warn!(log = %self.name, error = %e, "failed to write stage log line");
        }
    }
}
