use std::{collections::VecDeque, path::PathBuf};

use tokio::{io::AsyncWriteExt, sync::Mutex, sync::mpsc};

use crate::config;

/// Bounded in-memory capture of the child's output, with monotone sequence
/// numbers so callers can poll for "everything since cursor".
#[derive(Debug)]
pub struct LogBuffer {
    pub next_seq: u64,
    max_lines: usize,
    lines: VecDeque<(u64, String)>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            next_seq: 1,
            max_lines,
            lines: VecDeque::new(),
        }
    }

    pub fn push_line(&mut self, line: String) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back((seq, line));
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    pub fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        // Cursor 0 means "just give me the most recent lines".
        if cursor == 0 {
            let start = self.lines.len().saturating_sub(limit);
            let mut out = Vec::new();
            let mut last = 0;
            for (seq, line) in self.lines.iter().skip(start) {
                out.push(line.clone());
                last = *seq;
            }
            return (out, last);
        }

        let mut out = Vec::new();
        let mut last = cursor;
        for (seq, line) in self.lines.iter() {
            if *seq > cursor {
                out.push(line.clone());
                last = *seq;
                if out.len() >= limit {
                    break;
                }
            }
        }
        (out, last)
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(config::log_max_lines())
    }
}

/// Fan-out point for captured output: in-memory ring plus optional file
/// writers. `emit_err` additionally feeds the error-log file that the
/// remediation engine scans.
#[derive(Clone)]
pub struct LogSink {
    pub buffer: std::sync::Arc<Mutex<LogBuffer>>,
    pub file_tx: Option<mpsc::UnboundedSender<String>>,
    pub error_tx: Option<mpsc::UnboundedSender<String>>,
}

impl LogSink {
    pub async fn emit(&self, line: impl Into<String>) {
        let line = line.into();
        self.buffer.lock().await.push_line(line.clone());
        if let Some(tx) = &self.file_tx {
            let _ = tx.send(line);
        }
    }

    /// Error-stream lines go to the ring, the console file, and the error
    /// log consumed by the remediation engine.
    pub async fn emit_err(&self, line: impl Into<String>) {
        let line = line.into();
        if let Some(tx) = &self.error_tx {
            let _ = tx.send(line.clone());
        }
        self.emit(line).await;
    }
}

/// Size-rotated append-only log file. Rotation shifts `.1` -> `.2` -> ... and
/// moves the live file to `.1`.
pub struct FileLogWriter {
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
    bytes: u64,
    file: tokio::fs::File,
}

impl FileLogWriter {
    pub async fn open(path: PathBuf, max_bytes: u64, max_files: usize) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = tokio::fs::metadata(&path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            max_bytes,
            max_files,
            bytes,
            file,
        })
    }

    async fn rotate(&mut self) -> std::io::Result<()> {
        let _ = self.file.flush().await;

        for i in (1..self.max_files).rev() {
            let from = PathBuf::from(format!("{}.{}", self.path.display(), i));
            let to = PathBuf::from(format!("{}.{}", self.path.display(), i + 1));
            if tokio::fs::metadata(&from).await.is_ok() {
                let _ = tokio::fs::rename(from, to).await;
            }
        }

        let rotated = PathBuf::from(format!("{}.1", self.path.display()));
        if tokio::fs::metadata(&self.path).await.is_ok() {
            let _ = tokio::fs::rename(&self.path, &rotated).await;
        }

        self.file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        self.bytes = 0;
        Ok(())
    }

    pub async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let mut line = line.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }

        let write_len = line.len() as u64;
        if self.max_bytes > 0 && self.bytes.saturating_add(write_len) > self.max_bytes {
            self.rotate().await.ok();
        }

        self.file.write_all(line.as_bytes()).await?;
        self.bytes = self.bytes.saturating_add(write_len);
        Ok(())
    }
}

/// Drain a line channel into a rotating file. The task ends when every sender
/// is dropped.
pub fn spawn_file_writer(
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let Ok(mut writer) = FileLogWriter::open(path, max_bytes, max_files).await else {
            return;
        };
        while let Some(line) = rx.recv().await {
            let _ = writer.write_line(&line).await;
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_evicts_oldest() {
        let mut buf = LogBuffer::new(3);
        for i in 1..=5 {
            buf.push_line(format!("line {i}"));
        }
        let (lines, last) = buf.tail_after(0, 10);
        assert_eq!(lines, vec!["line 3", "line 4", "line 5"]);
        assert_eq!(last, 5);
    }

    #[test]
    fn tail_after_resumes_from_cursor() {
        let mut buf = LogBuffer::new(10);
        for i in 1..=4 {
            buf.push_line(format!("line {i}"));
        }
        let (lines, cursor) = buf.tail_after(2, 10);
        assert_eq!(lines, vec!["line 3", "line 4"]);
        assert_eq!(cursor, 4);

        let (lines, _) = buf.tail_after(cursor, 10);
        assert!(lines.is_empty());
    }

    #[tokio::test]
    async fn file_writer_rotates_at_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.log");
        let mut writer = FileLogWriter::open(path.clone(), 32, 2).await.unwrap();

        for _ in 0..8 {
            writer.write_line("0123456789").await.unwrap();
        }

        assert!(tokio::fs::metadata(&path).await.is_ok());
        let rotated = PathBuf::from(format!("{}.1", path.display()));
        assert!(tokio::fs::metadata(&rotated).await.is_ok());
    }

    #[tokio::test]
    async fn emit_err_feeds_error_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let sink = LogSink {
            buffer: std::sync::Arc::new(Mutex::new(LogBuffer::new(10))),
            file_tx: None,
            error_tx: Some(tx),
        };
        sink.emit_err("ECONNREFUSED 127.0.0.1:5432").await;
        assert_eq!(rx.recv().await.unwrap(), "ECONNREFUSED 127.0.0.1:5432");

        let (lines, _) = sink.buffer.lock().await.tail_after(0, 10);
        assert_eq!(lines.len(), 1);
    }
}
