//! Local JSONL audit log.
//!
//! A dedicated writer thread drains a bounded channel of serialized
//! records into hourly-rotated files. The hot path never blocks on disk;
//! when the channel is full the line is dropped and counted.

use crossbeam_channel::{Receiver, Sender, bounded};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use tracing::{info, warn};

const CHANNEL_CAPACITY: usize = 200_000;
const BUFFER_BYTES: usize = 128 * 1024;

#[derive(Debug, Default)]
pub struct AuditStats {
    pub written: AtomicU64,
    pub dropped: AtomicU64,
}

/// Cloneable handle for submitting audit lines.
#[derive(Clone)]
pub struct AuditHandle {
    tx: Sender<String>,
    stats: Arc<AuditStats>,
}

impl AuditHandle {
    /// Submit one line; drops instead of blocking when the writer lags.
    pub fn submit(&self, line: String) {
        if self.tx.try_send(line).is_err() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> &AuditStats {
        &self.stats
    }
}

pub struct AuditSink;

impl AuditSink {
    /// Spawn the writer thread. Dropping every `AuditHandle` ends it.
    pub fn spawn(dir: PathBuf) -> (AuditHandle, thread::JoinHandle<()>) {
        let (tx, rx) = bounded::<String>(CHANNEL_CAPACITY);
        let stats = Arc::new(AuditStats::default());
        let writer_stats = stats.clone();

        let handle = thread::Builder::new()
            .name("forgewatch-audit".into())
            .spawn(move || Self::run(dir, rx, writer_stats))
            .expect("failed to spawn audit thread");

        (AuditHandle { tx, stats }, handle)
    }

    fn run(dir: PathBuf, rx: Receiver<String>, stats: Arc<AuditStats>) {
        let mut current_hour = chrono::Utc::now().format("%Y%m%d%H").to_string();
        let mut buffer = match Self::open(&dir, &current_hour) {
            Some(buffer) => buffer,
            None => return,
        };

        info!(dir = %dir.display(), "audit writer active");

        while let Ok(line) = rx.recv() {
            let now_hour = chrono::Utc::now().format("%Y%m%d%H").to_string();
            if now_hour != current_hour {
                let _ = buffer.flush();
                current_hour = now_hour;
                match Self::open(&dir, &current_hour) {
                    Some(rotated) => buffer = rotated,
                    None => return,
                }
            }

            if buffer.write_all(line.as_bytes()).is_ok() && buffer.write_all(b"\n").is_ok() {
                stats.written.fetch_add(1, Ordering::Relaxed);
            }
        }

        let _ = buffer.flush();
        info!("audit writer stopped");
    }

    fn open(dir: &PathBuf, hour: &str) -> Option<std::io::BufWriter<std::fs::File>> {
        let path = dir.join(format!("anomalies_{hour}.jsonl"));
        match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some(std::io::BufWriter::with_capacity(BUFFER_BYTES, file)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot open audit log");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_written_and_counted() {
        let dir = std::env::temp_dir().join(format!("forgewatch-audit-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let (handle, join) = AuditSink::spawn(dir.clone());
        handle.submit(r#"{"event_id":"1"}"#.to_string());
        handle.submit(r#"{"event_id":"2"}"#.to_string());
        drop(handle);
        join.join().unwrap();

        let mut content = String::new();
        for entry in std::fs::read_dir(&dir).unwrap() {
            content.push_str(&std::fs::read_to_string(entry.unwrap().path()).unwrap());
        }
        assert!(content.contains(r#"{"event_id":"1"}"#));
        assert!(content.contains(r#"{"event_id":"2"}"#));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
