//! Traffic audit log: one structured record per dispatched request.
//!
//! Records enter a bounded in-memory queue (overflow drops the oldest
//! entry, never the writer's throughput) and a dedicated thread appends
//! them as JSON lines to a rotating file.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use tracing::{error, info, warn};

/// Whether the gateway handled or refused the request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrafficOutcome {
    Allow,
    Deny,
}

/// A single traffic record, serialised as one JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficLogEntry {
    /// ISO-8601 UTC timestamp.
    pub timestamp: String,
    /// Correlation id, echoed to the client as `X-Request-ID`.
    pub request_id: String,
    /// Authenticated principal; `None` when refusal precedes auth.
    pub username: Option<String>,
    pub environment: String,
    pub namespace: String,
    pub endpoint: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration_ms: f64,
    pub outcome: TrafficOutcome,
    pub deny_reason: Option<String>,
    pub client_ip: String,
}

impl TrafficLogEntry {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            request_id: request_id.into(),
            username: None,
            environment: String::new(),
            namespace: String::new(),
            endpoint: String::new(),
            method: String::new(),
            path: String::new(),
            status: 0,
            duration_ms: 0.0,
            outcome: TrafficOutcome::Allow,
            deny_reason: None,
            client_ip: String::new(),
        }
    }

    pub fn deny(&mut self, reason: impl Into<String>) {
        self.outcome = TrafficOutcome::Deny;
        self.deny_reason = Some(reason.into());
    }

    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

struct QueueInner {
    entries: Mutex<VecDeque<TrafficLogEntry>>,
    available: Condvar,
    capacity: usize,
    shutdown: AtomicBool,
    dropped: AtomicU64,
}

/// Handle for submitting traffic records. Cloneable; the disabled form is
/// a no-op so call sites never branch.
#[derive(Clone)]
pub struct TrafficLog {
    inner: Option<Arc<QueueInner>>,
}

impl TrafficLog {
    /// No-op log for tests and disabled configurations.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Start the queue and its writer thread.
    pub fn start(
        file_path: PathBuf,
        capacity: usize,
        max_file_size_bytes: u64,
        max_rotated_files: usize,
    ) -> io::Result<Self> {
        let writer = TrafficFileWriter::new(file_path, max_file_size_bytes, max_rotated_files)?;
        let inner = Arc::new(QueueInner {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            available: Condvar::new(),
            capacity: capacity.max(1),
            shutdown: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });

        let thread_inner = Arc::clone(&inner);
        std::thread::Builder::new()
            .name("portway-traffic-log".to_string())
            .spawn(move || writer_loop(thread_inner, writer))?;

        Ok(Self { inner: Some(inner) })
    }

    /// Enqueue a record. On overflow the oldest queued record is dropped.
    pub fn record(&self, entry: TrafficLogEntry) {
        let Some(inner) = &self.inner else { return };
        let mut entries = match inner.entries.lock() {
            Ok(entries) => entries,
            Err(_) => return,
        };
        if entries.len() >= inner.capacity {
            entries.pop_front();
            inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
        entries.push_back(entry);
        drop(entries);
        inner.available.notify_one();
    }

    /// Records dropped to overflow since start.
    pub fn dropped(&self) -> u64 {
        self.inner
            .as_ref()
            .map(|i| i.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Stop the writer thread after draining.
    pub fn shutdown(&self) {
        if let Some(inner) = &self.inner {
            inner.shutdown.store(true, Ordering::Relaxed);
            inner.available.notify_all();
        }
    }
}

fn writer_loop(inner: Arc<QueueInner>, writer: TrafficFileWriter) {
    loop {
        let batch: Vec<TrafficLogEntry> = {
            let mut entries = match inner.entries.lock() {
                Ok(entries) => entries,
                Err(_) => return,
            };
            while entries.is_empty() && !inner.shutdown.load(Ordering::Relaxed) {
                entries = match inner.available.wait(entries) {
                    Ok(entries) => entries,
                    Err(_) => return,
                };
            }
            if entries.is_empty() {
                return; // shutdown with an empty queue
            }
            entries.drain(..).collect()
        };

        for entry in &batch {
            if let Err(e) = writer.write_line(&entry.to_json_line()) {
                error!(error = %e, "Failed to write traffic log line");
            }
        }
    }
}

// ── Rotating file writer ─────────────────────────────────────────────────────

struct TrafficFileWriter {
    file_path: PathBuf,
    max_file_size_bytes: u64,
    max_rotated_files: usize,
    state: Mutex<WriterState>,
}

struct WriterState {
    writer: BufWriter<File>,
    current_date: NaiveDate,
    current_size: u64,
}

impl TrafficFileWriter {
    fn new(
        file_path: PathBuf,
        max_file_size_bytes: u64,
        max_rotated_files: usize,
    ) -> io::Result<Self> {
        if let Some(parent) = file_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&file_path)?;
        let current_size = file.metadata()?.len();

        info!(path = %file_path.display(), "Traffic log writer opened");

        Ok(Self {
            file_path,
            max_file_size_bytes,
            max_rotated_files,
            state: Mutex::new(WriterState {
                writer: BufWriter::new(file),
                current_date: Utc::now().date_naive(),
                current_size,
            }),
        })
    }

    fn write_line(&self, line: &str) -> io::Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| io::Error::other("traffic writer lock poisoned"))?;

        let today = Utc::now().date_naive();
        let needs_date_rotate = today != state.current_date;
        let needs_size_rotate =
            self.max_file_size_bytes > 0 && state.current_size >= self.max_file_size_bytes;

        if needs_date_rotate || needs_size_rotate {
            state.writer.flush()?;

            let suffix = if needs_date_rotate {
                state.current_date.format("%Y-%m-%d").to_string()
            } else {
                Utc::now().format("%Y-%m-%d-%H%M%S").to_string()
            };
            let rotated = rotated_path(&self.file_path, &suffix);
            if self.file_path.exists() {
                if let Err(e) = fs::rename(&self.file_path, &rotated) {
                    error!(error = %e, to = %rotated.display(), "Failed to rotate traffic log");
                }
            }
            if self.max_rotated_files > 0 {
                if let Err(e) = prune_rotated(&self.file_path, self.max_rotated_files) {
                    warn!(error = %e, "Failed to prune rotated traffic logs");
                }
            }

            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.file_path)?;
            state.writer = BufWriter::new(file);
            state.current_date = today;
            state.current_size = 0;
        }

        let bytes = line.as_bytes();
        state.writer.write_all(bytes)?;
        state.writer.write_all(b"\n")?;
        state.writer.flush()?;
        state.current_size += bytes.len() as u64 + 1;
        Ok(())
    }
}

fn rotated_path(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "traffic.log".to_string());
    name.push('.');
    name.push_str(suffix);
    base.with_file_name(name)
}

fn prune_rotated(base: &Path, keep: usize) -> io::Result<()> {
    let Some(dir) = base.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    let prefix = format!(
        "{}.",
        base.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
    );

    let mut rotated: Vec<PathBuf> = fs::read_dir(dir)?
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().starts_with(&prefix))
                .unwrap_or(false)
        })
        .collect();
    rotated.sort();

    while rotated.len() > keep {
        let victim = rotated.remove(0);
        if let Err(e) = fs::remove_file(&victim) {
            warn!(path = %victim.display(), error = %e, "Failed to remove rotated traffic log");
        }
    }
    Ok(())
}
