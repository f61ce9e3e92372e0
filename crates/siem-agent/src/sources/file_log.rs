//! FileLog source runner (spec §4.3). Byte-offset tailing grounded on the
//! teacher pack's working file-watcher (`groblegark-oddjobs`'s
//! `crates/adapters/src/agent/watcher.rs`): seek to a remembered offset,
//! read full lines, detect truncation-style rotation by comparing the
//! current file length against the remembered offset. Change notification
//! uses `notify` (also grounded there); a periodic tick is kept as a
//! fallback so a missed fs-event never stalls tailing indefinitely.

use crate::config::SourceConfig;
use crate::error::Result;
use crate::event::{clamp_description, extract_ips, extract_timestamp, normalize_severity, Event};
use crate::health::Counters;
use crate::sources::{should_filter, SourceRunnerOps};
use crate::types::EventType;
use async_trait::async_trait;
use chrono::Utc;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use siem_agent_shared::Severity;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct TailedFile {
    path: PathBuf,
    offset: u64,
    /// Device/inode pair, used to detect a rotate-and-recreate (not just
    /// truncate) in addition to the spec's size-based check.
    inode: Option<(u64, u64)>,
}

pub struct FileLogRunner {
    config: SourceConfig,
    files: Vec<TailedFile>,
    watcher: Option<RecommendedWatcher>,
    notify_rx: Option<mpsc::UnboundedReceiver<()>>,
    counters: Arc<Counters>,
}

impl FileLogRunner {
    pub fn new(config: SourceConfig, counters: Arc<Counters>) -> Self {
        Self {
            config,
            files: Vec::new(),
            watcher: None,
            notify_rx: None,
            counters,
        }
    }

    fn path_globs(&self) -> Vec<String> {
        self.config
            .settings
            .get("paths")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default()
    }

    fn resolve_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for pattern in self.path_globs() {
            match glob::glob(&pattern) {
                Ok(entries) => {
                    for entry in entries.flatten() {
                        paths.push(entry);
                    }
                }
                Err(err) => warn!(pattern, error = %err, "invalid FileLog path glob"),
            }
        }
        paths
    }

    /// Watches each tailed file's parent directory so a modify/create
    /// event wakes the run loop immediately instead of waiting for the
    /// fallback tick.
    fn start_watching(&mut self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                let _ = tx.send(());
            }
        }) {
            Ok(watcher) => watcher,
            Err(err) => {
                warn!(error = %err, "failed to start file watcher, falling back to polling only");
                return;
            }
        };

        let mut watched_dirs = std::collections::HashSet::new();
        for file in &self.files {
            if let Some(parent) = file.path.parent() {
                if watched_dirs.insert(parent.to_path_buf()) {
                    if let Err(err) = watcher.watch(parent, RecursiveMode::NonRecursive) {
                        warn!(dir = %parent.display(), error = %err, "failed to watch directory");
                    }
                }
            }
        }

        self.watcher = Some(watcher);
        self.notify_rx = Some(rx);
    }

    /// Reads any new complete lines since the last offset, returning them
    /// along with the updated offset. Rotation: if the file is now shorter
    /// than the remembered offset (truncated/rotated), restart at 0.
    fn read_new_lines(file: &mut TailedFile) -> std::io::Result<Vec<String>> {
        let handle = std::fs::File::open(&file.path)?;
        let metadata = handle.metadata()?;
        let file_len = metadata.len();

        #[cfg(unix)]
        let inode = {
            use std::os::unix::fs::MetadataExt;
            Some((metadata.dev(), metadata.ino()))
        };
        #[cfg(not(unix))]
        let inode: Option<(u64, u64)> = None;

        if file_len < file.offset || (inode.is_some() && inode != file.inode && file.inode.is_some()) {
            file.offset = 0;
        }
        file.inode = inode;

        if file_len == file.offset {
            return Ok(Vec::new());
        }

        let mut reader = BufReader::new(handle);
        reader.seek(SeekFrom::Start(file.offset))?;

        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let bytes_read = reader.read_line(&mut line)?;
            if bytes_read == 0 {
                break;
            }
            if !line.ends_with('\n') {
                // Partial line at EOF: leave it for the next tick, don't
                // advance past it.
                break;
            }
            file.offset += bytes_read as u64;
            let trimmed = line.trim_end_matches(['\n', '\r']);
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }
        Ok(lines)
    }

    /// Scans for the highest-priority severity keyword present in the line
    /// and normalizes it via the shared free-text mapping. Defaults to
    /// `Low` when no keyword is found.
    fn severity_for_line(line: &str) -> Severity {
        let upper = line.to_ascii_uppercase();
        const KEYWORDS: &[&str] = &[
            "EMERGENCY", "EMERG", "CRITICAL", "CRIT", "FATAL", "ALERT", "ERROR", "ERR", "WARNING",
            "WARN", "NOTICE", "INFO", "DEBUG", "TRACE",
        ];
        for keyword in KEYWORDS {
            if upper.contains(keyword) {
                return normalize_severity(keyword);
            }
        }
        Severity::Low
    }

    fn build_event(config: &SourceConfig, path: &PathBuf, line: &str, counters: &Counters) -> Option<Event> {
        let severity = Self::severity_for_line(line);
        let timestamp = extract_timestamp(line).unwrap_or_else(Utc::now);
        let ips = extract_ips(line);
        let mut ips_iter = ips.into_iter();
        let source_ip = ips_iter.next();
        let destination_ip = ips_iter.next();

        let file_name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        let mut event = Event::new(
            hostname(),
            EventType::FileLog,
            severity,
            clamp_description(line),
            line,
            timestamp,
        )
        .with_ips(source_ip, destination_ip);
        event = event.with_custom_field("filePath", path.to_string_lossy().to_string());
        event = event.with_custom_field("fileName", file_name);

        if should_filter(&event, config.severity_filter, &config.include_patterns, &config.exclude_patterns) {
            counters.filtered.increment();
            None
        } else {
            Some(event)
        }
    }

    async fn tail_all(&mut self, output: &mpsc::Sender<Event>) -> bool {
        for file in &mut self.files {
            let lines = match Self::read_new_lines(file) {
                Ok(lines) => lines,
                Err(err) => {
                    debug!(path = %file.path.display(), error = %err, "failed to tail file");
                    continue;
                }
            };
            for line in lines {
                if let Some(event) = Self::build_event(&self.config, &file.path, &line, &self.counters) {
                    if output.send(event).await.is_err() {
                        return false;
                    }
                }
            }
        }
        true
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[async_trait]
impl SourceRunnerOps for FileLogRunner {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn source_type(&self) -> &'static str {
        "FileLog"
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn initialize(&mut self) -> Result<bool> {
        let paths = self.resolve_paths();
        for path in paths {
            let offset = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            self.files.push(TailedFile {
                path,
                offset,
                inode: None,
            });
        }
        self.start_watching();
        Ok(true)
    }

    async fn run(&mut self, output: mpsc::Sender<Event>, cancel: CancellationToken) {
        let interval_sec = self.config.collection_interval_sec.max(1);
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_sec as u64));
        let mut notify_rx = self.notify_rx.take();

        loop {
            let notified = async {
                match notify_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = ticker.tick() => {
                    if !self.tail_all(&output).await {
                        break;
                    }
                }
                _ = notified => {
                    if !self.tail_all(&output).await {
                        break;
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }

        self.notify_rx = notify_rx;
    }

    async fn stop(&mut self) {
        self.watcher = None;
        self.notify_rx = None;
        self.files.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn severity_inferred_from_keyword() {
        assert_eq!(FileLogRunner::severity_for_line("ERROR disk full"), Severity::High);
        assert_eq!(FileLogRunner::severity_for_line("WARN low disk"), Severity::Medium);
        assert_eq!(FileLogRunner::severity_for_line("INFO started"), Severity::Low);
    }

    #[test]
    fn read_new_lines_advances_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "line one\nline two\n").unwrap();

        let mut file = TailedFile {
            path: path.clone(),
            offset: 0,
            inode: None,
        };
        let lines = FileLogRunner::read_new_lines(&mut file).unwrap();
        assert_eq!(lines, vec!["line one".to_string(), "line two".to_string()]);
        assert_eq!(file.offset, 19);

        let mut appended = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(appended, "line three").unwrap();
        let lines = FileLogRunner::read_new_lines(&mut file).unwrap();
        assert_eq!(lines, vec!["line three".to_string()]);
    }

    #[test]
    fn truncation_resets_offset_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "a long line that will be truncated\n").unwrap();
        let mut file = TailedFile {
            path: path.clone(),
            offset: 1000,
            inode: None,
        };
        std::fs::write(&path, "short\n").unwrap();
        let lines = FileLogRunner::read_new_lines(&mut file).unwrap();
        assert_eq!(lines, vec!["short".to_string()]);
    }

    #[test]
    fn partial_trailing_line_is_not_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "complete\nincomplete-no-newline").unwrap();
        let mut file = TailedFile {
            path: path.clone(),
            offset: 0,
            inode: None,
        };
        let lines = FileLogRunner::read_new_lines(&mut file).unwrap();
        assert_eq!(lines, vec!["complete".to_string()]);
        assert_eq!(file.offset, 9);
    }
}
