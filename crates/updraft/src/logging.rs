use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, TermLogger,
    TerminalMode, WriteLogger,
};
use updraft_core::{LOG_CAPACITY, LogEntry, LogSink};

pub const MAX_LOG_SIZE: u64 = 2 * 1024 * 1024;

/// Send `updraft*` records to `log_path`. With `debug` the file also gets
/// Debug records and they are mirrored to stderr.
pub fn init_logging(log_path: &Path, debug: bool) {
    if let Err(error) = truncate_to_tail(log_path, MAX_LOG_SIZE) {
        eprintln!("updraft: failed to trim {}: {error}", log_path.display());
    }

    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .add_filter_allow_str("updraft")
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
    match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(file) => loggers.push(WriteLogger::new(level, config.clone(), file)),
        Err(error) => eprintln!("updraft: cannot open {}: {error}", log_path.display()),
    }
    if debug {
        loggers.push(TermLogger::new(
            LevelFilter::Debug,
            config,
            TerminalMode::Stderr,
            ColorChoice::Auto,
        ));
    }
    if !loggers.is_empty() {
        let _ = CombinedLogger::init(loggers);
    }
}

/// Once `path` passes `max_len`, keep roughly its newest half, cut at a line
/// start.
fn truncate_to_tail(path: &Path, max_len: u64) -> io::Result<()> {
    if !std::fs::metadata(path).is_ok_and(|meta| meta.len() > max_len) {
        return Ok(());
    }
    let contents = std::fs::read(path)?;
    let keep = usize::try_from(max_len / 2).unwrap_or(usize::MAX);
    let tail = &contents[contents.len().saturating_sub(keep)..];
    let start = tail
        .iter()
        .position(|&byte| byte == b'\n')
        .map_or(0, |pos| pos + 1);
    std::fs::write(path, &tail[start..])
}

/// Unit activity as JSON lines in `<dir>/<unit>.jsonl`. Reads return the
/// newest [`LOG_CAPACITY`] entries; the file is compacted once it holds
/// twice that many.
pub struct FileLogSink {
    dir: PathBuf,
    writing: Mutex<()>,
}

impl FileLogSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            writing: Mutex::new(()),
        }
    }

    fn unit_file(&self, unit_id: &str) -> PathBuf {
        self.dir.join(format!("{unit_id}.jsonl"))
    }

    /// Entries for `unit_id`, oldest first. Lines that do not parse are
    /// skipped.
    pub fn entries(&self, unit_id: &str) -> Vec<LogEntry> {
        let Ok(file) = File::open(self.unit_file(unit_id)) else {
            return Vec::new();
        };
        let mut entries = VecDeque::with_capacity(LOG_CAPACITY);
        for line in BufReader::new(file).lines().map_while(Result::ok) {
            let Ok(entry) = serde_json::from_str::<LogEntry>(&line) else {
                continue;
            };
            if entries.len() == LOG_CAPACITY {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
        Vec::from(entries)
    }

    fn append(&self, entry: &LogEntry) -> io::Result<()> {
        let _writing = self.writing.lock().unwrap_or_else(PoisonError::into_inner);
        std::fs::create_dir_all(&self.dir)?;
        let path = self.unit_file(&entry.unit_id);

        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?
            .write_all(&line)?;

        let lines = BufReader::new(File::open(&path)?).lines().count();
        if lines > 2 * LOG_CAPACITY {
            let mut kept = Vec::new();
            for entry in self.entries(&entry.unit_id) {
                serde_json::to_writer(&mut kept, &entry)?;
                kept.push(b'\n');
            }
            std::fs::write(&path, kept)?;
        }
        Ok(())
    }
}

impl LogSink for FileLogSink {
    fn record(&self, entry: LogEntry) {
        if let Err(error) = self.append(&entry) {
            log::warn!(
                "Failed to record activity for {} in {}: {error}",
                entry.unit_id,
                self.dir.display()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use updraft_core::{LOG_CAPACITY, LogLevel, LogSink, SystemClock, UnitLog};

    use super::{FileLogSink, truncate_to_tail};

    fn unit_log(unit_id: &str, sink: &Arc<FileLogSink>) -> UnitLog {
        UnitLog::new(
            unit_id,
            Some(sink.clone() as Arc<dyn LogSink>),
            Arc::new(SystemClock),
        )
    }

    #[test]
    fn entries_survive_a_new_sink() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let sink = Arc::new(FileLogSink::new(temp.path().join("logs")));
        let acme = unit_log("acme", &sink);
        acme.info("Update check", &[("version", "1.1.0".to_string())]);
        acme.error("Update preparation failed", &[]);
        unit_log("beta", &sink).warning("slow server", &[]);

        let reopened = FileLogSink::new(temp.path().join("logs"));
        let entries = reopened.entries("acme");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "Update check");
        assert_eq!(
            entries[0].context.get("version").map(String::as_str),
            Some("1.1.0")
        );
        assert_eq!(entries[1].level, LogLevel::Error);
        assert_eq!(reopened.entries("beta").len(), 1);
        assert!(reopened.entries("gamma").is_empty());
    }

    #[test]
    fn only_the_newest_entries_are_kept() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let sink = Arc::new(FileLogSink::new(temp.path()));
        let log = unit_log("acme", &sink);
        for idx in 0..(2 * LOG_CAPACITY + 5) {
            log.debug(&format!("entry {idx}"), &[]);
        }

        let entries = sink.entries("acme");
        assert_eq!(entries.len(), LOG_CAPACITY);
        assert_eq!(entries[0].message, format!("entry {}", LOG_CAPACITY + 5));
        let on_disk = std::fs::read_to_string(temp.path().join("acme.jsonl"))
            .expect("log file readable")
            .lines()
            .count();
        assert!(on_disk <= 2 * LOG_CAPACITY);
    }

    #[test]
    fn unparsable_lines_are_skipped() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        std::fs::write(temp.path().join("acme.jsonl"), "not json\n").expect("file written");
        let sink = Arc::new(FileLogSink::new(temp.path()));
        unit_log("acme", &sink).info("after", &[]);

        let entries = sink.entries("acme");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "after");
    }

    #[test]
    fn oversized_log_keeps_its_newest_lines() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let log_path = temp.path().join("updraft.log");
        let original = "line-1\nline-2\nline-3\nline-4\nline-5\n";
        std::fs::write(&log_path, original).expect("test log file should be written");

        truncate_to_tail(&log_path, 1024).expect("small log is left alone");
        assert_eq!(
            std::fs::read_to_string(&log_path).expect("log readable"),
            original
        );

        truncate_to_tail(&log_path, 20).expect("log should be trimmed");
        assert_eq!(
            std::fs::read_to_string(&log_path).expect("log readable"),
            "line-5\n"
        );
    }

    #[test]
    fn missing_log_is_not_an_error() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        truncate_to_tail(&temp.path().join("absent.log"), 10).expect("nothing to trim");
    }
}
