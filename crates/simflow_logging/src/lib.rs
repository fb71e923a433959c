//! Logging setup for the simflow binary.
//!
//! Three sinks:
//! - `<logs>/info.log`: everything at the configured level, size-rotated
//!   (`info.log.1`, `info.log.2`)
//! - `<logs>/error.log`: WARN and above, append-only, the operator's worklist
//! - stderr: WARN unless verbose

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "simflow=info,simflow_db=info";
const MAX_LOG_FILES: usize = 3;
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Logging configuration for the loader binary.
pub struct LogConfig<'a> {
    /// Directory receiving `info.log` and `error.log`.
    pub log_dir: &'a Path,
    pub verbose: bool,
}

/// Initialize tracing with the rotating info log, the error log and stderr.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    fs::create_dir_all(config.log_dir).with_context(|| {
        format!("Failed to create logs directory: {}", config.log_dir.display())
    })?;

    let info_writer = SharedWriter::rolling(config.log_dir, "info", MAX_LOG_FILES, MAX_LOG_FILE_SIZE)
        .context("Failed to initialize rolling log writer")?;
    let error_writer = SharedWriter::append(&config.log_dir.join("error.log"))
        .context("Failed to open error log")?;

    let file_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if config.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(info_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(error_writer)
                .with_ansi(false)
                .with_filter(LevelFilter::WARN),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

struct RollingFileAppender {
    dir: PathBuf,
    base_name: String,
    max_files: usize,
    max_size: u64,
    file: Option<File>,
    current_size: u64,
}

impl RollingFileAppender {
    fn new(dir: &Path, base_name: &str, max_files: usize, max_size: u64) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let mut appender = Self {
            dir: dir.to_path_buf(),
            base_name: sanitize_name(base_name),
            max_files: max_files.max(1),
            max_size,
            file: None,
            current_size: 0,
        };
        let (file, size) = appender.open_current_file()?;
        appender.file = Some(file);
        appender.current_size = size;
        if appender.current_size > appender.max_size {
            appender.rotate()?;
        }
        Ok(appender)
    }

    fn open_current_file(&self) -> io::Result<(File, u64)> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.current_path())?;
        let size = file.metadata()?.len();
        Ok((file, size))
    }

    fn current_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.base_name))
    }

    fn rotated_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}.log.{}", self.base_name, index))
    }

    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }

        let max_index = self.max_files.saturating_sub(1);
        if max_index > 0 {
            let oldest = self.rotated_path(max_index);
            if oldest.exists() {
                fs::remove_file(&oldest)?;
            }
            for idx in (1..max_index).rev() {
                let src = self.rotated_path(idx);
                if src.exists() {
                    fs::rename(&src, self.rotated_path(idx + 1))?;
                }
            }
            let current = self.current_path();
            if current.exists() {
                fs::rename(current, self.rotated_path(1))?;
            }
        } else {
            // Single-file budget: truncate in place
            OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(self.current_path())?;
        }

        let (file, size) = self.open_current_file()?;
        self.file = Some(file);
        self.current_size = size;
        Ok(())
    }
}

impl Write for RollingFileAppender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.current_size + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "log file unavailable"))?;
        let bytes = file.write(buf)?;
        self.current_size += bytes as u64;
        Ok(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

/// Thread-safe `MakeWriter` over either a rotating appender or a plain file.
#[derive(Clone)]
struct SharedWriter {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl SharedWriter {
    fn rolling(dir: &Path, base_name: &str, max_files: usize, max_size: u64) -> Result<Self> {
        let appender = RollingFileAppender::new(dir, base_name, max_files, max_size)
            .with_context(|| format!("Failed to open log file for {}", base_name))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(Box::new(appender))),
        })
    }

    fn append(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(Box::new(file))),
        })
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        guard.flush()
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn rotation_keeps_bounded_number_of_files() {
        let tmp = TempDir::new().unwrap();
        let mut appender = RollingFileAppender::new(tmp.path(), "info", 3, 16).unwrap();

        for _ in 0..10 {
            appender.write_all(b"0123456789\n").unwrap();
        }
        appender.flush().unwrap();

        assert!(tmp.path().join("info.log").exists());
        assert!(tmp.path().join("info.log.1").exists());
        assert!(tmp.path().join("info.log.2").exists());
        assert!(!tmp.path().join("info.log.3").exists());
    }

    #[test]
    fn reopening_appends_to_existing_log() {
        let tmp = TempDir::new().unwrap();
        {
            let mut appender = RollingFileAppender::new(tmp.path(), "info", 3, 1024).unwrap();
            appender.write_all(b"first\n").unwrap();
        }
        {
            let mut appender = RollingFileAppender::new(tmp.path(), "info", 3, 1024).unwrap();
            appender.write_all(b"second\n").unwrap();
        }

        let content = fs::read_to_string(tmp.path().join("info.log")).unwrap();
        assert_eq!(content, "first\nsecond\n");
    }

    #[test]
    fn sanitize_name_replaces_separators() {
        assert_eq!(sanitize_name("sim/flow run"), "sim_flow_run");
    }
}
