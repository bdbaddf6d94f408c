//! Process logging: env_logger writing to stdout and, when possible, a file.
//!
//! Lines look like `2024-05-01 12:00:00,123 - roi_counter::lifecycle - INFO - message`.
//! `RUST_LOG` still overrides the configured level.

use anyhow::{anyhow, Result};
use env_logger::{Builder, Env, Target};
use log::LevelFilter;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const FALLBACK_LOG_NAME: &str = "roi_counter.log";

/// Where log output ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogDestination {
    Stdout,
    File(PathBuf),
    /// The configured file was not writable; the fallback next to the binary was used.
    Fallback { requested: PathBuf, used: PathBuf },
}

/// Copies every write to stdout and an optional file.
struct TeeWriter {
    file: Option<File>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stdout().write_all(buf)?;
        if let Some(file) = self.file.as_mut() {
            // File write errors are ignored; stdout already has the line.
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()?;
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Open the requested log file, falling back to `./roi_counter.log`.
pub fn open_log_file(requested: Option<&Path>) -> (Option<File>, LogDestination) {
    let Some(requested) = requested else {
        return (None, LogDestination::Stdout);
    };
    if let Ok(file) = open_append(requested) {
        return (Some(file), LogDestination::File(requested.to_path_buf()));
    }
    let name = requested
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(FALLBACK_LOG_NAME));
    let fallback = PathBuf::from(".").join(name);
    match open_append(&fallback) {
        Ok(file) => (
            Some(file),
            LogDestination::Fallback {
                requested: requested.to_path_buf(),
                used: fallback,
            },
        ),
        Err(_) => (None, LogDestination::Stdout),
    }
}

/// Install the global logger. Call once, before the first log line.
pub fn init(level: LevelFilter, log_file: Option<&Path>) -> Result<LogDestination> {
    let (file, destination) = open_log_file(log_file);

    let mut builder = Builder::new();
    builder
        .filter_level(level)
        .parse_env(Env::default())
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S,%3f"),
                record.target(),
                record.level(),
                record.args()
            )
        })
        .target(Target::Pipe(Box::new(TeeWriter { file })));
    builder
        .try_init()
        .map_err(|e| anyhow!("logger already initialized: {}", e))?;

    match &destination {
        LogDestination::Fallback { requested, used } => log::warn!(
            "cannot write to {}; logging to {} instead",
            requested.display(),
            used.display()
        ),
        LogDestination::Stdout if log_file.is_some() => {
            log::warn!("no writable log file; logging to stdout only")
        }
        _ => {}
    }
    Ok(destination)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn opens_requested_file() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("logs").join("counter.log");
        let (file, destination) = open_log_file(Some(&path));
        assert!(file.is_some());
        assert_eq!(destination, LogDestination::File(path.clone()));
        assert!(path.exists());
        Ok(())
    }

    #[test]
    fn no_file_means_stdout() {
        let (file, destination) = open_log_file(None);
        assert!(file.is_none());
        assert_eq!(destination, LogDestination::Stdout);
    }

    #[test]
    fn tee_writer_appends_to_file() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("tee.log");
        let mut tee = TeeWriter {
            file: Some(open_append(&path)?),
        };
        tee.write_all(b"first\n")?;
        tee.write_all(b"second\n")?;
        tee.flush()?;
        assert_eq!(std::fs::read_to_string(&path)?, "first\nsecond\n");
        Ok(())
    }
}
