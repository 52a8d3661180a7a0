//! Run and per-test log files
//!
//! Every run gets its own timestamped directory below the configured log
//! directory, and `latest` always points at the newest one. Each executed
//! test writes its own log file into that directory.

use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::Result;

const LATEST: &str = "latest";

/// The log directory of one run
#[derive(Debug, Clone)]
pub struct RunLogs {
    root: PathBuf,
    dir: PathBuf,
}

impl RunLogs {
    /// Create a fresh run directory below `root` and repoint `latest` at it
    pub fn create(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;

        let stamp = Local::now().format("%Y-%m-%dT%H-%M-%S").to_string();
        let mut dir = root.join(&stamp);
        let mut suffix = 1;
        while dir.exists() {
            dir = root.join(format!("{}-{}", stamp, suffix));
            suffix += 1;
        }
        std::fs::create_dir(&dir)?;

        update_latest(root, &dir)?;

        Ok(Self {
            root: root.to_path_buf(),
            dir,
        })
    }

    /// Directory holding this run's files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the `latest` pointer
    pub fn latest(&self) -> PathBuf {
        self.root.join(LATEST)
    }

    /// Path of the complete run log
    pub fn run_log(&self) -> PathBuf {
        self.dir.join("run.log")
    }

    /// Path of an artifact belonging to the `index`-th test
    ///
    /// Both `test` and `suffix` are sanitized; the result is always a
    /// direct child of the run directory.
    pub fn artifact(&self, index: usize, test: &str, suffix: &str) -> PathBuf {
        self.dir
            .join(format!("{:03}-{}{}", index, sanitize(test), sanitize(suffix)))
    }

    /// Open the dedicated log stream of the `index`-th test
    pub fn open_test(&self, index: usize, test: &str) -> Result<TestLog> {
        TestLog::create(self.artifact(index, test, ".log"), test)
    }
}

#[cfg(unix)]
fn update_latest(root: &Path, target: &Path) -> Result<()> {
    let tmp = root.join(".latest.tmp");
    let _ = std::fs::remove_file(&tmp);
    // relative, so the log tree can be moved around
    let relative = target.file_name().map(PathBuf::from).unwrap_or_else(|| target.to_path_buf());
    std::os::unix::fs::symlink(relative, &tmp)?;
    std::fs::rename(&tmp, root.join(LATEST))?;
    Ok(())
}

#[cfg(not(unix))]
fn update_latest(root: &Path, target: &Path) -> Result<()> {
    std::fs::write(root.join(LATEST), target.to_string_lossy().as_bytes())?;
    Ok(())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Severity of a test log line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Dedicated, append-only log stream of one test
pub struct TestLog {
    test: String,
    path: PathBuf,
    file: File,
    started: Instant,
}

impl TestLog {
    pub fn create(path: PathBuf, test: &str) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            test: test.to_string(),
            path,
            file,
            started: Instant::now(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&mut self, message: impl AsRef<str>) {
        self.line(LogLevel::Info, message.as_ref());
    }

    pub fn warn(&mut self, message: impl AsRef<str>) {
        self.line(LogLevel::Warn, message.as_ref());
    }

    pub fn error(&mut self, message: impl AsRef<str>) {
        self.line(LogLevel::Error, message.as_ref());
    }

    /// Append one timestamped line and mirror it into the tracing output
    pub fn line(&mut self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Info => info!(test = %self.test, "{}", message),
            LogLevel::Warn => warn!(test = %self.test, "{}", message),
            LogLevel::Error => error!(test = %self.test, "{}", message),
        }

        let line = format!(
            "{}:{}: +{}: {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            level,
            format_elapsed(self.started.elapsed()),
            message
        );
        if let Err(e) = self.file.write_all(line.as_bytes()) {
            warn!("Cannot write to {}: {}", self.path.display(), e);
        }
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!(
        "{}:{:02}:{:02}.{:03}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60,
        elapsed.subsec_millis()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_dirs_are_distinct_and_latest_follows() {
        let root = tempfile::tempdir().unwrap();
        let first = RunLogs::create(root.path()).unwrap();
        let second = RunLogs::create(root.path()).unwrap();

        assert_ne!(first.dir(), second.dir());
        assert!(first.dir().is_dir());
        assert!(second.dir().is_dir());

        #[cfg(unix)]
        {
            let latest = std::fs::canonicalize(second.latest()).unwrap();
            assert_eq!(latest, std::fs::canonicalize(second.dir()).unwrap());
        }
    }

    #[test]
    fn test_test_log_lines() {
        let root = tempfile::tempdir().unwrap();
        let run = RunLogs::create(root.path()).unwrap();
        let mut log = run.open_test(3, "fedora install").unwrap();
        log.info("System booted.");
        log.error("Hub never appeared");

        assert!(log.path().ends_with("003-fedora_install.log"));
        let content = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(":INFO: +0:00:00."));
        assert!(lines[0].ends_with(": System booted."));
        assert!(lines[1].contains(":ERROR: "));
    }

    #[test]
    fn test_artifact_stays_in_run_dir() {
        let root = tempfile::tempdir().unwrap();
        let run = RunLogs::create(root.path()).unwrap();

        let video = run.artifact(1, "install", ".ogv");
        assert_eq!(video, run.dir().join("001-install.ogv"));

        let shot = run.artifact(2, "install", "-../../../etc/hub.png");
        assert_eq!(shot.parent(), Some(run.dir()));
        assert_eq!(shot, run.dir().join("002-install-.._.._.._etc_hub.png"));
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_millis(3_723_045)), "1:02:03.045");
    }
}
