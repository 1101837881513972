// ============================================
// install_log.rs - The plain-text install log
// ============================================
//
// One line per entry:
//
//   [14:03:27.481] Step 4: Extracting data archive...
//
// The file is opened in APPEND mode for every write and closed again,
// so nothing holds it open between steps and a log viewer can tail it.
// Writing the log never fails an install: errors go to tracing only.
// ============================================

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Append-only install log file.
#[derive(Debug, Clone)]
pub struct InstallLog {
    path: PathBuf,
}

impl InstallLog {
    /// Create (or truncate) the log file at the start of a run.
    pub fn create(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Err(e) = File::create(&path) {
            warn!("Could not create install log {}: {}", path.display(), e);
        }
        Self { path }
    }

    /// Handle to a log file without touching it.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one timestamped line.
    /// Line breaks inside `message` are flattened so one call = one line.
    pub fn append(&self, message: impl AsRef<str>) {
        let message = flatten(message.as_ref());
        debug!(target: "install_log", "{}", message);

        let entry = format!("[{}] {}\n", timestamp(), message);
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(entry.as_bytes()));

        if let Err(e) = result {
            warn!("Could not write install log {}: {}", self.path.display(), e);
        }
    }

    /// Log multi-line output (e.g. a process's stdout), one entry per
    /// non-empty line, each prefixed with `label`.
    pub fn append_block(&self, label: &str, text: &str) {
        for line in text.lines().map(str::trim_end).filter(|l| !l.trim().is_empty()) {
            self.append(format!("{}: {}", label, line));
        }
    }

    /// Best-effort delete at session end.
    pub fn remove(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed install log {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove install log {}: {}", self.path.display(), e),
        }
    }
}

fn is_line_break(c: char) -> bool {
    c == '\r' || c == '\n'
}

/// `HH:mm:ss.fff` in local time.
fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}

fn flatten(message: &str) -> String {
    if message.contains(is_line_break) {
        message
            .split(is_line_break)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" | ")
    } else {
        message.to_string()
    }
}
