// ============================================
// shortcut.rs - Desktop shortcut
// ============================================
//
// Install.ps1 creates the launcher in the user's Start Menu:
//   %APPDATA%\Microsoft\Windows\Start Menu\Programs\CloudStream.lnk
// We copy it to the desktop.
//
// The Start Menu entry can appear a moment AFTER the script returns,
// so we look for it a few times (10 x 500 ms by default) before
// giving up. Giving up is NOT fatal for the install.
// ============================================

use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use crate::error::InstallError;
use crate::install_log::InstallLog;

/// Copies the launcher shortcut to the desktop.
#[derive(Debug, Clone)]
pub struct ShortcutPublisher {
    source: PathBuf,
    destination: PathBuf,
    attempts: u32,
    interval: Duration,
}

impl ShortcutPublisher {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            attempts: 10,
            interval: Duration::from_millis(500),
        }
    }

    /// Standard per-user locations for a shortcut called `name`.
    pub fn for_current_user(name: &str) -> Result<Self, InstallError> {
        let app_data = env_dir("APPDATA")?;
        let profile = env_dir("USERPROFILE")?;

        Ok(Self::new(
            app_data
                .join("Microsoft")
                .join("Windows")
                .join("Start Menu")
                .join("Programs")
                .join(name),
            profile.join("Desktop").join(name),
        ))
    }

    pub fn with_retry(mut self, attempts: u32, interval: Duration) -> Self {
        self.attempts = attempts;
        self.interval = interval;
        self
    }

    pub fn source(&self) -> &PathBuf {
        &self.source
    }

    pub fn destination(&self) -> &PathBuf {
        &self.destination
    }

    /// Wait for the Start Menu shortcut and copy it.
    /// Returns `ShortcutPublish` (non-terminal) when it never shows up
    /// or cannot be copied.
    pub fn publish_desktop_shortcut(&self, log: &InstallLog) -> Result<PathBuf, InstallError> {
        log.append(format!("Copying shortcut from: {}", self.source.display()));
        log.append(format!("To: {}", self.destination.display()));

        let mut retries_left = self.attempts;
        while retries_left > 0 && !self.source.exists() {
            log.append(format!(
                "Waiting for Start Menu shortcut... ({} retries left)",
                retries_left
            ));
            thread::sleep(self.interval);
            retries_left -= 1;
        }

        if !self.source.exists() {
            return Err(InstallError::ShortcutPublish {
                reason: format!("Start Menu shortcut not found at {}", self.source.display()),
            });
        }

        if let Some(parent) = self.destination.parent() {
            let _ = fs::create_dir_all(parent);
        }
        fs::copy(&self.source, &self.destination).map_err(|e| InstallError::ShortcutPublish {
            reason: format!("cannot copy to {}: {}", self.destination.display(), e),
        })?;

        log.append("Shortcut copied successfully");
        Ok(self.destination.clone())
    }
}

fn env_dir(var: &str) -> Result<PathBuf, InstallError> {
    std::env::var_os(var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| InstallError::ShortcutPublish {
            reason: format!("%{}% is not set", var),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn copies_existing_shortcut_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("Programs").join("CloudStream.lnk");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::write(&source, b"LNK").unwrap();
        let log = InstallLog::create(dir.path().join("log.txt"));

        let destination = dir.path().join("Desktop").join("CloudStream.lnk");
        let published = ShortcutPublisher::new(&source, &destination)
            .publish_desktop_shortcut(&log)
            .unwrap();

        assert_eq!(published, destination);
        assert_eq!(fs::read(&destination).unwrap(), b"LNK");
    }

    #[test]
    fn absent_source_is_non_terminal_after_all_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let log = InstallLog::create(dir.path().join("log.txt"));

        let started = Instant::now();
        let err = ShortcutPublisher::new(dir.path().join("missing.lnk"), dir.path().join("out.lnk"))
            .with_retry(10, Duration::from_millis(5))
            .publish_desktop_shortcut(&log)
            .unwrap_err();

        assert!(!err.is_terminal());
        assert!(started.elapsed() >= Duration::from_millis(50));

        let text = fs::read_to_string(log.path()).unwrap();
        assert_eq!(text.matches("Waiting for Start Menu shortcut").count(), 10);
        assert!(!dir.path().join("out.lnk").exists());
    }

    #[test]
    fn shortcut_appearing_late_is_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("late.lnk");
        let log = InstallLog::create(dir.path().join("log.txt"));

        let writer = {
            let source = source.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(60));
                fs::write(source, b"LNK").unwrap();
            })
        };

        let result = ShortcutPublisher::new(&source, dir.path().join("out.lnk"))
            .with_retry(50, Duration::from_millis(20))
            .publish_desktop_shortcut(&log);
        writer.join().unwrap();

        assert!(result.is_ok());
    }
}
