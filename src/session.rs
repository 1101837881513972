// ============================================
// session.rs - State of ONE installation run
// ============================================
//
// Everything a run needs is in `InstallSession` and gets passed to each
// step explicitly; there is no global mutable state.
//
// Progress is tracked here so it can be kept MONOTONIC: a step asking
// for a lower percentage than already shown gets the current value,
// and nothing goes above 100.
// ============================================

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::events::EventSink;
use crate::install_log::InstallLog;
use crate::staging::StagingArea;

// ============================================
// PROGRESS
// ============================================

/// Overall 0-100 progress, never decreasing.
pub struct ProgressTracker {
    current: u8,
    sink: Arc<dyn EventSink>,
}

impl ProgressTracker {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { current: 0, sink }
    }

    pub fn current(&self) -> u8 {
        self.current
    }

    /// Report `percent`, clamped to [current, 100], and return the value
    /// actually sent.
    pub fn report(&mut self, percent: u8) -> u8 {
        let value = percent.clamp(self.current, 100);
        self.current = value;
        self.sink.on_progress(value);
        value
    }
}

// ============================================
// SESSION
// ============================================

/// One installation run.
pub struct InstallSession {
    target_directory: PathBuf,
    staging: StagingArea,
    log: InstallLog,
    sink: Arc<dyn EventSink>,
    progress: ProgressTracker,
    /// Set once in the probe step
    virtualization_already_enabled: Option<bool>,
}

impl InstallSession {
    pub fn new(
        target_directory: impl Into<PathBuf>,
        staging: StagingArea,
        log: InstallLog,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            target_directory: target_directory.into(),
            staging,
            log,
            progress: ProgressTracker::new(Arc::clone(&sink)),
            sink,
            virtualization_already_enabled: None,
        }
    }

    pub fn target_directory(&self) -> &Path {
        &self.target_directory
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    pub fn log(&self) -> &InstallLog {
        &self.log
    }

    /// Write to the log file only.
    pub fn log_line(&self, message: impl AsRef<str>) {
        self.log.append(message);
    }

    /// Show a status line in the UI (and keep it in the log file).
    pub fn status(&self, text: &str) {
        self.log.append(format!("UI: {}", text));
        self.sink.on_log(text);
    }

    pub fn progress(&mut self, percent: u8) -> u8 {
        self.progress.report(percent)
    }

    /// Record the probe result. Only the first call has an effect.
    pub fn set_virtualization_enabled(&mut self, enabled: bool) {
        if self.virtualization_already_enabled.is_none() {
            self.virtualization_already_enabled = Some(enabled);
        }
    }

    pub fn virtualization_already_enabled(&self) -> bool {
        self.virtualization_already_enabled.unwrap_or(false)
    }
}
