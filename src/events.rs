// ============================================
// events.rs - Messages between the UI and the installer
// ============================================
//
// The UI and the installer talk with plain strings.
//
// UI -> installer (commands):
//   StartInstall | StartOnlineInstall
//   CheckProcess:<name>
//   BrowseFolder
//   CloseApp
//
// installer -> UI (events):
//   Progress:<0-100>
//   InstallLog:<text>
//   ProcessFound:<name>:<true|false>
//   InstallPath:<path>
//   InstallComplete:<virtualization already enabled: true|false>
//   InstallFailed:<message>|<log file path>
//
// The pipeline never knows how these strings reach a screen; it only
// talks to an `EventSink`.
// ============================================

use std::fmt;
use std::path::PathBuf;

// ============================================
// COMMANDS (UI -> installer)
// ============================================

/// A command sent by the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Begin an installation run. `online` is true for `StartOnlineInstall`;
    /// both start the same pipeline.
    StartInstall { online: bool },

    /// Is a process with this name running?
    CheckProcess(String),

    /// Let the user pick the installation folder
    BrowseFolder,

    /// Clean up and exit
    CloseApp,
}

impl Command {
    /// Parse one command string. Unknown strings give `None`.
    pub fn parse(message: &str) -> Option<Self> {
        let message = message.trim();
        match message {
            "StartInstall" => Some(Command::StartInstall { online: false }),
            "StartOnlineInstall" => Some(Command::StartInstall { online: true }),
            "CloseApp" => Some(Command::CloseApp),
            _ => {
                if let Some(name) = message.strip_prefix("CheckProcess:") {
                    Some(Command::CheckProcess(name.to_string()))
                } else if message.starts_with("BrowseFolder") {
                    Some(Command::BrowseFolder)
                } else {
                    None
                }
            }
        }
    }
}

// ============================================
// EVENTS (installer -> UI)
// ============================================

/// A notification for the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallEvent {
    /// Overall progress, 0-100
    Progress(u8),

    /// Human-readable status line
    InstallLog(String),

    /// Answer to `CheckProcess`
    ProcessFound { name: String, running: bool },

    /// The installation folder changed
    InstallPath(PathBuf),

    /// The run reached `Completed`
    InstallComplete { virtualization_enabled: bool },

    /// The run reached `Failed`
    InstallFailed { message: String, log_path: PathBuf },
}

impl InstallEvent {
    /// Message shown when firmware virtualization is off after a
    /// successful install.
    pub const VIRTUALIZATION_ADVISORY: &'static str =
        "Please enable Virtualization from BIOS for a better experience.";

    /// Encode as the string sent over the wire.
    pub fn to_wire(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for InstallEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallEvent::Progress(percent) => write!(f, "Progress:{}", percent),
            InstallEvent::InstallLog(text) => write!(f, "InstallLog:{}", single_line(text)),
            InstallEvent::ProcessFound { name, running } => {
                write!(f, "ProcessFound:{}:{}", name, running)
            }
            InstallEvent::InstallPath(path) => write!(f, "InstallPath:{}", path.display()),
            InstallEvent::InstallComplete {
                virtualization_enabled,
            } => write!(f, "InstallComplete:{}", virtualization_enabled),
            InstallEvent::InstallFailed { message, log_path } => write!(
                f,
                "InstallFailed:{}|{}",
                single_line(message),
                log_path.display()
            ),
        }
    }
}

/// Events are line-delimited on the wire.
fn single_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}

// ============================================
// EVENT SINK
// ============================================

/// Receives everything the pipeline wants the UI to know.
///
/// Implementations must be cheap and must not block: they are called
/// from the installer's worker thread in the middle of a step.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: InstallEvent);

    fn on_progress(&self, percent: u8) {
        self.emit(InstallEvent::Progress(percent));
    }

    fn on_log(&self, text: &str) {
        self.emit(InstallEvent::InstallLog(text.to_string()));
    }
}

/// Collects events in memory. Used by tests.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingSink {
    events: std::sync::Mutex<Vec<InstallEvent>>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn events(&self) -> Vec<InstallEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn progress_values(&self) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                InstallEvent::Progress(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub fn log_lines(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                InstallEvent::InstallLog(text) => Some(text),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
impl EventSink for RecordingSink {
    fn emit(&self, event: InstallEvent) {
        self.events.lock().unwrap().push(event);
    }
}
