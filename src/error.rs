// ============================================
// error.rs - What can go wrong during an install
// ============================================
//
// Every step of the installation reports failure through one enum.
// All variants abort the run EXCEPT ShortcutPublish: a missing desktop
// shortcut does not make an otherwise complete install invalid.
//
// The message text of each variant is what the user sees (together
// with the log file location), so keep them readable.
// ============================================

use std::io;

use thiserror::Error;

/// Failure raised by an installation step.
#[derive(Debug, Error)]
pub enum InstallError {
    /// The external program could not be started at all.
    /// A declined elevation prompt lands here too.
    #[error("failed to start `{command_line}`: {source}")]
    ProcessLaunch {
        command_line: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to enable virtualization features: {reason}")]
    FeatureEnable { reason: String },

    #[error("failed to download {url}: {reason}")]
    Download { url: String, reason: String },

    #[error("failed to extract data archive: {reason}")]
    Extraction { reason: String },

    #[error("failed to run install script: {reason}")]
    Provision { reason: String },

    #[error("desktop shortcut not created: {reason}")]
    ShortcutPublish { reason: String },

    #[error("failed to prepare setup files: {reason}")]
    Staging { reason: String },

    #[error("invalid configuration: {reason}")]
    Config { reason: String },
}

impl InstallError {
    /// Does this failure abort the whole run?
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InstallError::ShortcutPublish { .. })
    }

    pub fn download(url: &str, reason: impl ToString) -> Self {
        InstallError::Download {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn extraction(reason: impl ToString) -> Self {
        InstallError::Extraction {
            reason: reason.to_string(),
        }
    }

    pub fn provision(reason: impl ToString) -> Self {
        InstallError::Provision {
            reason: reason.to_string(),
        }
    }

    pub fn staging(reason: impl ToString) -> Self {
        InstallError::Staging {
            reason: reason.to_string(),
        }
    }
}
