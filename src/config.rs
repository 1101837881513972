// ============================================
// config.rs - Installer settings
// ============================================
//
// Every setting has a default that matches the shipped CloudStream
// installer, so the program runs without any config file at all.
//
// To override settings, put an `installer.toml` NEXT TO the EXE
// (or pass --config <path>). Only the keys you write are changed:
//
//   install_dir = 'D:\Apps\CloudStream'
//   download_url = "https://mirror.example.com/data.7z"
//
//   [timing]
//   step_pause_ms = 0
// ============================================

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::InstallError;

/// File name looked up next to the EXE when no --config is given.
pub const CONFIG_FILE_NAME: &str = "installer.toml";

const MIB: u64 = 1024 * 1024;

// ============================================
// CONFIG STRUCTURES
// ============================================

/// All installer settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    /// Product name, used for the temp folder and log messages
    pub app_name: String,

    /// Where the payload gets extracted
    pub install_dir: PathBuf,

    /// Remote location of the payload archive
    pub download_url: String,

    /// File name of the downloaded archive inside the staging folder
    pub archive_name: String,

    /// Archiver EXE shipped in the support bundle
    pub archiver_name: String,

    /// Use this archiver instead of the staged one (e.g. an installed 7-Zip)
    pub archiver_path: Option<PathBuf>,

    /// Provisioning script expected inside `data_subdir`
    pub script_name: String,

    /// Sub-folder of the install dir that holds the provisioned content
    pub data_subdir: String,

    /// PowerShell executable (feature toggles + provisioning script)
    pub powershell: PathBuf,

    /// Optional Windows features to enable (without reboot)
    pub features: Vec<String>,

    /// Name of the launcher shortcut created by the provisioning script
    pub shortcut_name: String,

    /// Override for the Start Menu shortcut location
    pub shortcut_source: Option<PathBuf>,

    /// Override for the desktop shortcut location
    pub shortcut_destination: Option<PathBuf>,

    /// Zip with the setup files (archiver, template script, icon)
    pub support_bundle: Option<PathBuf>,

    /// Folder with loose setup files, used when there is no bundle.
    /// Defaults to the EXE's own directory.
    pub support_dir: Option<PathBuf>,

    /// Files that must end up in the staging folder
    pub staged_files: Vec<String>,

    /// Files copied from staging into the install dir after extraction
    pub install_assets: Vec<String>,

    /// Parent of the per-run staging folder and of the log file.
    /// Defaults to the OS temp directory.
    pub temp_root: Option<PathBuf>,

    /// Install log file name (inside `temp_root`)
    pub log_file_name: String,

    pub timing: TimingConfig,
}

/// Timeouts, intervals and retry counts.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Whole-transfer timeout for the payload download
    pub download_timeout_secs: u64,

    /// Bytes between two download progress reports
    pub progress_report_bytes: u64,

    /// How often the running archiver is checked (drives synthetic ticks)
    pub extract_poll_ms: u64,

    /// How many times to look for the Start Menu shortcut
    pub shortcut_attempts: u32,

    /// Pause between two shortcut lookups
    pub shortcut_interval_ms: u64,

    /// Cosmetic pause between steps so the UI can show each stage
    pub step_pause_ms: u64,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            app_name: "CloudStream".to_string(),
            install_dir: PathBuf::from(r"C:\Program Files\CloudStream"),
            download_url:
                "https://github.com/talhanadeemreal/WSA-Cloudstream/releases/download/data.7z/data.7z"
                    .to_string(),
            archive_name: "data.7z".to_string(),
            archiver_name: "7za.exe".to_string(),
            archiver_path: None,
            script_name: "Install.ps1".to_string(),
            data_subdir: "data".to_string(),
            powershell: PathBuf::from("powershell.exe"),
            features: vec![
                "Microsoft-Hyper-V-All".to_string(),
                "VirtualMachinePlatform".to_string(),
            ],
            shortcut_name: "CloudStream.lnk".to_string(),
            shortcut_source: None,
            shortcut_destination: None,
            support_bundle: None,
            support_dir: None,
            staged_files: vec![
                "7za.exe".to_string(),
                "Install.ps1".to_string(),
                "CloudLogo.ico".to_string(),
            ],
            install_assets: vec!["CloudLogo.ico".to_string()],
            temp_root: None,
            log_file_name: "CloudStream_Install_Log.txt".to_string(),
            timing: TimingConfig::default(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            download_timeout_secs: 30 * 60,
            progress_report_bytes: 5 * MIB,
            extract_poll_ms: 1000,
            shortcut_attempts: 10,
            shortcut_interval_ms: 500,
            step_pause_ms: 500,
        }
    }
}

// ============================================
// LOADING
// ============================================

impl InstallerConfig {
    /// Load settings.
    ///
    /// - `explicit` given: that file MUST exist and parse.
    /// - otherwise: `installer.toml` next to the EXE if present,
    ///   else built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, InstallError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let default_path = get_app_directory().join(CONFIG_FILE_NAME);
        if default_path.exists() {
            Self::from_file(&default_path)
        } else {
            debug!("No {} found, using built-in defaults", CONFIG_FILE_NAME);
            Ok(Self::default())
        }
    }

    /// Parse a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, InstallError> {
        let text = fs::read_to_string(path).map_err(|e| InstallError::Config {
            reason: format!("cannot read {}: {}", path.display(), e),
        })?;
        Self::from_toml(&text).map_err(|e| match e {
            InstallError::Config { reason } => InstallError::Config {
                reason: format!("{}: {}", path.display(), reason),
            },
            other => other,
        })
    }

    /// Parse TOML text (missing keys keep their defaults).
    pub fn from_toml(text: &str) -> Result<Self, InstallError> {
        toml::from_str(text).map_err(|e| InstallError::Config {
            reason: e.to_string(),
        })
    }

    // ---- derived paths ----

    /// Parent folder for staging and the log file.
    pub fn temp_root(&self) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn log_path(&self) -> PathBuf {
        self.temp_root().join(&self.log_file_name)
    }

    /// Where loose setup files are looked up.
    pub fn support_dir(&self) -> PathBuf {
        self.support_dir.clone().unwrap_or_else(get_app_directory)
    }

    // ---- timing helpers ----

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.timing.download_timeout_secs)
    }

    pub fn extract_poll_interval(&self) -> Duration {
        Duration::from_millis(self.timing.extract_poll_ms)
    }

    pub fn shortcut_interval(&self) -> Duration {
        Duration::from_millis(self.timing.shortcut_interval_ms)
    }

    pub fn step_pause(&self) -> Duration {
        Duration::from_millis(self.timing.step_pause_ms)
    }
}

// ============================================
// PATH HELPERS
// ============================================

/// Get the directory where the installer EXE is located.
///
/// Uses std::env::current_exe() so the config file and loose setup
/// files are found NEXT TO the EXE, even when the working directory
/// is somewhere else (e.g. launched from a shortcut).
pub fn get_app_directory() -> PathBuf {
    if let Ok(exe_path) = std::env::current_exe() {
        // Canonicalize to resolve any symlinks/junctions, then get parent
        let resolved = exe_path.canonicalize().unwrap_or(exe_path);
        if let Some(parent) = resolved.parent() {
            // Strip \\?\ prefix that canonicalize adds on Windows
            let parent_str = parent.to_string_lossy();
            if let Some(stripped) = parent_str.strip_prefix(r"\\?\") {
                return PathBuf::from(stripped);
            }
            return parent.to_path_buf();
        }
    }
    warn!("Could not determine EXE directory, using current directory");
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

// ============================================
// TESTS
// ============================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_shipped_installer() {
        let config = InstallerConfig::default();
        assert_eq!(config.archive_name, "data.7z");
        assert_eq!(config.script_name, "Install.ps1");
        assert_eq!(config.features.len(), 2);
        assert_eq!(config.timing.progress_report_bytes, 5 * 1024 * 1024);
        assert_eq!(config.download_timeout(), Duration::from_secs(1800));
        assert_eq!(config.timing.shortcut_attempts, 10);
        assert_eq!(config.shortcut_interval(), Duration::from_millis(500));
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = InstallerConfig::from_toml(
            r#"
            install_dir = 'D:\Apps\CloudStream'

            [timing]
            step_pause_ms = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.install_dir, PathBuf::from(r"D:\Apps\CloudStream"));
        assert_eq!(config.timing.step_pause_ms, 0);
        assert_eq!(config.timing.extract_poll_ms, 1000);
        assert_eq!(config.archiver_name, "7za.exe");
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let err = InstallerConfig::from_toml("features = 12").unwrap_err();
        assert!(matches!(err, InstallError::Config { .. }));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = InstallerConfig::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(err.to_string().contains("nope.toml"));
    }

    #[test]
    fn log_path_lives_under_temp_root() {
        let config = InstallerConfig {
            temp_root: Some(PathBuf::from("/scratch")),
            ..Default::default()
        };
        assert_eq!(
            config.log_path(),
            PathBuf::from("/scratch").join("CloudStream_Install_Log.txt")
        );
    }
}
