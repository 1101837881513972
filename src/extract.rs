// ============================================
// extract.rs - Unpacking the payload with 7-Zip
// ============================================
//
// We run the bundled archiver (7za.exe) like this:
//
//   7za.exe x "<archive>" -o"<install dir>" -y
//
//   x  = extract with full paths
//   -o = output directory (no space after -o!)
//   -y = answer "yes" to every overwrite prompt
//
// 7-Zip gives us no progress signal, so while it runs the pipeline
// shows SYNTHETIC ticks (see `SyntheticTicker`). They are an estimate
// of activity, not a measurement, and stop at a ceiling so the bar
// never runs ahead of the real completion.
// ============================================

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::error::InstallError;
use crate::install_log::InstallLog;
use crate::process::{describe_program, ProcessRequest, ProcessRunner};

/// Marker file that identifies an app package folder in the payload.
const PACKAGE_MANIFEST: &str = "AppxManifest.xml";

/// How many root file names the inventory lists.
const INVENTORY_FILE_LIMIT: usize = 10;

// ============================================
// SYNTHETIC PROGRESS
// ============================================

/// Bounded generator of fake progress values.
///
/// Yields `start`, `start + step`, ... up to and including `ceiling`,
/// then nothing.
#[derive(Debug, Clone)]
pub struct SyntheticTicker {
    next: u8,
    step: u8,
    ceiling: u8,
}

impl SyntheticTicker {
    pub fn new(start: u8, step: u8, ceiling: u8) -> Self {
        Self {
            next: start,
            step: step.max(1),
            ceiling,
        }
    }

    pub fn tick(&mut self) -> Option<u8> {
        if self.next > self.ceiling {
            return None;
        }
        let value = self.next;
        self.next = self.next.saturating_add(self.step);
        Some(value)
    }
}

// ============================================
// EXTRACTOR
// ============================================

/// Runs the external archiver.
pub struct ArchiveExtractor<'a> {
    runner: &'a dyn ProcessRunner,
    archiver: PathBuf,
    poll_interval: Duration,
}

impl<'a> ArchiveExtractor<'a> {
    pub fn new(runner: &'a dyn ProcessRunner, archiver: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            runner,
            archiver: archiver.into(),
            poll_interval,
        }
    }

    /// `7za x <archive> -o<dest> -y`, never elevated.
    pub fn request(&self, archive: &Path, destination: &Path) -> ProcessRequest {
        ProcessRequest::new(&self.archiver)
            .arg("x")
            .arg(archive.to_string_lossy())
            .arg(format!("-o{}", destination.to_string_lossy()))
            .arg("-y")
    }

    /// Extract `archive` into `destination` (created if missing).
    /// `heartbeat` is called once per poll interval while 7-Zip runs.
    pub fn extract(
        &self,
        archive: &Path,
        destination: &Path,
        log: &InstallLog,
        heartbeat: &mut dyn FnMut(),
    ) -> Result<ExtractionInventory, InstallError> {
        if destination.is_dir() {
            log.append(format!("Directory already exists: {}", destination.display()));
        } else {
            fs::create_dir_all(destination).map_err(|e| {
                InstallError::extraction(format!("cannot create {}: {}", destination.display(), e))
            })?;
            log.append(format!("Created directory: {}", destination.display()));
        }

        log.append(format!("Archiver: {}", describe_program(&self.archiver)));
        log.append(format!("Archive: {} (exists: {})", archive.display(), archive.exists()));
        if let Ok(meta) = fs::metadata(archive) {
            log.append(format!("Archive size: {} MB", meta.len() / 1024 / 1024));
        }

        let request = self.request(archive, destination);
        log.append(format!("Archiver command: {}", request.command_line()));

        // Launch failures propagate unchanged (ProcessLaunch)
        let output = self
            .runner
            .run_with_heartbeat(&request, self.poll_interval, heartbeat)?;

        log.append(format!("Archiver exited with code: {}", output.exit_code));

        if !output.success() {
            log.append_block("Archiver stdout", &output.stdout);
            log.append_block("Archiver stderr", &output.stderr);
            return Err(InstallError::extraction(format!(
                "7-Zip exited with code {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        let inventory = ExtractionInventory::scan(destination);
        for line in inventory.describe() {
            log.append(line);
        }
        Ok(inventory)
    }
}

// ============================================
// INVENTORY
// ============================================

/// What ended up in the install directory (top level only).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionInventory {
    /// (directory name, contains an app package manifest)
    pub directories: Vec<(String, bool)>,
    pub root_file_count: usize,
    pub root_files: Vec<String>,
}

impl ExtractionInventory {
    pub fn scan(root: &Path) -> Self {
        let mut inventory = Self::default();

        for entry in walkdir::WalkDir::new(root)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type().is_dir() {
                let has_manifest = entry.path().join(PACKAGE_MANIFEST).is_file();
                inventory.directories.push((name, has_manifest));
            } else {
                inventory.root_file_count += 1;
                if inventory.root_files.len() < INVENTORY_FILE_LIMIT {
                    inventory.root_files.push(name);
                }
            }
        }

        debug!(
            "Inventory of {}: {} dirs, {} files",
            root.display(),
            inventory.directories.len(),
            inventory.root_file_count
        );
        inventory
    }

    /// Log lines describing the inventory.
    pub fn describe(&self) -> Vec<String> {
        let mut lines = vec!["Listing extracted contents:".to_string()];
        for (name, has_manifest) in &self.directories {
            lines.push(format!("  Directory: {}", name));
            if *has_manifest {
                lines.push(format!("    *** Found {} in {} ***", PACKAGE_MANIFEST, name));
            }
        }
        lines.push(format!("Files in root: {}", self.root_file_count));
        for name in &self.root_files {
            lines.push(format!("  File: {}", name));
        }
        lines
    }
}
