// ============================================
// pipeline.rs - The installation, step by step
// ============================================
//
// Seven steps, strictly in order, each one owning a slice of the
// 0-100 progress bar:
//
//   1. ProbeVirtualization   0-10   (advisory only, never fails)
//   2. EnableFeatures        0-10   (elevated PowerShell)
//   3. Download             10-40   (data.7z from GitHub)
//   4. Extract              40-70   (7za.exe into the install dir)
//   5. RunProvisionScript   70-85   (Install.ps1, elevated)
//   6. PublishShortcut      85-95   (non-fatal if the .lnk never shows up)
//   7. Finalize             95-100
//
// State machine:
//
//   Idle -> Probing -> EnablingFeatures -> Downloading -> Extracting
//        -> Provisioning -> PublishingShortcut -> Finalizing -> Completed
//
//   Any state before Completed can go to Failed, which is final.
//
// On failure NOTHING is rolled back: files already downloaded or
// extracted and features already enabled stay as they are. The user
// gets the error plus the log file location and relaunches.
// ============================================

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use tracing::{error, info, warn};

use crate::config::InstallerConfig;
use crate::download::{format_size, ArchiveSource, Downloader, TransferRate};
use crate::error::InstallError;
use crate::events::{EventSink, InstallEvent};
use crate::extract::{ArchiveExtractor, SyntheticTicker};
use crate::features::FeatureEnabler;
use crate::install_log::InstallLog;
use crate::probe::{VirtualizationProbe, WmiProbe};
use crate::process::{ProcessRunner, SystemProcessRunner};
use crate::provision::{Provisioner, ScriptOrigin};
use crate::session::InstallSession;
use crate::shortcut::ShortcutPublisher;
use crate::staging::StagingArea;

// ============================================
// STEPS AND STATES
// ============================================

/// The fixed, ordered list of install steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStep {
    ProbeVirtualization,
    EnableFeatures,
    Download,
    Extract,
    RunProvisionScript,
    PublishShortcut,
    Finalize,
}

impl InstallStep {
    pub const ALL: [InstallStep; 7] = [
        InstallStep::ProbeVirtualization,
        InstallStep::EnableFeatures,
        InstallStep::Download,
        InstallStep::Extract,
        InstallStep::RunProvisionScript,
        InstallStep::PublishShortcut,
        InstallStep::Finalize,
    ];

    /// Slice of the progress bar this step owns (inclusive).
    pub fn range(self) -> (u8, u8) {
        match self {
            InstallStep::ProbeVirtualization | InstallStep::EnableFeatures => (0, 10),
            InstallStep::Download => (10, 40),
            InstallStep::Extract => (40, 70),
            InstallStep::RunProvisionScript => (70, 85),
            InstallStep::PublishShortcut => (85, 95),
            InstallStep::Finalize => (95, 100),
        }
    }

    /// Progress reported when the step starts.
    pub fn entry_percent(self) -> u8 {
        match self {
            InstallStep::ProbeVirtualization | InstallStep::EnableFeatures => 5,
            other => other.range().0,
        }
    }

    pub fn state(self) -> PipelineState {
        match self {
            InstallStep::ProbeVirtualization => PipelineState::Probing,
            InstallStep::EnableFeatures => PipelineState::EnablingFeatures,
            InstallStep::Download => PipelineState::Downloading,
            InstallStep::Extract => PipelineState::Extracting,
            InstallStep::RunProvisionScript => PipelineState::Provisioning,
            InstallStep::PublishShortcut => PipelineState::PublishingShortcut,
            InstallStep::Finalize => PipelineState::Finalizing,
        }
    }

    /// 1-based position, used in log lines.
    pub fn number(self) -> usize {
        InstallStep::ALL.iter().position(|s| *s == self).unwrap_or(0) + 1
    }

    pub fn description(self) -> &'static str {
        match self {
            InstallStep::ProbeVirtualization => "Checking virtualization status",
            InstallStep::EnableFeatures => "Enabling Hyper-V features",
            InstallStep::Download => "Downloading data archive",
            InstallStep::Extract => "Extracting data archive",
            InstallStep::RunProvisionScript => "Running installation script",
            InstallStep::PublishShortcut => "Creating desktop shortcut",
            InstallStep::Finalize => "Finalizing installation",
        }
    }
}

/// Where the pipeline is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Probing,
    EnablingFeatures,
    Downloading,
    Extracting,
    Provisioning,
    PublishingShortcut,
    Finalizing,
    Completed,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed)
    }
}

/// Map `done / total` into a step's progress slice.
pub fn scale_into(range: (u8, u8), done: u64, total: Option<u64>) -> u8 {
    let (low, high) = range;
    match total {
        Some(total) if total > 0 => {
            let span = u64::from(high - low);
            low + (span * done.min(total) / total) as u8
        }
        _ => low,
    }
}

// ============================================
// COMPONENTS
// ============================================

/// The collaborators the pipeline drives.
#[derive(Clone)]
pub struct Components {
    pub runner: Arc<dyn ProcessRunner>,
    pub probe: Arc<dyn VirtualizationProbe>,
    pub source: Arc<dyn ArchiveSource>,
}

impl Components {
    /// Real processes, WMI and HTTP.
    pub fn system(config: &InstallerConfig) -> Result<Self, InstallError> {
        let downloader = Downloader::new(config.download_timeout())?
            .with_report_interval(config.timing.progress_report_bytes);

        Ok(Self {
            runner: Arc::new(SystemProcessRunner),
            probe: Arc::new(WmiProbe),
            source: Arc::new(downloader),
        })
    }
}

// ============================================
// RUN REPORT
// ============================================

/// How a run ended.
#[derive(Debug)]
pub struct RunReport {
    pub final_state: PipelineState,
    /// Every state entered, in order (starting with Idle)
    pub states: Vec<PipelineState>,
    pub error: Option<InstallError>,
    pub warnings: Vec<String>,
    pub log: InstallLog,
    /// None when the run failed before the setup folder existed
    pub staging: Option<StagingArea>,
    pub virtualization_enabled: bool,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.final_state == PipelineState::Completed
    }
}

// ============================================
// PIPELINE
// ============================================

/// Runs the seven steps against one target directory.
pub struct InstallationPipeline {
    config: InstallerConfig,
    components: Components,
    sink: Arc<dyn EventSink>,
    /// Setup folder created by the caller, if any
    staging: Option<StagingArea>,
    state: PipelineState,
    states: Vec<PipelineState>,
    warnings: Vec<String>,
}

impl InstallationPipeline {
    pub fn new(config: InstallerConfig, components: Components, sink: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            components,
            sink,
            staging: None,
            state: PipelineState::Idle,
            states: vec![PipelineState::Idle],
            warnings: Vec::new(),
        }
    }

    /// Run the whole installation into `target_dir`.
    ///
    /// Never panics and never returns early with `?`: every outcome,
    /// including a failed setup, ends up in the report and in an
    /// `InstallComplete` / `InstallFailed` event.
    pub fn run_installation(mut self, target_dir: &Path) -> RunReport {
        let log = InstallLog::create(self.config.log_path());
        log.append(format!("=== {} Installation Log ===", self.config.app_name));
        log.append(format!("Started at: {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S")));
        log.append(format!("Install directory: {}", target_dir.display()));
        info!("Installation started, log: {}", log.path().display());

        let staging = match self.prepare_staging(&log) {
            Ok(staging) => staging,
            Err(e) => return self.fail(e, &log, None, false),
        };

        let mut session = InstallSession::new(target_dir, staging, log, Arc::clone(&self.sink));

        // Immediate feedback before the first step
        session.log_line("Sending initial progress (0%)");
        session.progress(0);
        self.pause();
        session.progress(5);

        for step in InstallStep::ALL {
            self.enter(step.state());
            session.log_line(format!("Step {}: {}...", step.number(), step.description()));
            self.pause();

            match self.execute(step, &mut session) {
                Ok(()) => {}
                Err(e) if !e.is_terminal() => {
                    session.log_line(format!("WARNING: {}", e));
                    warn!("{}", e);
                    self.warnings.push(e.to_string());
                }
                Err(e) => {
                    let log = session.log().clone();
                    let staging = session.staging().clone();
                    let virtualization = session.virtualization_already_enabled();
                    return self.fail(e, &log, Some(staging), virtualization);
                }
            }
        }

        self.enter(PipelineState::Completed);
        session.log_line("Installation completed successfully!");

        let virtualization_enabled = session.virtualization_already_enabled();
        if !virtualization_enabled {
            session.status(InstallEvent::VIRTUALIZATION_ADVISORY);
        }
        self.sink.emit(InstallEvent::InstallComplete {
            virtualization_enabled,
        });

        RunReport {
            final_state: self.state,
            states: self.states,
            error: None,
            warnings: self.warnings,
            log: session.log().clone(),
            staging: Some(session.staging().clone()),
            virtualization_enabled,
        }
    }

    /// Use a setup folder that already exists instead of creating one.
    pub fn with_staging_area(mut self, staging: StagingArea) -> Self {
        self.staging = Some(staging);
        self
    }

    fn prepare_staging(&mut self, log: &InstallLog) -> Result<StagingArea, InstallError> {
        let staging = match self.staging.take() {
            Some(staging) => staging,
            None => StagingArea::create(&self.config.temp_root(), &self.config.app_name)?,
        };
        log.append(format!("Setup folder: {}", staging.path().display()));

        let report = staging.populate(
            self.config.support_bundle.as_deref(),
            &self.config.support_dir(),
            &self.config.staged_files,
        )?;
        for name in &report.staged {
            log.append(format!("Staged: {}", name));
        }
        for name in &report.missing {
            log.append(format!("Not available in setup files: {}", name));
        }
        Ok(staging)
    }

    fn enter(&mut self, state: PipelineState) {
        self.state = state;
        self.states.push(state);
    }

    /// Cosmetic pause so each stage is visible in the UI.
    fn pause(&self) {
        let pause = self.config.step_pause();
        if !pause.is_zero() {
            thread::sleep(pause);
        }
    }

    fn fail(
        mut self,
        err: InstallError,
        log: &InstallLog,
        staging: Option<StagingArea>,
        virtualization_enabled: bool,
    ) -> RunReport {
        // Log first: the log file is always a superset of what the user sees
        log.append(format!("ERROR in installation: {}", err));
        error!("Installation failed: {}", err);

        self.enter(PipelineState::Failed);
        self.sink.emit(InstallEvent::InstallFailed {
            message: err.to_string(),
            log_path: log.path().to_path_buf(),
        });

        RunReport {
            final_state: self.state,
            states: self.states,
            error: Some(err),
            warnings: self.warnings,
            log: log.clone(),
            staging,
            virtualization_enabled,
        }
    }

    fn execute(&self, step: InstallStep, session: &mut InstallSession) -> Result<(), InstallError> {
        match step {
            InstallStep::ProbeVirtualization => self.probe_virtualization(session),
            InstallStep::EnableFeatures => self.enable_features(session),
            InstallStep::Download => self.download(session),
            InstallStep::Extract => self.extract(session),
            InstallStep::RunProvisionScript => self.provision(session),
            InstallStep::PublishShortcut => self.publish_shortcut(session),
            InstallStep::Finalize => self.finalize(session),
        }
    }

    // ---- step 1 ----
    fn probe_virtualization(&self, session: &mut InstallSession) -> Result<(), InstallError> {
        session.status("✓ Checking system virtualization...");
        session.progress(InstallStep::ProbeVirtualization.entry_percent());

        let enabled = self.components.probe.is_virtualization_enabled();
        session.set_virtualization_enabled(enabled);
        session.log_line(format!("Virtualization enabled: {}", enabled));
        Ok(())
    }

    // ---- step 2 ----
    fn enable_features(&self, session: &mut InstallSession) -> Result<(), InstallError> {
        session.status("✓ Configuring Windows features...");
        session.progress(InstallStep::EnableFeatures.entry_percent());

        FeatureEnabler::new(
            self.components.runner.as_ref(),
            &self.config.powershell,
            &self.config.features,
        )
        .enable_virtualization_features(session.log())?;

        session.log_line("Hyper-V features enabled successfully");
        session.status("✓ Features configured successfully");
        Ok(())
    }

    // ---- step 3 ----
    fn download(&self, session: &mut InstallSession) -> Result<(), InstallError> {
        let range = InstallStep::Download.range();
        session.status("⬇ Connecting to GitHub...");
        session.progress(InstallStep::Download.entry_percent());

        let url = &self.config.download_url;
        let destination = session.staging().file(&self.config.archive_name);
        session.log_line(format!("Starting download from: {}", url));
        session.status("⬇ Starting download from GitHub...");

        let rate = TransferRate::start();
        let bytes = self
            .components
            .source
            .fetch(url, &destination, &mut |done, total| {
                let percent = session.progress(scale_into(range, done, total));
                let line = rate.status_line(done, total);
                session.log_line(format!("{} ({}%)", line, percent));
                session.status(&format!("⬇ {}", line));
            })?;

        session.log_line(format!("Download complete: {}", format_size(bytes)));
        session.status("⬇ Download complete!");
        session.status("✓ All files downloaded");
        Ok(())
    }

    // ---- step 4 ----
    fn extract(&self, session: &mut InstallSession) -> Result<(), InstallError> {
        let (low, high) = InstallStep::Extract.range();
        session.status("✓ Extracting CloudStream files...");
        session.progress(InstallStep::Extract.entry_percent());

        let archiver = self
            .config
            .archiver_path
            .clone()
            .unwrap_or_else(|| session.staging().file(&self.config.archiver_name));
        let archive = session.staging().file(&self.config.archive_name);
        let target = session.target_directory().to_path_buf();
        let log = session.log().clone();

        // Approximate activity only: 7-Zip reports no progress
        let mut ticker = SyntheticTicker::new(low, 10, high - 10);
        let extractor = ArchiveExtractor::new(
            self.components.runner.as_ref(),
            archiver,
            self.config.extract_poll_interval(),
        );
        extractor.extract(&archive, &target, &log, &mut || {
            if let Some(percent) = ticker.tick() {
                session.log_line(format!("Extraction in progress (~{}%, estimated)...", percent));
                session.progress(percent);
            }
        })?;

        self.copy_install_assets(session)?;

        session.log_line("Data archive extracted successfully");
        session.status("✓ Extraction complete");
        Ok(())
    }

    fn copy_install_assets(&self, session: &InstallSession) -> Result<(), InstallError> {
        for name in &self.config.install_assets {
            let source = session.staging().file(name);
            if !source.is_file() {
                session.log_line(format!("WARNING: {} not in setup files, skipping", name));
                continue;
            }
            let destination = session.target_directory().join(name);
            std::fs::copy(&source, &destination).map_err(|e| {
                InstallError::extraction(format!("cannot copy {}: {}", name, e))
            })?;
            session.log_line(format!("Copied {} to: {}", name, destination.display()));
        }
        Ok(())
    }

    // ---- step 5 ----
    fn provision(&self, session: &mut InstallSession) -> Result<(), InstallError> {
        session.status("✓ Registering Windows Subsystem for Android...");
        session.progress(InstallStep::RunProvisionScript.entry_percent());

        let script_dir = session.target_directory().join(&self.config.data_subdir);
        let origin = Provisioner::new(
            self.components.runner.as_ref(),
            &self.config.powershell,
            &self.config.script_name,
            session.staging().path(),
        )
        .run_provision_script(&script_dir, session.log())?;

        if origin == ScriptOrigin::Fallback {
            session.log_line("Installation script came from setup files (payload had none)");
        }
        session.log_line("Installation script completed successfully");
        session.status("✓ WSA registered successfully");
        Ok(())
    }

    // ---- step 6 ----
    fn publish_shortcut(&self, session: &mut InstallSession) -> Result<(), InstallError> {
        session.status("✓ Creating desktop shortcut...");
        session.progress(InstallStep::PublishShortcut.entry_percent());

        let publisher = match (&self.config.shortcut_source, &self.config.shortcut_destination) {
            (Some(source), Some(destination)) => ShortcutPublisher::new(source, destination),
            (source, destination) => {
                let defaults = ShortcutPublisher::for_current_user(&self.config.shortcut_name)?;
                ShortcutPublisher::new(
                    source.clone().unwrap_or_else(|| defaults.source().clone()),
                    destination.clone().unwrap_or_else(|| defaults.destination().clone()),
                )
            }
        }
        .with_retry(self.config.timing.shortcut_attempts, self.config.shortcut_interval());

        match publisher.publish_desktop_shortcut(session.log()) {
            Ok(_) => {
                session.status("✓ Shortcut created");
                Ok(())
            }
            Err(e) => {
                session.status("⚠ Desktop shortcut could not be created");
                Err(e)
            }
        }
    }

    // ---- step 7 ----
    fn finalize(&self, session: &mut InstallSession) -> Result<(), InstallError> {
        session.progress(InstallStep::Finalize.entry_percent());
        self.pause();
        session.progress(InstallStep::Finalize.range().1);
        Ok(())
    }
}
