// ============================================
// host.rs - Command loop between the UI and the installer
// ============================================
//
// The UI talks to us with one command per line on stdin and listens
// to one event per line on stdout:
//
//   stdin  -> StartInstall | StartOnlineInstall | CheckProcess:<name>
//             | BrowseFolder | CloseApp
//   stdout <- Progress:<n> | InstallLog:<text> | ProcessFound:<name>:<bool>
//             | InstallPath:<dir> | InstallComplete:<bool>
//             | InstallFailed:<message>|<log path>
//
// THREADING:
//   - a reader thread turns stdin lines into HostMessage::Command
//   - the installation runs on a worker thread and sends its events
//     back as HostMessage::Event (through ChannelSink)
//   - THIS thread owns stdout; it is the only writer, so event lines
//     never interleave
//
// Everything arrives on one channel, which keeps the order intact:
// an event sent before RunFinished is always written before the host
// reacts to the end of the run.
// ============================================

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::InstallerConfig;
use crate::error::InstallError;
use crate::events::{Command, EventSink, InstallEvent};
use crate::install_log::InstallLog;
use crate::pipeline::{Components, InstallationPipeline, RunReport};
use crate::staging::StagingArea;

/// Everything the host loop reacts to.
pub enum HostMessage {
    Command(Command),
    Event(InstallEvent),
    RunFinished(Box<RunReport>),
    /// stdin reached EOF
    InputClosed,
}

// ============================================
// EVENT SINK FOR THE WORKER
// ============================================

/// Forwards pipeline events to the host thread.
pub struct ChannelSink {
    tx: Sender<HostMessage>,
}

impl ChannelSink {
    pub fn new(tx: Sender<HostMessage>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: InstallEvent) {
        // Host gone = nobody to tell; the run itself carries on
        let _ = self.tx.send(HostMessage::Event(event));
    }
}

// ============================================
// COMMAND READER
// ============================================

/// Read commands from `input` on a background thread until EOF.
pub fn spawn_command_reader<R>(input: R, tx: Sender<HostMessage>) -> io::Result<JoinHandle<()>>
where
    R: BufRead + Send + 'static,
{
    thread::Builder::new()
        .name("command-reader".to_string())
        .spawn(move || {
            for line in input.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Failed to read command: {}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match Command::parse(&line) {
                    Some(command) => {
                        if tx.send(HostMessage::Command(command)).is_err() {
                            return;
                        }
                    }
                    None => warn!("Unknown command ignored: {}", line.trim()),
                }
            }
            let _ = tx.send(HostMessage::InputClosed);
        })
}

// ============================================
// HOST
// ============================================

/// Picks a folder, starting at the given one. `None` = cancelled.
pub type FolderPicker = fn(&Path) -> Option<PathBuf>;

/// The command loop. Owns the event output.
pub struct Host<W: Write> {
    config: InstallerConfig,
    install_dir: PathBuf,
    out: W,
    tx: Sender<HostMessage>,
    rx: Receiver<HostMessage>,
    /// Fixed collaborators (tests); real ones are built per run otherwise
    components: Option<Components>,
    pick_folder: FolderPicker,
    running: bool,
    input_closed: bool,
    /// Leftovers to delete when the app closes
    staging: Vec<StagingArea>,
    logs: Vec<InstallLog>,
}

impl<W: Write> Host<W> {
    pub fn new(config: InstallerConfig, out: W) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            install_dir: config.install_dir.clone(),
            config,
            out,
            tx,
            rx,
            components: None,
            pick_folder: pick_folder_dialog,
            running: false,
            input_closed: false,
            staging: Vec::new(),
            logs: Vec::new(),
        }
    }

    pub fn with_components(mut self, components: Components) -> Self {
        self.components = Some(components);
        self
    }

    pub fn with_folder_picker(mut self, picker: FolderPicker) -> Self {
        self.pick_folder = picker;
        self
    }

    /// Sender for feeding commands in (the stdin reader gets one).
    pub fn sender(&self) -> Sender<HostMessage> {
        self.tx.clone()
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    /// Process messages until `CloseApp`, or until input is closed and
    /// no run is in flight. Cleans up before returning, also when
    /// writing an event failed.
    pub fn run(&mut self) -> Result<()> {
        let result = self.run_loop();
        self.shutdown();
        result
    }

    fn run_loop(&mut self) -> Result<()> {
        info!("Host ready, install dir: {}", self.install_dir.display());

        // The host keeps a sender itself, so recv() only fails if that
        // invariant is broken
        while let Ok(message) = self.rx.recv() {
            match message {
                HostMessage::Command(Command::CloseApp) => {
                    info!("CloseApp received");
                    break;
                }
                HostMessage::Command(command) => self.handle_command(command)?,
                HostMessage::Event(event) => self.write_event(&event)?,
                HostMessage::RunFinished(report) => {
                    self.finish_run(*report);
                    if self.input_closed {
                        break;
                    }
                }
                HostMessage::InputClosed => {
                    self.input_closed = true;
                    if !self.running {
                        break;
                    }
                    info!("Input closed, waiting for the running installation");
                }
            }
        }
        Ok(())
    }

    fn handle_command(&mut self, command: Command) -> Result<()> {
        debug!("Command: {:?}", command);
        match command {
            Command::StartInstall { online } => self.start_install(online),
            Command::CheckProcess(name) => {
                let running = is_process_running(&name);
                self.write_event(&InstallEvent::ProcessFound { name, running })
            }
            Command::BrowseFolder => self.browse_folder(),
            // Handled by the loop itself
            Command::CloseApp => Ok(()),
        }
    }

    fn start_install(&mut self, online: bool) -> Result<()> {
        if self.running {
            warn!("Installation already running, StartInstall ignored");
            return Ok(());
        }

        let components = match &self.components {
            Some(components) => components.clone(),
            None => match Components::system(&self.config) {
                Ok(components) => components,
                Err(e) => return self.report_start_failure(e),
            },
        };

        info!(
            "Starting {} installation into {}",
            if online { "online" } else { "standard" },
            self.install_dir.display()
        );

        let sink = Arc::new(ChannelSink::new(self.tx.clone()));
        let mut pipeline = InstallationPipeline::new(self.config.clone(), components, sink);

        // Register this run's files now, so CloseApp in the middle of the
        // run still removes them
        self.track_log(InstallLog::open(self.config.log_path()));
        match StagingArea::create(&self.config.temp_root(), &self.config.app_name) {
            Ok(staging) => {
                self.track_staging(staging.clone());
                pipeline = pipeline.with_staging_area(staging);
            }
            // The pipeline tries again and reports the failure itself
            Err(e) => warn!("{}", e),
        }

        let target = self.install_dir.clone();
        let tx = self.tx.clone();

        thread::Builder::new()
            .name("install-worker".to_string())
            .spawn(move || {
                let report = pipeline.run_installation(&target);
                let _ = tx.send(HostMessage::RunFinished(Box::new(report)));
            })
            .context("Failed to start installation thread")?;

        self.running = true;
        Ok(())
    }

    /// The run never started; log why and tell the UI.
    fn report_start_failure(&mut self, err: InstallError) -> Result<()> {
        warn!("Cannot start the installation: {}", err);
        let log = InstallLog::create(self.config.log_path());
        log.append(format!("ERROR in installation: {}", err));
        let event = InstallEvent::InstallFailed {
            message: err.to_string(),
            log_path: log.path().to_path_buf(),
        };
        self.track_log(log);
        self.write_event(&event)
    }

    fn finish_run(&mut self, report: RunReport) {
        self.running = false;
        info!("Installation finished: {:?}", report.final_state);
        if let Some(staging) = report.staging {
            self.track_staging(staging);
        }
        self.track_log(report.log);
    }

    fn track_log(&mut self, log: InstallLog) {
        if !self.logs.iter().any(|known| known.path() == log.path()) {
            self.logs.push(log);
        }
    }

    fn track_staging(&mut self, staging: StagingArea) {
        if !self.staging.iter().any(|known| known.path() == staging.path()) {
            self.staging.push(staging);
        }
    }

    fn browse_folder(&mut self) -> Result<()> {
        let Some(folder) = (self.pick_folder)(&self.install_dir) else {
            debug!("Folder selection cancelled");
            return Ok(());
        };

        if self.running {
            info!("New install dir applies to the next run only");
        }
        self.install_dir = folder;
        let event = InstallEvent::InstallPath(self.install_dir.clone());
        self.write_event(&event)
    }

    fn write_event(&mut self, event: &InstallEvent) -> Result<()> {
        writeln!(self.out, "{}", event.to_wire()).context("Failed to write event")?;
        self.out.flush().context("Failed to flush events")?;
        Ok(())
    }

    /// Delete staging folders and logs. Best effort.
    fn shutdown(&mut self) {
        if self.running {
            warn!("Closing while an installation is running; started processes keep running");
        }
        for staging in self.staging.drain(..) {
            staging.remove();
        }
        for log in self.logs.drain(..) {
            log.remove();
        }
    }
}

// ============================================
// HELPERS
// ============================================

/// Native folder dialog.
pub fn pick_folder_dialog(start: &Path) -> Option<PathBuf> {
    let mut dialog = rfd::FileDialog::new().set_title("Select installation folder");
    if start.is_dir() {
        dialog = dialog.set_directory(start);
    } else if let Some(parent) = start.parent().filter(|p| p.is_dir()) {
        dialog = dialog.set_directory(parent);
    }
    dialog.pick_folder()
}

/// Is a process called `name` running? Case-insensitive, ".exe" optional.
pub fn is_process_running(name: &str) -> bool {
    let wanted = strip_exe(name.trim());
    if wanted.is_empty() {
        return false;
    }

    let mut system = sysinfo::System::new();
    system.refresh_processes();
    system
        .processes()
        .values()
        .any(|process| strip_exe(process.name()).eq_ignore_ascii_case(wanted))
}

fn strip_exe(name: &str) -> &str {
    let len = name.len();
    if len > 4 && name.is_char_boundary(len - 4) && name[len - 4..].eq_ignore_ascii_case(".exe") {
        &name[..len - 4]
    } else {
        name
    }
}

// ============================================
// TESTS
// ============================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::ArchiveSource;
    use crate::probe::VirtualizationProbe;
    use crate::process::{ProcessOutput, ProcessRequest, ProcessRunner};
    use std::fs;
    use std::io::Cursor;
    use std::sync::Mutex;
    use std::time::Duration;

    struct FailingRunner;

    impl ProcessRunner for FailingRunner {
        fn run_with_heartbeat(
            &self,
            _request: &ProcessRequest,
            _interval: Duration,
            _heartbeat: &mut dyn FnMut(),
        ) -> Result<ProcessOutput, InstallError> {
            Ok(ProcessOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "Enable-WindowsOptionalFeature : The requested operation requires elevation."
                    .into(),
            })
        }
    }

    struct NoVirtualization;

    impl VirtualizationProbe for NoVirtualization {
        fn is_virtualization_enabled(&self) -> bool {
            false
        }
    }

    struct NeverCalled;

    impl ArchiveSource for NeverCalled {
        fn fetch(
            &self,
            url: &str,
            _destination: &Path,
            _on_progress: &mut dyn FnMut(u64, Option<u64>),
        ) -> Result<u64, InstallError> {
            Err(InstallError::download(url, "should not be reached"))
        }
    }

    struct OkRunner;

    impl ProcessRunner for OkRunner {
        fn run_with_heartbeat(
            &self,
            _request: &ProcessRequest,
            _interval: Duration,
            _heartbeat: &mut dyn FnMut(),
        ) -> Result<ProcessOutput, InstallError> {
            Ok(ProcessOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    struct Virtualized;

    impl VirtualizationProbe for Virtualized {
        fn is_virtualization_enabled(&self) -> bool {
            true
        }
    }

    /// Reports some progress, then hangs until `release` is dropped.
    struct StalledDownload {
        entered: Mutex<Sender<()>>,
        release: Mutex<Receiver<()>>,
    }

    impl ArchiveSource for StalledDownload {
        fn fetch(
            &self,
            url: &str,
            _destination: &Path,
            on_progress: &mut dyn FnMut(u64, Option<u64>),
        ) -> Result<u64, InstallError> {
            on_progress(1024 * 1024, Some(10 * 1024 * 1024));
            let _ = self.entered.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
            Err(InstallError::download(url, "connection reset"))
        }
    }

    /// Components whose download stalls. Returns them with the "download
    /// started" receiver and the sender that lets the download go.
    fn stalled_components() -> (Components, Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let components = Components {
            runner: Arc::new(OkRunner),
            probe: Arc::new(Virtualized),
            source: Arc::new(StalledDownload {
                entered: Mutex::new(entered_tx),
                release: Mutex::new(release_rx),
            }),
        };
        (components, entered_rx, release_tx)
    }

    /// Event output that breaks once a line containing `marker` is written.
    struct BrokenAfter {
        marker: &'static str,
        written: Vec<u8>,
    }

    impl Write for BrokenAfter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if String::from_utf8_lossy(buf).contains(self.marker) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "UI went away"));
            }
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn test_config(root: &Path) -> InstallerConfig {
        let mut config = InstallerConfig {
            install_dir: root.join("install"),
            temp_root: Some(root.join("tmp")),
            support_dir: Some(root.join("support")),
            ..Default::default()
        };
        config.timing.step_pause_ms = 0;
        config
    }

    fn failing_components() -> Components {
        Components {
            runner: Arc::new(FailingRunner),
            probe: Arc::new(NoVirtualization),
            source: Arc::new(NeverCalled),
        }
    }

    fn output_lines(out: &[u8]) -> Vec<String> {
        String::from_utf8_lossy(out).lines().map(str::to_string).collect()
    }

    #[test]
    fn strip_exe_is_case_insensitive() {
        assert_eq!(strip_exe("CloudStream.EXE"), "CloudStream");
        assert_eq!(strip_exe("powershell.exe"), "powershell");
        assert_eq!(strip_exe("WsaClient"), "WsaClient");
        assert_eq!(strip_exe(".exe"), ".exe");
    }

    #[test]
    fn finds_own_process_by_name() {
        let mut system = sysinfo::System::new();
        system.refresh_processes();
        let pid = sysinfo::get_current_pid().unwrap();
        let own_name = system.process(pid).unwrap().name().to_string();

        assert!(is_process_running(&own_name));
        assert!(is_process_running(&own_name.to_uppercase()));
        assert!(!is_process_running("definitely-not-running-4f1c9a"));
        assert!(!is_process_running("   "));
    }

    #[test]
    fn reader_turns_lines_into_commands() {
        let (tx, rx) = mpsc::channel();
        let input = Cursor::new("CheckProcess:WsaClient\n\nbogus\nStartOnlineInstall\n");
        spawn_command_reader(input, tx).unwrap().join().unwrap();

        let messages: Vec<HostMessage> = rx.try_iter().collect();
        assert_eq!(messages.len(), 3);
        assert!(matches!(
            &messages[0],
            HostMessage::Command(Command::CheckProcess(name)) if name == "WsaClient"
        ));
        assert!(matches!(
            messages[1],
            HostMessage::Command(Command::StartInstall { online: true })
        ));
        assert!(matches!(messages[2], HostMessage::InputClosed));
    }

    #[test]
    fn browse_folder_updates_install_dir() {
        fn picker(_: &Path) -> Option<PathBuf> {
            Some(PathBuf::from("/apps/cloudstream"))
        }
        fn cancel(_: &Path) -> Option<PathBuf> {
            None
        }

        let temp = tempfile::tempdir().unwrap();
        let mut out = Vec::new();
        {
            let mut host = Host::new(test_config(temp.path()), &mut out).with_folder_picker(picker);
            let tx = host.sender();
            tx.send(HostMessage::Command(Command::BrowseFolder)).unwrap();
            tx.send(HostMessage::Command(Command::CloseApp)).unwrap();
            host.run().unwrap();
            assert_eq!(host.install_dir(), Path::new("/apps/cloudstream"));
        }
        assert_eq!(output_lines(&out), vec!["InstallPath:/apps/cloudstream".to_string()]);

        let mut out = Vec::new();
        {
            let mut host = Host::new(test_config(temp.path()), &mut out).with_folder_picker(cancel);
            let tx = host.sender();
            tx.send(HostMessage::Command(Command::BrowseFolder)).unwrap();
            tx.send(HostMessage::Command(Command::CloseApp)).unwrap();
            host.run().unwrap();
        }
        assert!(out.is_empty());
    }

    #[test]
    fn check_process_answers_on_the_event_channel() {
        let temp = tempfile::tempdir().unwrap();
        let mut out = Vec::new();
        {
            let mut host = Host::new(test_config(temp.path()), &mut out);
            let tx = host.sender();
            tx.send(HostMessage::Command(Command::CheckProcess("no-such-proc-77".into())))
                .unwrap();
            tx.send(HostMessage::InputClosed).unwrap();
            host.run().unwrap();
        }
        assert_eq!(output_lines(&out), vec!["ProcessFound:no-such-proc-77:false".to_string()]);
    }

    #[test]
    fn second_start_is_ignored_and_host_waits_for_the_run() {
        let temp = tempfile::tempdir().unwrap();
        let config = test_config(temp.path());
        let log_path = config.log_path();

        let mut out = Vec::new();
        {
            let mut host = Host::new(config, &mut out).with_components(failing_components());
            let tx = host.sender();
            tx.send(HostMessage::Command(Command::StartInstall { online: false })).unwrap();
            tx.send(HostMessage::Command(Command::StartInstall { online: true })).unwrap();
            tx.send(HostMessage::InputClosed).unwrap();
            host.run().unwrap();
        }

        let lines = output_lines(&out);
        let failures: Vec<&String> = lines.iter().filter(|l| l.starts_with("InstallFailed:")).collect();
        assert_eq!(failures.len(), 1, "{lines:?}");
        assert!(failures[0].contains("failed to enable virtualization features"));
        assert!(failures[0].ends_with(&format!("|{}", log_path.display())));
        assert_eq!(lines.first().map(String::as_str), Some("Progress:0"));

        // Session end removes the log and the staging folder
        assert!(!log_path.exists());
        let leftovers: Vec<_> = fs::read_dir(temp.path().join("tmp")).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn close_during_run_removes_log_and_setup_folder() {
        let temp = tempfile::tempdir().unwrap();
        let config = test_config(temp.path());
        let log_path = config.log_path();
        let (components, entered_rx, release_tx) = stalled_components();

        let mut out = Vec::new();
        {
            let mut host = Host::new(config, &mut out).with_components(components);
            let tx = host.sender();
            tx.send(HostMessage::Command(Command::StartInstall { online: false })).unwrap();

            // Close once the download is under way
            let closer = thread::spawn(move || {
                entered_rx.recv_timeout(Duration::from_secs(10)).unwrap();
                tx.send(HostMessage::Command(Command::CloseApp)).unwrap();
            });
            host.run().unwrap();
            closer.join().unwrap();

            assert!(!log_path.exists());
            let leftovers: Vec<_> = fs::read_dir(temp.path().join("tmp")).unwrap().collect();
            assert!(leftovers.is_empty(), "{leftovers:?}");
        }
        drop(release_tx);
    }

    #[test]
    fn broken_event_output_still_cleans_up() {
        let temp = tempfile::tempdir().unwrap();
        let config = test_config(temp.path());
        let log_path = config.log_path();
        let (components, _entered_rx, release_tx) = stalled_components();

        let mut out = BrokenAfter {
            marker: "Progress:13",
            written: Vec::new(),
        };
        {
            let mut host = Host::new(config, &mut out).with_components(components);
            host.sender()
                .send(HostMessage::Command(Command::StartInstall { online: false }))
                .unwrap();

            let err = host.run().unwrap_err();
            assert!(err.to_string().contains("Failed to write event"), "{err:#}");

            assert!(!log_path.exists());
            let leftovers: Vec<_> = fs::read_dir(temp.path().join("tmp")).unwrap().collect();
            assert!(leftovers.is_empty(), "{leftovers:?}");
        }
        assert!(String::from_utf8_lossy(&out.written).contains("Progress:10"));
        drop(release_tx);
    }

    #[test]
    fn failure_to_start_is_written_to_the_log() {
        let temp = tempfile::tempdir().unwrap();
        let config = test_config(temp.path());
        let log_path = config.log_path();

        let mut out = Vec::new();
        {
            let mut host = Host::new(config, &mut out);
            let err = InstallError::download("<client>", "cannot create HTTP client: no TLS backend");
            host.report_start_failure(err).unwrap();

            let log = fs::read_to_string(&log_path).unwrap();
            assert!(log.contains("ERROR in installation:"), "{log}");
            assert!(log.contains("no TLS backend"), "{log}");
        }

        let lines = output_lines(&out);
        assert_eq!(lines.len(), 1, "{lines:?}");
        assert!(lines[0].starts_with("InstallFailed:"));
        assert!(lines[0].ends_with(&format!("|{}", log_path.display())));
    }
}
