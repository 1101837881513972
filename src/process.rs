// ============================================
// process.rs - Running external programs
// ============================================
//
// Every external tool (PowerShell, 7za.exe) goes through a
// `ProcessRunner`. The real one (`SystemProcessRunner`):
//
//   1. Starts the program with NO console window
//   2. Reads stdout and stderr on their own threads WHILE the program
//      runs (otherwise a chatty program fills the pipe and hangs)
//   3. Polls the program until it exits, calling a "heartbeat" closure
//      once per interval so callers can show activity
//
// Elevated requests on Windows go through ShellExecuteExW("runas")
// when we are not already elevated. That path shows the UAC prompt and
// cannot capture output; a declined prompt fails to START, which is
// reported exactly like any other launch failure.
// ============================================

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::InstallError;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

/// How often a running process is checked for exit.
const POLL_SLICE: Duration = Duration::from_millis(25);

/// Default heartbeat interval for callers that don't care.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(1);

// ============================================
// REQUEST / RESULT
// ============================================

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub elevated: bool,
}

impl ProcessRequest {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            elevated: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn elevated(mut self, elevated: bool) -> Self {
        self.elevated = elevated;
        self
    }

    /// Arguments joined into one Windows-style parameter string.
    pub fn parameters(&self) -> String {
        self.args
            .iter()
            .map(|a| quote_arg(a))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Full command line, for logs and error messages.
    pub fn command_line(&self) -> String {
        let program = quote_arg(&self.program.to_string_lossy());
        if self.args.is_empty() {
            program
        } else {
            format!("{} {}", program, self.parameters())
        }
    }
}

/// What came back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Quote an argument the way CommandLineToArgvW expects:
/// wrap in quotes when it has spaces/quotes, escape embedded quotes
/// and the backslashes in front of them.
fn quote_arg(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([' ', '\t', '"']) {
        return arg.to_string();
    }

    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    let mut backslashes = 0;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                quoted.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                quoted.push('"');
                backslashes = 0;
            }
            _ => {
                quoted.extend(std::iter::repeat('\\').take(backslashes));
                quoted.push(c);
                backslashes = 0;
            }
        }
    }
    quoted.extend(std::iter::repeat('\\').take(backslashes * 2));
    quoted.push('"');
    quoted
}

// ============================================
// RUNNER TRAIT
// ============================================

/// Starts external programs and waits for them.
pub trait ProcessRunner: Send + Sync {
    /// Run to completion. `heartbeat` is called once per `interval`
    /// while the process is still running.
    fn run_with_heartbeat(
        &self,
        request: &ProcessRequest,
        interval: Duration,
        heartbeat: &mut dyn FnMut(),
    ) -> Result<ProcessOutput, InstallError>;

    /// Run to completion without progress callbacks.
    fn run(&self, request: &ProcessRequest) -> Result<ProcessOutput, InstallError> {
        self.run_with_heartbeat(request, DEFAULT_HEARTBEAT, &mut || {})
    }
}

// ============================================
// SYSTEM RUNNER
// ============================================

/// Runs real processes on this machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessRunner;

impl ProcessRunner for SystemProcessRunner {
    fn run_with_heartbeat(
        &self,
        request: &ProcessRequest,
        interval: Duration,
        heartbeat: &mut dyn FnMut(),
    ) -> Result<ProcessOutput, InstallError> {
        debug!("Running: {}", request.command_line());

        #[cfg(windows)]
        {
            if request.elevated && !elevation::is_elevated() {
                return elevation::run_elevated(request, interval, heartbeat);
            }
        }

        run_captured(request, interval, heartbeat)
    }
}

/// Start the process directly, capture both streams, poll until exit.
fn run_captured(
    request: &ProcessRequest,
    interval: Duration,
    heartbeat: &mut dyn FnMut(),
) -> Result<ProcessOutput, InstallError> {
    let launch_error = |source| InstallError::ProcessLaunch {
        command_line: request.command_line(),
        source,
    };

    let mut command = Command::new(&request.program);
    command
        .args(&request.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(dir) = &request.working_dir {
        command.current_dir(dir);
    }

    // No console window flashing up behind the installer
    #[cfg(windows)]
    command.creation_flags(winapi::um::winbase::CREATE_NO_WINDOW);

    let mut child = command.spawn().map_err(launch_error)?;

    // Drain both pipes concurrently with the process
    let stdout_reader = child.stdout.take().map(spawn_reader);
    let stderr_reader = child.stderr.take().map(spawn_reader);

    let mut last_beat = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                // Only beat after confirming the process is still alive
                if last_beat.elapsed() >= interval {
                    heartbeat();
                    last_beat = Instant::now();
                }
                thread::sleep(POLL_SLICE.min(interval));
            }
            Err(e) => {
                let _ = child.kill();
                return Err(launch_error(e));
            }
        }
    };

    let stdout = stdout_reader.map(join_reader).unwrap_or_default();
    let stderr = stderr_reader.map(join_reader).unwrap_or_default();

    // A signal-terminated process has no exit code
    let exit_code = status.code().unwrap_or(-1);
    debug!("{} exited with code {}", request.program.display(), exit_code);

    Ok(ProcessOutput {
        exit_code,
        stdout,
        stderr,
    })
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut bytes = Vec::new();
        if let Err(e) = pipe.read_to_end(&mut bytes) {
            warn!("Failed to read process output: {}", e);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    })
}

fn join_reader(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

/// Does `program` look like something we can start? Used for log lines.
pub fn describe_program(program: &Path) -> String {
    if program.components().count() > 1 {
        format!("{} (exists: {})", program.display(), program.exists())
    } else {
        // Bare name: resolved through PATH at launch time
        format!("{} (from PATH)", program.display())
    }
}

// ============================================
// WINDOWS ELEVATION
// ============================================
#[cfg(windows)]
mod elevation {
    use std::ffi::OsStr;
    use std::io;
    use std::mem;
    use std::os::windows::ffi::OsStrExt;
    use std::ptr;
    use std::time::{Duration, Instant};

    use winapi::ctypes::c_void;
    use winapi::shared::winerror::WAIT_TIMEOUT;
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::{GetCurrentProcess, GetExitCodeProcess, OpenProcessToken};
    use winapi::um::securitybaseapi::GetTokenInformation;
    use winapi::um::shellapi::{ShellExecuteExW, SEE_MASK_NOCLOSEPROCESS, SHELLEXECUTEINFOW};
    use winapi::um::synchapi::WaitForSingleObject;
    use winapi::um::winbase::WAIT_OBJECT_0;
    use winapi::um::winnt::{TokenElevation, HANDLE, TOKEN_ELEVATION, TOKEN_QUERY};
    use winapi::um::winuser::SW_HIDE;

    use super::{ProcessOutput, ProcessRequest, POLL_SLICE};
    use crate::error::InstallError;

    fn wide(text: impl AsRef<OsStr>) -> Vec<u16> {
        text.as_ref().encode_wide().chain(std::iter::once(0)).collect()
    }

    /// Is this process running with an elevated token?
    pub fn is_elevated() -> bool {
        unsafe {
            let mut token: HANDLE = ptr::null_mut();
            if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) == 0 {
                return false;
            }

            let mut elevation: TOKEN_ELEVATION = mem::zeroed();
            let mut size = mem::size_of::<TOKEN_ELEVATION>() as u32;
            let ok = GetTokenInformation(
                token,
                TokenElevation,
                &mut elevation as *mut TOKEN_ELEVATION as *mut c_void,
                size,
                &mut size,
            );
            CloseHandle(token);

            ok != 0 && elevation.TokenIsElevated != 0
        }
    }

    /// Launch through the UAC prompt and wait for the exit code.
    pub fn run_elevated(
        request: &ProcessRequest,
        interval: Duration,
        heartbeat: &mut dyn FnMut(),
    ) -> Result<ProcessOutput, InstallError> {
        let verb = wide("runas");
        let file = wide(&request.program);
        let parameters = wide(request.parameters());
        let directory = request.working_dir.as_ref().map(wide);

        unsafe {
            let mut info: SHELLEXECUTEINFOW = mem::zeroed();
            info.cbSize = mem::size_of::<SHELLEXECUTEINFOW>() as u32;
            info.fMask = SEE_MASK_NOCLOSEPROCESS;
            info.lpVerb = verb.as_ptr();
            info.lpFile = file.as_ptr();
            info.lpParameters = parameters.as_ptr();
            info.lpDirectory = directory.as_ref().map_or(ptr::null(), |d| d.as_ptr());
            info.nShow = SW_HIDE;

            // Declined UAC prompt -> ERROR_CANCELLED here
            if ShellExecuteExW(&mut info) == 0 || info.hProcess.is_null() {
                return Err(InstallError::ProcessLaunch {
                    command_line: request.command_line(),
                    source: io::Error::last_os_error(),
                });
            }

            let process = info.hProcess;
            let slice_ms = POLL_SLICE.min(interval).as_millis() as u32;
            let mut last_beat = Instant::now();

            loop {
                match WaitForSingleObject(process, slice_ms) {
                    WAIT_OBJECT_0 => break,
                    WAIT_TIMEOUT => {
                        if last_beat.elapsed() >= interval {
                            heartbeat();
                            last_beat = Instant::now();
                        }
                    }
                    _ => {
                        let source = io::Error::last_os_error();
                        CloseHandle(process);
                        return Err(InstallError::ProcessLaunch {
                            command_line: request.command_line(),
                            source,
                        });
                    }
                }
            }

            let mut code: u32 = 0;
            let got_code = GetExitCodeProcess(process, &mut code);
            CloseHandle(process);

            Ok(ProcessOutput {
                exit_code: if got_code != 0 { code as i32 } else { -1 },
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }
}

// ============================================
// TESTS
// ============================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_quotes_arguments_with_spaces() {
        let request = ProcessRequest::new("7za.exe")
            .arg("x")
            .arg(r"C:\Temp\Setup 1\data.7z")
            .arg(r"-oC:\Program Files\CloudStream")
            .arg("-y");

        assert_eq!(
            request.command_line(),
            r#"7za.exe x "C:\Temp\Setup 1\data.7z" "-oC:\Program Files\CloudStream" -y"#
        );
    }

    #[test]
    fn quoting_escapes_embedded_quotes_and_trailing_backslashes() {
        assert_eq!(quote_arg(r#"say "hi""#), r#""say \"hi\"""#);
        assert_eq!(quote_arg(r"C:\Program Files\"), r#""C:\Program Files\\""#);
        assert_eq!(quote_arg(""), r#""""#);
        assert_eq!(quote_arg("-NoProfile"), "-NoProfile");
    }

    #[test]
    fn missing_program_is_a_launch_failure() {
        let request = ProcessRequest::new("definitely-not-a-real-program-4711").arg("--help");
        let err = SystemProcessRunner.run(&request).unwrap_err();
        match err {
            InstallError::ProcessLaunch { command_line, .. } => {
                assert_eq!(command_line, "definitely-not-a-real-program-4711 --help");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn captures_exit_code_and_both_streams() {
        let request = ProcessRequest::new("sh")
            .arg("-c")
            .arg("echo out; echo err 1>&2; exit 3");
        let output = SystemProcessRunner.run(&request).unwrap();

        assert_eq!(output.exit_code, 3);
        assert!(!output.success());
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[cfg(unix)]
    #[test]
    fn large_output_does_not_deadlock() {
        // ~1 MB on stdout, far beyond a pipe buffer
        let request = ProcessRequest::new("sh")
            .arg("-c")
            .arg("i=0; while [ $i -lt 16384 ]; do echo 0123456789012345678901234567890123456789012345678901234567890123; i=$((i+1)); done");
        let output = SystemProcessRunner.run(&request).unwrap();

        assert!(output.success());
        assert_eq!(output.stdout.lines().count(), 16384);
    }

    #[cfg(unix)]
    #[test]
    fn working_directory_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let request = ProcessRequest::new("sh")
            .arg("-c")
            .arg("pwd")
            .current_dir(dir.path());
        let output = SystemProcessRunner.run(&request).unwrap();

        let reported = PathBuf::from(output.stdout.trim()).canonicalize().unwrap();
        assert_eq!(reported, dir.path().canonicalize().unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn heartbeat_fires_while_process_runs() {
        let request = ProcessRequest::new("sh").arg("-c").arg("sleep 0.5");
        let mut beats = 0;
        let output = SystemProcessRunner
            .run_with_heartbeat(&request, Duration::from_millis(100), &mut || beats += 1)
            .unwrap();

        assert!(output.success());
        assert!(beats >= 2, "only {beats} heartbeats");
    }
}
