// ============================================
// features.rs - Turn on Hyper-V / Virtual Machine Platform
// ============================================
//
// One elevated PowerShell call enables every configured optional
// feature with -NoRestart. This step is mandatory: a non-zero exit
// code or a launch failure aborts the install.
// ============================================

use std::path::PathBuf;

use crate::error::InstallError;
use crate::install_log::InstallLog;
use crate::process::{ProcessRequest, ProcessRunner};

/// Enables Windows optional features through PowerShell.
pub struct FeatureEnabler<'a> {
    runner: &'a dyn ProcessRunner,
    powershell: PathBuf,
    features: &'a [String],
}

impl<'a> FeatureEnabler<'a> {
    pub fn new(
        runner: &'a dyn ProcessRunner,
        powershell: impl Into<PathBuf>,
        features: &'a [String],
    ) -> Self {
        Self {
            runner,
            powershell: powershell.into(),
            features,
        }
    }

    /// The PowerShell invocation, e.g.
    /// `powershell.exe -NoProfile -ExecutionPolicy Bypass -Command "Enable-WindowsOptionalFeature ...; ..."`
    pub fn request(&self) -> ProcessRequest {
        let script = self
            .features
            .iter()
            .map(|name| {
                format!(
                    "Enable-WindowsOptionalFeature -Online -FeatureName {} -NoRestart",
                    name
                )
            })
            .collect::<Vec<_>>()
            .join("; ");

        ProcessRequest::new(&self.powershell)
            .args(["-NoProfile", "-ExecutionPolicy", "Bypass", "-Command"])
            .arg(script)
            .elevated(true)
    }

    pub fn enable_virtualization_features(&self, log: &InstallLog) -> Result<(), InstallError> {
        if self.features.is_empty() {
            log.append("No Windows features configured, skipping");
            return Ok(());
        }

        let request = self.request();
        log.append(format!("Executing: {}", request.command_line()));

        let output = self.runner.run(&request).map_err(|e| InstallError::FeatureEnable {
            reason: e.to_string(),
        })?;

        log.append(format!("Feature enablement exit code: {}", output.exit_code));
        log.append_block("Feature output", &output.stdout);
        log.append_block("Feature errors", &output.stderr);

        if !output.success() {
            let detail = output.stderr.trim();
            return Err(InstallError::FeatureEnable {
                reason: if detail.is_empty() {
                    format!("PowerShell exited with code {}", output.exit_code)
                } else {
                    format!("PowerShell exited with code {}: {}", output.exit_code, detail)
                },
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessOutput;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Returns a canned result and remembers the request
    struct CannedRunner {
        result: fn(&ProcessRequest) -> Result<ProcessOutput, InstallError>,
        seen: Mutex<Vec<ProcessRequest>>,
    }

    impl ProcessRunner for CannedRunner {
        fn run_with_heartbeat(
            &self,
            request: &ProcessRequest,
            _interval: Duration,
            _heartbeat: &mut dyn FnMut(),
        ) -> Result<ProcessOutput, InstallError> {
            self.seen.lock().unwrap().push(request.clone());
            (self.result)(request)
        }
    }

    fn features() -> Vec<String> {
        vec!["Microsoft-Hyper-V-All".into(), "VirtualMachinePlatform".into()]
    }

    fn scratch_log() -> (tempfile::TempDir, InstallLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = InstallLog::create(dir.path().join("log.txt"));
        (dir, log)
    }

    #[test]
    fn builds_one_elevated_powershell_call() {
        let runner = CannedRunner {
            result: |_| Ok(ProcessOutput::default()),
            seen: Mutex::new(Vec::new()),
        };
        let features = features();
        let (_dir, log) = scratch_log();

        FeatureEnabler::new(&runner, "powershell.exe", &features)
            .enable_virtualization_features(&log)
            .unwrap();

        let seen = runner.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let request = &seen[0];
        assert!(request.elevated);
        assert_eq!(request.args[..4], ["-NoProfile", "-ExecutionPolicy", "Bypass", "-Command"]);
        assert_eq!(
            request.args[4],
            "Enable-WindowsOptionalFeature -Online -FeatureName Microsoft-Hyper-V-All -NoRestart; \
             Enable-WindowsOptionalFeature -Online -FeatureName VirtualMachinePlatform -NoRestart"
        );
    }

    #[test]
    fn non_zero_exit_is_fatal() {
        let runner = CannedRunner {
            result: |_| {
                Ok(ProcessOutput {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: "Access is denied.".into(),
                })
            },
            seen: Mutex::new(Vec::new()),
        };
        let features = features();
        let (_dir, log) = scratch_log();

        let err = FeatureEnabler::new(&runner, "powershell.exe", &features)
            .enable_virtualization_features(&log)
            .unwrap_err();

        assert!(matches!(err, InstallError::FeatureEnable { .. }));
        assert!(err.to_string().contains("Access is denied."));
    }

    #[test]
    fn launch_failure_becomes_feature_failure() {
        let runner = CannedRunner {
            result: |request| {
                Err(InstallError::ProcessLaunch {
                    command_line: request.command_line(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "The operation was canceled by the user.",
                    ),
                })
            },
            seen: Mutex::new(Vec::new()),
        };
        let features = features();
        let (_dir, log) = scratch_log();

        let err = FeatureEnabler::new(&runner, "powershell.exe", &features)
            .enable_virtualization_features(&log)
            .unwrap_err();

        assert!(matches!(err, InstallError::FeatureEnable { .. }));
        assert!(err.is_terminal());
    }
}
