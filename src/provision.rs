// ============================================
// provision.rs - Running Install.ps1
// ============================================
//
// After extraction the payload's `data\` folder should contain
// Install.ps1, which registers the app with Windows. If the payload
// lacks it, we copy the template shipped in the staging folder first.
//
// The script runs ELEVATED with its own folder as the working
// directory (it loads sibling files by relative path):
//
//   powershell.exe -NoProfile -ExecutionPolicy Bypass -File ".\Install.ps1"
// ============================================

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::InstallError;
use crate::install_log::InstallLog;
use crate::process::{ProcessRequest, ProcessRunner};

/// Where the script that actually ran came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptOrigin {
    /// Shipped inside the payload archive
    Payload,
    /// Copied from the staging folder's template
    Fallback,
}

/// Locates and runs the provisioning script.
pub struct Provisioner<'a> {
    runner: &'a dyn ProcessRunner,
    powershell: PathBuf,
    script_name: &'a str,
    fallback_dir: &'a Path,
}

impl<'a> Provisioner<'a> {
    pub fn new(
        runner: &'a dyn ProcessRunner,
        powershell: impl Into<PathBuf>,
        script_name: &'a str,
        fallback_dir: &'a Path,
    ) -> Self {
        Self {
            runner,
            powershell: powershell.into(),
            script_name,
            fallback_dir,
        }
    }

    /// Make sure `<script_dir>/<script_name>` exists, copying the
    /// template from the fallback folder when needed.
    pub fn ensure_script(&self, script_dir: &Path, log: &InstallLog) -> Result<(PathBuf, ScriptOrigin), InstallError> {
        let script = script_dir.join(self.script_name);
        log.append(format!("Looking for {} at: {}", self.script_name, script.display()));

        if script.is_file() {
            log.append(format!("{} found in payload", self.script_name));
            return Ok((script, ScriptOrigin::Payload));
        }

        log.append(format!(
            "WARNING: {} not found in payload, copying from setup folder",
            self.script_name
        ));

        let template = self.fallback_dir.join(self.script_name);
        if !template.is_file() {
            log.append(format!("ERROR: {} not found at {} either", self.script_name, template.display()));
            return Err(InstallError::provision(format!("{} not found", self.script_name)));
        }

        if !script_dir.is_dir() {
            fs::create_dir_all(script_dir).map_err(|e| {
                InstallError::provision(format!("cannot create {}: {}", script_dir.display(), e))
            })?;
            log.append(format!("Created data folder: {}", script_dir.display()));
        }

        fs::copy(&template, &script).map_err(|e| {
            InstallError::provision(format!("cannot copy {}: {}", template.display(), e))
        })?;
        log.append(format!("Copied {} to: {}", self.script_name, script.display()));

        Ok((script, ScriptOrigin::Fallback))
    }

    pub fn request(&self, script_dir: &Path) -> ProcessRequest {
        ProcessRequest::new(&self.powershell)
            .args(["-NoProfile", "-ExecutionPolicy", "Bypass", "-File"])
            .arg(format!(r".\{}", self.script_name))
            .current_dir(script_dir)
            .elevated(true)
    }

    /// Ensure the script exists, then run it. Every failure is a
    /// `Provision` error.
    pub fn run_provision_script(&self, script_dir: &Path, log: &InstallLog) -> Result<ScriptOrigin, InstallError> {
        let (_, origin) = self.ensure_script(script_dir, log)?;

        let request = self.request(script_dir);
        log.append(format!("Running PowerShell script: {}", request.command_line()));
        log.append(format!("Working Directory: {}", script_dir.display()));

        let output = self
            .runner
            .run(&request)
            .map_err(|e| InstallError::provision(e))?;

        log.append(format!("PowerShell exit code: {}", output.exit_code));
        log.append_block("PowerShell output", &output.stdout);
        log.append_block("PowerShell errors", &output.stderr);

        if !output.success() {
            return Err(InstallError::provision(format!(
                "script exited with code {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        Ok(origin)
    }
}
