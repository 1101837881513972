// ============================================
// staging.rs - The per-run setup folder
// ============================================
//
// Each run works in its own temp folder:
//
//   %TEMP%\CloudStream_Setup_<uuid>\
//   ├── 7za.exe        <- archiver (from the support bundle)
//   ├── Install.ps1    <- template script (fallback for the payload)
//   ├── CloudLogo.ico  <- copied into the install dir later
//   └── data.7z        <- downloaded payload
//
// Setup files come from a support bundle ZIP when one is configured,
// otherwise they are copied loose from the support folder (next to
// the EXE by default). The folder is removed when the app closes.
// ============================================

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::InstallError;

/// A temp folder owned by one installation run.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

/// What `populate` managed to put in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagingReport {
    pub staged: Vec<String>,
    pub missing: Vec<String>,
}

impl StagingArea {
    /// Create `<parent>/<prefix>_Setup_<uuid>`.
    pub fn create(parent: &Path, prefix: &str) -> Result<Self, InstallError> {
        let root = parent.join(format!("{}_Setup_{}", prefix, uuid::Uuid::new_v4().simple()));
        fs::create_dir_all(&root)
            .map_err(|e| InstallError::staging(format!("cannot create {}: {}", root.display(), e)))?;
        debug!("Staging folder: {}", root.display());
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Path of a file inside the staging folder.
    pub fn file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Fill the folder with the setup files named in `wanted`.
    ///
    /// A bundle that exists but can't be read is an error; files that
    /// are simply absent are reported in `missing` and left to the step
    /// that needs them.
    pub fn populate(
        &self,
        bundle: Option<&Path>,
        support_dir: &Path,
        wanted: &[String],
    ) -> Result<StagingReport, InstallError> {
        match bundle {
            Some(zip_path) if zip_path.is_file() => {
                debug!("Unpacking support bundle {}", zip_path.display());
                unpack_bundle(zip_path, &self.root, wanted).map_err(|e| {
                    InstallError::staging(format!("cannot unpack {}: {}", zip_path.display(), e))
                })
            }
            Some(zip_path) => {
                warn!("Support bundle {} not found, using loose files", zip_path.display());
                self.copy_loose(support_dir, wanted)
            }
            None => self.copy_loose(support_dir, wanted),
        }
    }

    fn copy_loose(&self, support_dir: &Path, wanted: &[String]) -> Result<StagingReport, InstallError> {
        let mut report = StagingReport::default();
        for name in wanted {
            let source = support_dir.join(name);
            if !source.is_file() {
                report.missing.push(name.clone());
                continue;
            }
            fs::copy(&source, self.file(name)).map_err(|e| {
                InstallError::staging(format!("cannot copy {}: {}", source.display(), e))
            })?;
            report.staged.push(name.clone());
        }
        Ok(report)
    }

    /// Best-effort delete.
    pub fn remove(&self) {
        if let Err(e) = fs::remove_dir_all(&self.root) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Could not remove staging folder {}: {}", self.root.display(), e);
            }
        }
    }
}

/// Extract the wanted files from a ZIP, matching on file name only
/// (the bundle may keep them in a sub-folder).
fn unpack_bundle(zip_path: &Path, dest: &Path, wanted: &[String]) -> io::Result<StagingReport> {
    let file = File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(io::Error::other)?;

    let mut report = StagingReport::default();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(io::Error::other)?;
        if entry.is_dir() {
            continue;
        }

        // enclosed_name() rejects "../" tricks
        let Some(file_name) = entry
            .enclosed_name()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
        else {
            continue;
        };

        let Some(name) = wanted.iter().find(|w| w.eq_ignore_ascii_case(&file_name)) else {
            continue;
        };
        if report.staged.contains(name) {
            continue;
        }

        let mut out = File::create(dest.join(name))?;
        io::copy(&mut entry, &mut out)?;
        debug!("Staged {} from bundle", name);
        report.staged.push(name.clone());
    }

    report.missing = wanted
        .iter()
        .filter(|w| !report.staged.contains(w))
        .cloned()
        .collect();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn wanted() -> Vec<String> {
        vec!["7za.exe".into(), "Install.ps1".into(), "CloudLogo.ico".into()]
    }

    fn write_bundle(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for (name, data) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn each_run_gets_its_own_folder() {
        let temp = tempfile::tempdir().unwrap();
        let a = StagingArea::create(temp.path(), "CloudStream").unwrap();
        let b = StagingArea::create(temp.path(), "CloudStream").unwrap();

        assert_ne!(a.path(), b.path());
        assert!(a.path().is_dir());
        let name = a.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("CloudStream_Setup_"));
    }

    #[test]
    fn copies_loose_files_and_reports_missing_ones() {
        let temp = tempfile::tempdir().unwrap();
        let support = temp.path().join("support");
        fs::create_dir_all(&support).unwrap();
        fs::write(support.join("7za.exe"), b"MZ").unwrap();
        fs::write(support.join("Install.ps1"), b"# script").unwrap();

        let staging = StagingArea::create(temp.path(), "CloudStream").unwrap();
        let report = staging.populate(None, &support, &wanted()).unwrap();

        assert_eq!(report.staged, vec!["7za.exe".to_string(), "Install.ps1".to_string()]);
        assert_eq!(report.missing, vec!["CloudLogo.ico".to_string()]);
        assert_eq!(fs::read(staging.file("7za.exe")).unwrap(), b"MZ");
    }

    #[test]
    fn unpacks_wanted_files_from_bundle() {
        let temp = tempfile::tempdir().unwrap();
        let bundle = temp.path().join("support.zip");
        write_bundle(
            &bundle,
            &[
                ("setup/7za.exe", b"MZ"),
                ("setup/install.ps1", b"# script"),
                ("setup/readme.md", b"ignored"),
            ],
        );

        let staging = StagingArea::create(temp.path(), "CloudStream").unwrap();
        let report = staging
            .populate(Some(&bundle), temp.path(), &wanted())
            .unwrap();

        assert_eq!(report.staged, vec!["7za.exe".to_string(), "Install.ps1".to_string()]);
        assert_eq!(report.missing, vec!["CloudLogo.ico".to_string()]);
        assert_eq!(fs::read_to_string(staging.file("Install.ps1")).unwrap(), "# script");
        assert!(!staging.file("readme.md").exists());
    }

    #[test]
    fn corrupt_bundle_is_a_staging_error() {
        let temp = tempfile::tempdir().unwrap();
        let bundle = temp.path().join("support.zip");
        fs::write(&bundle, b"not a zip").unwrap();

        let staging = StagingArea::create(temp.path(), "CloudStream").unwrap();
        let err = staging
            .populate(Some(&bundle), temp.path(), &wanted())
            .unwrap_err();
        assert!(matches!(err, InstallError::Staging { .. }));
    }

    #[test]
    fn remove_deletes_folder() {
        let temp = tempfile::tempdir().unwrap();
        let staging = StagingArea::create(temp.path(), "CloudStream").unwrap();
        fs::write(staging.file("data.7z"), b"x").unwrap();

        staging.remove();
        assert!(!staging.path().exists());
        staging.remove();
    }
}
