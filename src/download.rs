// ============================================
// download.rs - Streaming the payload archive
// ============================================
//
// The payload is several hundred MB, so:
//   - the response headers come first (Content-Length tells us the size)
//   - the body is copied to disk in 8 KiB chunks
//   - progress is reported once per 5 MiB (and at the very end), never
//     more often, so the UI isn't flooded with messages
//   - ONE timeout (30 min by default) covers the whole transfer
//
// There is no automatic retry. Re-downloading hundreds of MB on a
// flaky connection is left to the user (relaunch the installer).
// ============================================

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::InstallError;

/// Size of one read/write chunk.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Default distance between two progress reports.
pub const DEFAULT_REPORT_BYTES: u64 = 5 * 1024 * 1024;

// ============================================
// SOURCE TRAIT
// ============================================

/// Anything that can put the payload archive on disk.
///
/// `on_progress(bytes_done, total_bytes)` is called at most once per
/// report interval, plus once when the transfer completes.
pub trait ArchiveSource: Send + Sync {
    /// Returns the number of bytes written.
    fn fetch(
        &self,
        url: &str,
        destination: &Path,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<u64, InstallError>;
}

// ============================================
// PROGRESS THROTTLE
// ============================================

/// Decides when a byte count is worth reporting.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    every: u64,
    last_reported: u64,
}

impl ProgressThrottle {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            last_reported: 0,
        }
    }

    /// Report after at least `every` new bytes, or when `done` reaches
    /// the known total.
    pub fn should_report(&mut self, done: u64, total: Option<u64>) -> bool {
        let reached_end = total == Some(done) && done != self.last_reported;
        if done - self.last_reported >= self.every || reached_end {
            self.last_reported = done;
            true
        } else {
            false
        }
    }

    /// Final report for a body without Content-Length.
    pub fn needs_final_report(&self, done: u64) -> bool {
        done != self.last_reported
    }
}

// ============================================
// HTTP DOWNLOADER
// ============================================

/// Downloads over HTTP(S) with reqwest's blocking client.
pub struct Downloader {
    client: reqwest::blocking::Client,
    /// Deadline for the WHOLE transfer, not per read
    timeout: Duration,
    report_every: u64,
}

impl Downloader {
    pub fn new(timeout: Duration) -> Result<Self, InstallError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("CloudStreamInstaller/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(10)) // GitHub release assets redirect
            .timeout(timeout)
            .build()
            .map_err(|e| InstallError::download("<client>", format!("cannot create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            timeout,
            report_every: DEFAULT_REPORT_BYTES,
        })
    }

    /// Change the report interval (bytes).
    pub fn with_report_interval(mut self, bytes: u64) -> Self {
        self.report_every = bytes;
        self
    }
}

impl ArchiveSource for Downloader {
    fn fetch(
        &self,
        url: &str,
        destination: &Path,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<u64, InstallError> {
        info!("Downloading {} -> {}", url, destination.display());

        // reqwest's timeout restarts on every read, so a slow trickle would
        // never hit it; this deadline bounds the transfer as a whole
        let deadline = Instant::now() + self.timeout;
        let timed_out = || {
            InstallError::download(url, format!("timed out after {:?}", self.timeout))
        };

        // send() returns as soon as the headers are in; the body streams below
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|e| InstallError::download(url, e))?;

        debug!("Response status: {}, final URL: {}", response.status(), response.url());

        if !response.status().is_success() {
            return Err(InstallError::download(
                url,
                format!("server returned status {}", response.status()),
            ));
        }

        let total = response.content_length();
        let mut file = File::create(destination).map_err(|e| {
            InstallError::download(url, format!("cannot create {}: {}", destination.display(), e))
        })?;

        let mut throttle = ProgressThrottle::new(self.report_every);
        let mut buffer = [0u8; CHUNK_SIZE];
        let mut done: u64 = 0;

        loop {
            let read = response
                .read(&mut buffer)
                .map_err(|e| InstallError::download(url, e))?;
            if read == 0 {
                break;
            }
            if Instant::now() >= deadline {
                return Err(timed_out());
            }
            file.write_all(&buffer[..read]).map_err(|e| {
                InstallError::download(url, format!("cannot write {}: {}", destination.display(), e))
            })?;
            done += read as u64;

            if throttle.should_report(done, total) {
                on_progress(done, total);
            }
        }

        file.flush()
            .map_err(|e| InstallError::download(url, format!("cannot flush file: {}", e)))?;

        if let Some(expected) = total {
            if done != expected {
                return Err(InstallError::download(
                    url,
                    format!("connection closed after {} of {} bytes", done, expected),
                ));
            }
        } else if throttle.needs_final_report(done) {
            on_progress(done, total);
        }

        info!("Download complete: {} bytes", done);
        Ok(done)
    }
}

// ============================================
// DISPLAY HELPERS
// ============================================

/// Format a byte count for humans, e.g. "630.0 MB".
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.0} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Tracks the transfer rate for the "Downloaded X / Y (Z MB/s)" line.
#[derive(Debug, Clone)]
pub struct TransferRate {
    started: Instant,
}

impl TransferRate {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn mb_per_sec(&self, bytes: u64) -> f64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            bytes as f64 / secs / (1024.0 * 1024.0)
        }
    }

    /// "Downloaded 120 MB / 630 MB (11.3 MB/s)"
    pub fn status_line(&self, done: u64, total: Option<u64>) -> String {
        let done_mb = done / 1024 / 1024;
        let total_mb = total.map(|t| (t / 1024 / 1024).to_string());
        format!(
            "Downloaded {} MB / {} MB ({:.1} MB/s)",
            done_mb,
            total_mb.as_deref().unwrap_or("?"),
            self.mb_per_sec(done)
        )
    }
}
