// ============================================
// CloudStream Installer - main.rs
// ============================================
// This is the entry point of the application.
//
// The program flow is:
// 1. main() parses the command line flags
// 2. Set up diagnostics (stderr only - stdout is the event channel)
// 3. Load installer.toml (or the built-in defaults)
// 4. Start reading commands from stdin on a background thread
// 5. Run the host loop until CloseApp (or stdin closes)
//
// The UI that launches us writes commands to our stdin and reads
// events from our stdout, see host.rs for the line format.
// ============================================

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

// Our modules
mod config;       // installer.toml + defaults
mod download;     // payload download with progress
mod error;        // InstallError
mod events;       // command/event wire format
mod extract;      // 7-Zip extraction
mod features;     // Hyper-V feature toggles
mod host;         // stdin/stdout command loop
mod install_log;  // timestamped install log file
mod pipeline;     // the seven install steps
mod probe;        // virtualization probe (WMI)
mod process;      // external process runner (+ elevation)
mod provision;    // Install.ps1
mod session;      // per-run state + monotonic progress
mod shortcut;     // desktop shortcut
mod staging;      // per-run temp folder

use config::InstallerConfig;
use events::Command;
use host::{Host, HostMessage};

// ============================================
// COMMAND LINE
// ============================================

/// Downloads, extracts and provisions CloudStream on Windows.
#[derive(Parser, Debug)]
#[command(name = "cloudstream-installer", version, about)]
struct Args {
    /// Path to an installer.toml (default: next to the EXE, if present)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Install into this folder instead of the configured one
    #[arg(long, value_name = "PATH")]
    install_dir: Option<PathBuf>,

    /// Start the installation right away (no StartInstall command needed)
    #[arg(long)]
    start: bool,

    /// Debug-level diagnostics on stderr
    #[arg(short, long)]
    verbose: bool,
}

// ============================================
// MAIN FUNCTION
// ============================================

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    info!("CloudStream Installer v{}", env!("CARGO_PKG_VERSION"));
    info!("App directory: {:?}", config::get_app_directory());

    let mut config = InstallerConfig::load(args.config.as_deref())
        .context("Failed to load installer configuration")?;
    if let Some(dir) = args.install_dir {
        config.install_dir = dir;
    }
    info!("Install directory: {}", config.install_dir.display());

    // stdout belongs to the event channel; lock it once for the host
    let stdout = io::stdout();
    let mut host = Host::new(config, stdout.lock());

    if args.start {
        host.sender()
            .send(HostMessage::Command(Command::StartInstall { online: false }))
            .context("Failed to queue StartInstall")?;
    }

    // Commands come in on stdin, read on a background thread so the
    // host can keep writing events while waiting for input
    host::spawn_command_reader(io::BufReader::new(io::stdin()), host.sender())
        .context("Failed to start the command reader")?;

    host.run()
}

/// Diagnostics go to stderr. RUST_LOG wins; otherwise warn, or debug
/// with --verbose.
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}
