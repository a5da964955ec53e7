//! Status/diagnostic printing (component L). Severity-prefixed lines on
//! stderr, suppressed by `--mute`, mirrored into `tracing` so a
//! `RUST_LOG`-driven trace of the session survives independent of the
//! interactive transcript.

use colored::Colorize;

pub fn info(mute: bool, msg: &str) {
    tracing::info!("{msg}");
    if !mute {
        eprintln!("{} {}", "[tio]".green().bold(), msg);
    }
}

pub fn warn(mute: bool, msg: &str) {
    tracing::warn!("{msg}");
    if !mute {
        eprintln!("{} {}", "[tio warning]".yellow().bold(), msg);
    }
}

pub fn error(mute: bool, msg: &str) {
    tracing::error!("{msg}");
    if !mute {
        eprintln!("{} {}", "[tio error]".red().bold(), msg);
    }
}

/// Fatal: print and terminate the process. Used only before a Session
/// exists (configuration/device-present failures per spec.md §7).
pub fn fatal(msg: &str) -> ! {
    eprintln!("{} {}", "[tio fatal]".red().bold(), msg);
    tracing::error!("fatal: {msg}");
    std::process::exit(1);
}

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
