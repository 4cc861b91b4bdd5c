// ABOUTME: Shared logging setup for the hivemind hub, its supervisor, and client commands
// ABOUTME: LogMode picks the sink and default level; RUST_LOG always wins

use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// How a process wants its logs delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode<'a> {
    /// Long-running hub daemon: stderr, INFO and above.
    Daemon,
    /// One-shot client command: stderr, INFO for the named crate, WARN for the rest.
    Command(&'a str),
    /// A supervising UI owns the terminal: append to ~/.hivemind/logs/{name}.log at WARN.
    File(&'a str),
}

/// Install the global tracing subscriber for `mode`.
///
/// File setup failures are reported on stderr and leave the process without
/// logging rather than aborting it.
pub fn init(mode: LogMode<'_>) {
    match mode {
        LogMode::Daemon => {
            tracing_subscriber::fmt()
                .with_env_filter(filter(Level::INFO, None))
                .init();
        }
        LogMode::Command(crate_name) => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(filter(Level::WARN, Some(crate_name)))
                .init();
        }
        LogMode::File(app_name) => {
            if let Err(e) = init_file(app_name) {
                eprintln!("Warning: failed to set up file logging: {e}");
            }
        }
    }
}

/// Path of the log file used by [`LogMode::File`].
pub fn log_file_path(app_name: &str) -> Option<PathBuf> {
    dirs::home_dir().map(|home| {
        home.join(".hivemind")
            .join("logs")
            .join(format!("{app_name}.log"))
    })
}

fn init_file(app_name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let path = log_file_path(app_name).ok_or("could not determine home directory")?;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_env_filter(filter(Level::WARN, None))
        .with_ansi(false)
        .init();

    Ok(())
}

fn filter(base: Level, crate_name: Option<&str>) -> EnvFilter {
    let filter = EnvFilter::from_default_env().add_directive(base.into());
    match crate_name {
        Some(name) => filter.add_directive(
            format!("{name}=info")
                .parse()
                .unwrap_or_else(|_| Level::INFO.into()),
        ),
        None => filter,
    }
}
