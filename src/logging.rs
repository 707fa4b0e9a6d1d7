use std::{fs::OpenOptions, io, path::Path, sync::Mutex};

use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// The level logged at when neither `-v` nor `-s` is given.
pub const DEFAULT_LEVEL: Level = Level::INFO;

/// Picks the level for the `--verbose` and `--silent` flags.
pub fn level_for(verbose: bool, silent: bool) -> Level {
    match (verbose, silent) {
        (true, _) => Level::DEBUG,
        (false, true) => Level::WARN,
        (false, false) => DEFAULT_LEVEL,
    }
}

fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()))
}

/// Installs the global subscriber. `RUST_LOG` takes precedence over `level`. With a `log_file`,
/// lines are appended there without colors instead of going to stderr.
pub fn init_logging(level: Level, log_file: Option<&Path>) -> io::Result<()> {
    let registry = tracing_subscriber::registry().with(env_filter(level));

    let result = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
                .try_init()
        }
        None => registry
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .try_init(),
    };

    result.map_err(|error| io::Error::new(io::ErrorKind::Other, error))
}
