//! Console and per-run log file setup.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_FILTER: &str = "warn,k1_cli=info,k1_cloud=info,k1_scm=info";
const VERBOSE_FILTER: &str = "info,k1_cli=debug,k1_cloud=debug,k1_scm=debug";

/// Path of this run's log file under `logs`.
#[must_use]
pub fn log_file_path(logs: &Path) -> PathBuf {
    let epoch = chrono::Utc::now().timestamp();
    logs.join(format!("log_{epoch}.log"))
}

/// Install the global subscriber.
///
/// The console gets human-readable lines; `log_file` (if it can be created)
/// gets one JSON object per event. `RUST_LOG` overrides the default filter.
/// Returns the log file path actually in use.
pub fn init(verbose: bool, log_file: Option<PathBuf>) -> Option<PathBuf> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER })
    });

    let file = log_file.and_then(|path| {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).ok()?;
        }
        File::create(&path).ok().map(|file| (path, file))
    });
    let (path, file_layer) = match file {
        Some((path, file)) => (
            Some(path),
            Some(
                fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_writer(Mutex::new(file)),
            ),
        ),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    path
}
