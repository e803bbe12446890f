//! Logging setup for the sync engine and its CLI.
//!
//! Console output goes to stderr. File output is written to `current.log`
//! inside the configured directory; the log of the previous run is archived
//! under a timestamped name and old archives are pruned.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{LoggingError, LoggingResult};

const ARCHIVE_PREFIX: &str = "wallet-sync.";
const ARCHIVE_SUFFIX: &str = ".log";
const CURRENT_LOG: &str = "current.log";
const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Keeps the file writer alive. Buffered entries are flushed on drop.
#[derive(Debug)]
pub struct LoggingGuard {
    _worker_guard: Option<WorkerGuard>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Explicit level. `None` reads `RUST_LOG` and falls back to INFO.
    pub level: Option<LevelFilter>,
    pub console: bool,
    pub file: Option<LogFileConfig>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            console: true,
            file: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogFileConfig {
    pub log_dir: PathBuf,
    /// Number of archived logs kept next to `current.log`
    pub max_files: usize,
}

/// Install the global subscriber.
///
/// With neither console nor file output enabled nothing is installed and
/// the tracing macros stay no-ops. Fails if a global subscriber already
/// exists or the log directory cannot be prepared.
pub fn init_logging(config: LoggingConfig) -> LoggingResult<LoggingGuard> {
    if !config.console && config.file.is_none() {
        return Ok(LoggingGuard {
            _worker_guard: None,
        });
    }

    let filter = match config.level {
        Some(level) => EnvFilter::new(level.to_string()),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(LevelFilter::INFO.to_string())),
    };

    let (file_layer, worker_guard) = match config.file.as_ref() {
        Some(file_config) => {
            let (writer, guard) = open_log_file(file_config)?;
            let layer = fmt::layer().with_target(true).with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let console_layer = config
        .console
        .then(|| fmt::layer().with_target(true).with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| LoggingError::SubscriberInit(e.to_string()))?;

    Ok(LoggingGuard {
        _worker_guard: worker_guard,
    })
}

/// Parse a level name as accepted by `--log-level`.
pub fn parse_level(name: &str) -> Option<LevelFilter> {
    name.parse().ok()
}

fn open_log_file(config: &LogFileConfig) -> LoggingResult<(NonBlocking, WorkerGuard)> {
    fs::create_dir_all(&config.log_dir)?;
    archive_current_log(&config.log_dir)?;
    prune_archives(&config.log_dir, config.max_files)?;

    let file = File::create(config.log_dir.join(CURRENT_LOG))?;
    Ok(tracing_appender::non_blocking(file))
}

/// Move `current.log` aside, naming it after its last write.
fn archive_current_log(log_dir: &Path) -> LoggingResult<()> {
    let current = log_dir.join(CURRENT_LOG);
    if !current.exists() {
        return Ok(());
    }

    let written_at = modified_at(&current).unwrap_or_else(Local::now);
    let target = free_archive_path(log_dir, written_at)?;
    fs::rename(&current, &target).map_err(|e| LoggingError::ArchiveFailed(e.to_string()))
}

fn free_archive_path(log_dir: &Path, written_at: DateTime<Local>) -> LoggingResult<PathBuf> {
    let stamp = written_at.format(TIMESTAMP_FORMAT).to_string();
    let candidate = log_dir.join(format!("{}{}{}", ARCHIVE_PREFIX, stamp, ARCHIVE_SUFFIX));
    if !candidate.exists() {
        return Ok(candidate);
    }
    (1..1000)
        .map(|n| log_dir.join(format!("{}{}.{}{}", ARCHIVE_PREFIX, stamp, n, ARCHIVE_SUFFIX)))
        .find(|path| !path.exists())
        .ok_or_else(|| LoggingError::ArchiveFailed(format!("no free archive name for {}", stamp)))
}

fn modified_at(path: &Path) -> Option<DateTime<Local>> {
    fs::metadata(path).and_then(|m| m.modified()).ok().map(DateTime::from)
}

fn is_archive(name: &str) -> bool {
    name.starts_with(ARCHIVE_PREFIX) && name.ends_with(ARCHIVE_SUFFIX)
}

/// Delete the oldest archives beyond `keep`. `current.log` is never touched.
fn prune_archives(log_dir: &Path, keep: usize) -> LoggingResult<()> {
    let mut archives: Vec<(Option<std::time::SystemTime>, PathBuf)> = fs::read_dir(log_dir)
        .map_err(|e| LoggingError::ArchiveFailed(format!("cannot list {:?}: {}", log_dir, e)))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_str().is_some_and(is_archive))
        .map(|entry| (entry.metadata().and_then(|m| m.modified()).ok(), entry.path()))
        .collect();

    if archives.len() <= keep {
        return Ok(());
    }

    // oldest first, name as tie-break for equal mtimes
    archives.sort();
    let excess = archives.len() - keep;
    for (_, path) in archives.into_iter().take(excess) {
        if let Err(e) = fs::remove_file(&path) {
            tracing::warn!("Failed to remove old log file {:?}: {}", path, e);
        }
    }
    Ok(())
}
