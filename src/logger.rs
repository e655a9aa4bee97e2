use std::{fs, io};

use anyhow::Context;
use tracing::Subscriber;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*};

use crate::cli::LogArgs;

/// File name prefix of the rolling log inside `--log-dir`.
pub const LOG_FILE_PREFIX: &str = "f4sten.log";

/// Builds the subscriber described by `args` without installing it.
///
/// Logs go to stderr, or to a daily rolling file when a log directory is set.
pub fn build_subscriber(args: &LogArgs) -> anyhow::Result<impl Subscriber + Send + Sync + 'static> {
    let env_filter = EnvFilter::new(args.log_level.directive());

    let (stderr_layer, file_layer) = match &args.log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("cannot create log directory {}", dir.display()))?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_PREFIX);
            let layer = fmt::layer().with_writer(appender).with_ansi(false);
            (None, Some(layer))
        }
        None => (Some(fmt::layer().with_writer(io::stderr)), None),
    };

    Ok(Registry::default()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer))
}

/// Installs the process-wide subscriber.
///
/// Returns `false` when one was installed before, which happens when several
/// plugins are launched from one process.
pub fn init_logging(args: &LogArgs) -> anyhow::Result<bool> {
    let subscriber = build_subscriber(args)?;
    Ok(tracing::subscriber::set_global_default(subscriber).is_ok())
}
