use std::path::PathBuf;

use clap::{Args, ValueEnum};

/// Options of the launcher itself.
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct LoaderArgs {
    /// Plugin to run: fully qualified name, name without `eu.f4sten.`, or short name
    #[arg(short = 'p', long = "plugin")]
    pub plugin: Option<String>,

    /// Print the registered plugins and exit
    #[arg(long = "list-plugins")]
    pub list_plugins: bool,

    /// Print the JSON schema of the envelope wire format and exit
    #[arg(long = "envelope-schema")]
    pub envelope_schema: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Critical,
}

impl LogLevel {
    /// `EnvFilter` directive for this level. `critical` has no tracing
    /// counterpart and maps to `error`.
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct LogArgs {
    /// Lowest level that gets logged
    #[arg(long = "log-level", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Write a daily rolling log file into this directory instead of stderr
    #[arg(long = "log-dir")]
    pub log_dir: Option<PathBuf>,
}

/// Finds the plugin identifier before the full command line is known.
///
/// Plugin bundles can only be bound once the plugin is known, so this scan
/// runs ahead of clap and accepts `--plugin x`, `--plugin=x`, `-p x` and `-px`.
pub fn preselect_plugin<S: AsRef<str>>(argv: &[S]) -> Option<String> {
    let mut args = argv.iter().skip(1).map(AsRef::as_ref);
    while let Some(arg) = args.next() {
        match arg {
            "--" => return None,
            "--plugin" | "-p" => return args.next().map(str::to_string),
            _ => {}
        }
        if let Some(id) = arg.strip_prefix("--plugin=") {
            return Some(id.to_string());
        }
        if let Some(id) = arg.strip_prefix("-p") {
            if !id.starts_with('-') && !id.is_empty() {
                return Some(id.trim_start_matches('=').to_string());
            }
        }
    }
    None
}
