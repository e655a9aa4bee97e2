//! Resolves a runnable plugin by name and wires its dependencies.

use std::time::Duration;

use async_trait::async_trait;
use f4sten_core::{
    ArgsBinder, BindError, BusArgs, BusClient, BusError, ConfigError, ConnectorIdentity,
    Envelope, ParsedArgs, Provenance,
    identity::{RESERVED_PREFIX, default_group_id},
    transport_for,
};
use schemars::schema_for;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::{
    cli::{LoaderArgs, LogArgs, preselect_plugin},
    logger,
};

pub const PROGRAM: &str = "f4sten";
/// Exit status for configuration and usage errors.
pub const CONFIG_EXIT_CODE: i32 = 2;
/// Exit status for failures after the plugin was configured.
pub const RUNTIME_EXIT_CODE: i32 = 1;

/// A worker started by the launcher.
#[async_trait]
pub trait Plugin: Send {
    async fn run(&mut self) -> anyhow::Result<()>;
}

/// Everything a plugin factory receives.
pub struct PluginContext {
    pub bus: BusClient,
    pub args: ParsedArgs,
}

pub type BindArgsFn = fn(&mut ArgsBinder) -> Result<(), BindError>;
pub type FactoryFn = fn(PluginContext) -> anyhow::Result<Box<dyn Plugin>>;

#[derive(Clone)]
pub struct PluginEntry {
    /// Fully qualified name, e.g. `eu.f4sten.relay.Main`.
    pub name: &'static str,
    pub version: &'static str,
    pub description: &'static str,
    /// Binds the option bundles the plugin reads.
    pub bind_args: BindArgsFn,
    pub factory: FactoryFn,
}

impl PluginEntry {
    /// Name with the reserved namespace prefix removed.
    pub fn unprefixed_name(&self) -> &'static str {
        self.name.strip_prefix(RESERVED_PREFIX).unwrap_or(self.name)
    }

    /// Name with the prefix and a trailing `.Main` removed.
    pub fn short_name(&self) -> &'static str {
        default_group_id(self.name)
    }
}

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("no plugin selected; pass --plugin <id> or --list-plugins\n\n{usage}")]
    MissingPlugin { usage: String },

    #[error("unknown plugin `{id}`; registered plugins: {known}{}", usage_suffix(.usage))]
    UnknownPlugin {
        id: String,
        known: String,
        usage: String,
    },

    #[error("plugin id `{id}` is ambiguous, candidates: {candidates}{}", usage_suffix(.usage))]
    AmbiguousPlugin {
        id: String,
        candidates: String,
        usage: String,
    },

    #[error("plugin `{0}` is registered twice")]
    DuplicatePlugin(&'static str),

    #[error(transparent)]
    Args(#[from] BindError),

    #[error("{source}\n\n{usage}")]
    Config {
        #[source]
        source: ConfigError,
        usage: String,
    },

    #[error("cannot initialize logging: {0:#}")]
    Logging(#[source] anyhow::Error),

    #[error("cannot render the envelope schema: {0}")]
    Schema(#[source] serde_json::Error),

    #[error("cannot connect to the bus: {0}")]
    Bus(#[from] BusError),

    #[error("cannot instantiate plugin {plugin}: {cause:#}")]
    Instantiate {
        plugin: &'static str,
        #[source]
        cause: anyhow::Error,
    },

    #[error("plugin {plugin} failed: {cause:#}")]
    Run {
        plugin: &'static str,
        #[source]
        cause: anyhow::Error,
    },
}

fn usage_suffix(usage: &str) -> String {
    if usage.is_empty() {
        String::new()
    } else {
        format!("\n\n{usage}")
    }
}

impl LoaderError {
    /// Attaches `usage` to a plugin lookup failure.
    pub fn with_usage(mut self, help: String) -> Self {
        if let LoaderError::UnknownPlugin { usage, .. } | LoaderError::AmbiguousPlugin { usage, .. } =
            &mut self
        {
            *usage = help;
        }
        self
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            LoaderError::Bus(_) | LoaderError::Instantiate { .. } | LoaderError::Run { .. } => {
                RUNTIME_EXIT_CODE
            }
            _ => CONFIG_EXIT_CODE,
        }
    }

    /// `--help` or `--version` output rather than a failure.
    pub fn is_informational(&self) -> bool {
        matches!(self, LoaderError::Args(err) if err.is_informational())
    }
}

/// Build-time table of the plugins this binary can run.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    entries: Vec<PluginEntry>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entry: PluginEntry) -> Result<(), LoaderError> {
        if self.entries.iter().any(|known| known.name == entry.name) {
            return Err(LoaderError::DuplicatePlugin(entry.name));
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> &[PluginEntry] {
        &self.entries
    }

    /// Looks `id` up as fully qualified name, then without the reserved
    /// prefix, then as short name. Only the first stage with a match counts.
    pub fn find(&self, id: &str) -> Result<&PluginEntry, LoaderError> {
        if let Some(entry) = self.entries.iter().find(|entry| entry.name == id) {
            return Ok(entry);
        }
        let stages: [fn(&PluginEntry) -> &'static str; 2] =
            [PluginEntry::unprefixed_name, PluginEntry::short_name];
        for stage in stages {
            let hits: Vec<&PluginEntry> =
                self.entries.iter().filter(|entry| stage(entry) == id).collect();
            match hits.as_slice() {
                [] => continue,
                [entry] => return Ok(*entry),
                many => {
                    return Err(LoaderError::AmbiguousPlugin {
                        id: id.to_string(),
                        candidates: many.iter().map(|e| e.name).collect::<Vec<_>>().join(", "),
                        usage: String::new(),
                    });
                }
            }
        }
        Err(LoaderError::UnknownPlugin {
            id: id.to_string(),
            known: self.names().join(", "),
            usage: String::new(),
        })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|entry| entry.name).collect()
    }

    /// One line per plugin: short name, full name, version and description.
    pub fn describe(&self) -> String {
        let width = self
            .entries
            .iter()
            .map(|entry| entry.short_name().len())
            .max()
            .unwrap_or(0);
        self.entries
            .iter()
            .map(|entry| {
                format!(
                    "{:width$}  {} {}  {}",
                    entry.short_name(),
                    entry.name,
                    entry.version,
                    entry.description
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// What a successful launch produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Listed(String),
    Schema(String),
}

/// JSON schema of the envelope wire format.
pub fn envelope_schema() -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&schema_for!(Envelope<Value, Value>))
}

/// Runs the plugin selected by `argv` to completion.
///
/// Configuration is checked in full before logging is installed or the bus
/// is contacted.
pub async fn launch<I, S>(registry: &PluginRegistry, argv: I) -> Result<Outcome, LoaderError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let argv: Vec<String> = argv.into_iter().map(Into::into).collect();

    let mut binder = ArgsBinder::new(PROGRAM);
    binder.bind::<LoaderArgs>()?;
    binder.bind::<LogArgs>()?;
    binder.bind::<BusArgs>()?;

    let entry = match preselect_plugin(argv.as_slice()) {
        Some(id) => Some(
            registry
                .find(&id)
                .map_err(|err| err.with_usage(binder.usage_of::<LoaderArgs>()))?,
        ),
        None => None,
    };
    if let Some(entry) = entry {
        (entry.bind_args)(&mut binder)?;
    }

    let parsed = binder.parse_from(&argv)?;
    let loader: LoaderArgs = parsed.get()?;
    if loader.list_plugins {
        return Ok(Outcome::Listed(registry.describe()));
    }
    if loader.envelope_schema {
        return envelope_schema().map(Outcome::Schema).map_err(LoaderError::Schema);
    }
    let Some(entry) = entry else {
        return Err(LoaderError::MissingPlugin {
            usage: binder.usage_of::<LoaderArgs>(),
        });
    };

    let log: LogArgs = parsed.get()?;
    let bus_args: BusArgs = parsed.get()?;
    let config_error = |source: ConfigError| LoaderError::Config {
        source,
        usage: binder.usage_of::<BusArgs>(),
    };
    let identity = ConnectorIdentity::resolve(entry.name, &bus_args).map_err(config_error)?;
    let transport = transport_for(identity.bootstrap_url()).map_err(config_error)?;

    logger::init_logging(&log).map_err(LoaderError::Logging)?;
    info!(
        "starting {} {} as {} in group {}",
        entry.name,
        entry.version,
        identity.client_id(),
        identity.group_id()
    );

    let provenance = Provenance::local(entry.name, entry.version);
    let bus = BusClient::connect(transport.as_ref(), identity, provenance)
        .await?
        .with_poll_timeout(Duration::from_millis(bus_args.poll_timeout_ms));

    let mut plugin = (entry.factory)(PluginContext { bus, args: parsed }).map_err(|cause| {
        LoaderError::Instantiate {
            plugin: entry.name,
            cause,
        }
    })?;
    plugin.run().await.map_err(|cause| LoaderError::Run {
        plugin: entry.name,
        cause,
    })?;
    info!("{} finished", entry.name);
    Ok(Outcome::Completed)
}
