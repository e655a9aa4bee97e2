use clap::Args;
use uuid::Uuid;

use crate::{error::ConfigError, lane::Lane};

/// Namespace prefix stripped from plugin identifiers when deriving a group id.
pub const RESERVED_PREFIX: &str = "eu.f4sten.";
/// Final path segment stripped from plugin identifiers when deriving a group id.
pub const MAIN_SUFFIX: &str = ".Main";
pub const CLIENT_ID_SEPARATOR: char = '-';
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 1000;

/// Bus connection options shared by every plugin.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct BusArgs {
    /// Bootstrap address of the message bus (e.g. memory://local)
    #[arg(long = "kafka-url", env = "F4STEN_KAFKA_URL")]
    pub kafka_url: Option<String>,

    /// Consumer group to join instead of the one derived from the plugin name
    #[arg(long = "kafka-group-id")]
    pub group_id: Option<String>,

    /// Discriminator appended to the group id to form the client id
    #[arg(long = "instance-id")]
    pub instance_id: Option<String>,

    /// Longest time in milliseconds a single poll waits for records
    #[arg(long = "poll-timeout-ms", default_value_t = DEFAULT_POLL_TIMEOUT_MS)]
    pub poll_timeout_ms: u64,
}

impl Default for BusArgs {
    fn default() -> Self {
        Self {
            kafka_url: None,
            group_id: None,
            instance_id: None,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
        }
    }
}

/// Broker connection parameters of one plugin process.
///
/// Derived once at startup and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorIdentity {
    bootstrap_url: String,
    group_id: String,
    client_id: String,
}

impl ConnectorIdentity {
    /// Resolves the identity of `plugin_id` under the given bus options.
    pub fn resolve(plugin_id: &str, args: &BusArgs) -> Result<Self, ConfigError> {
        let bootstrap_url = match args.kafka_url.as_deref() {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => return Err(ConfigError::MissingBusUrl),
        };
        let group_id = resolve_group_id(plugin_id, args.group_id.as_deref())?;
        let instance = resolve_instance_id(args.instance_id.as_deref())?;
        let client_id = format!("{group_id}{CLIENT_ID_SEPARATOR}{instance}");
        Ok(Self {
            bootstrap_url,
            group_id,
            client_id,
        })
    }

    pub fn bootstrap_url(&self) -> &str {
        &self.bootstrap_url
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Client id used by the consumer of a single lane.
    pub fn lane_client_id(&self, lane: Lane) -> String {
        format!("{}{CLIENT_ID_SEPARATOR}{}", self.client_id, lane)
    }
}

/// Group id derived from a plugin identifier alone.
///
/// Strips the reserved namespace prefix, then a trailing `.Main` only when it
/// is the final path segment.
pub fn default_group_id(plugin_id: &str) -> &str {
    let unqualified = plugin_id.strip_prefix(RESERVED_PREFIX).unwrap_or(plugin_id);
    unqualified.strip_suffix(MAIN_SUFFIX).unwrap_or(unqualified)
}

/// An explicit override wins verbatim; an empty one is a configuration error.
pub fn resolve_group_id(plugin_id: &str, explicit: Option<&str>) -> Result<String, ConfigError> {
    match explicit {
        Some("") => Err(ConfigError::EmptyOverride {
            flag: "--kafka-group-id",
        }),
        Some(group) => Ok(group.to_string()),
        None => match default_group_id(plugin_id) {
            "" => Err(ConfigError::InvalidPluginId(plugin_id.to_string())),
            group => Ok(group.to_string()),
        },
    }
}

/// Explicit instance id, or a fresh random one.
pub fn resolve_instance_id(explicit: Option<&str>) -> Result<String, ConfigError> {
    match explicit {
        Some("") => Err(ConfigError::EmptyOverride {
            flag: "--instance-id",
        }),
        Some(instance) => Ok(instance.to_string()),
        None => Ok(Uuid::new_v4().simple().to_string()),
    }
}
