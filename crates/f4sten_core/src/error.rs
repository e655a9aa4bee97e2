use thiserror::Error;

/// Startup configuration problems. Always fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing bus address: pass --kafka-url or set F4STEN_KAFKA_URL")]
    MissingBusUrl,

    /// The flag was present with an empty value, which is not the same as
    /// omitting it.
    #[error("{flag} was given an empty value; omit the flag to use the derived default")]
    EmptyOverride { flag: &'static str },

    #[error("plugin identifier `{0}` does not yield a consumer group name")]
    InvalidPluginId(String),

    #[error("unsupported bus address `{0}`; built-in transports accept memory://<name>")]
    UnsupportedBus(String),
}

/// Failures reported by the underlying bus implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection is closed")]
    Closed,

    #[error("address `{0}` was never subscribed on this connection")]
    NotSubscribed(String),

    #[error("broker state is unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced to callers of the bus client.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus client has been stopped")]
    Stopped,

    #[error("the ERROR lane of `{0}` only accepts error records")]
    ErrorLaneReserved(String),

    #[error("failed to encode envelope for `{address}`: {source}")]
    Encode {
        address: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type BusResult<T> = Result<T, BusError>;
