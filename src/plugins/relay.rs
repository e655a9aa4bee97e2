//! Forwards every envelope of one topic to another, keeping its lane.

use anyhow::bail;
use async_trait::async_trait;
use clap::Args;
use f4sten_core::{ArgsBinder, BindError, BusClient, Envelope, Failure, Lane, Outbox};
use serde_json::Value;
use tracing::info;

use super::{WorkerArgs, drive};
use crate::loader::{Plugin, PluginContext, PluginEntry};

pub const NAME: &str = "eu.f4sten.relay.Main";
pub const DEFAULT_INPUT: &str = "f4sten.relay.in";
pub const DEFAULT_OUTPUT: &str = "f4sten.relay.out";

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct RelayArgs {
    /// Topic to consume
    #[arg(long = "relay-in", default_value = DEFAULT_INPUT)]
    pub input: String,

    /// Topic the payloads are forwarded to
    #[arg(long = "relay-out", default_value = DEFAULT_OUTPUT)]
    pub output: String,
}

impl Default for RelayArgs {
    fn default() -> Self {
        Self {
            input: DEFAULT_INPUT.to_string(),
            output: DEFAULT_OUTPUT.to_string(),
        }
    }
}

pub fn entry() -> PluginEntry {
    PluginEntry {
        name: NAME,
        version: env!("CARGO_PKG_VERSION"),
        description: "forwards payloads between two topics",
        bind_args,
        factory,
    }
}

fn bind_args(binder: &mut ArgsBinder) -> Result<(), BindError> {
    binder.bind::<RelayArgs>()?;
    binder.bind::<WorkerArgs>()
}

fn factory(ctx: PluginContext) -> anyhow::Result<Box<dyn Plugin>> {
    let args: RelayArgs = ctx.args.get()?;
    let worker: WorkerArgs = ctx.args.get()?;
    if args.input == args.output {
        bail!("--relay-in and --relay-out are both `{}`", args.input);
    }
    Ok(Box::new(Relay {
        bus: ctx.bus,
        args,
        worker,
    }))
}

pub struct Relay {
    bus: BusClient,
    args: RelayArgs,
    worker: WorkerArgs,
}

/// Republishes the payload of `msg` on `output`, derived from `msg`.
///
/// Envelopes without a payload, or with a `null` one, are rejected.
pub fn forward(
    msg: &Envelope<Value, Value>,
    lane: Lane,
    outbox: &mut Outbox,
    output: &str,
) -> Result<(), Failure> {
    match msg.payload() {
        None | Some(Value::Null) => Err(Failure::new(
            "NullPayload",
            "relay cannot forward an envelope without payload",
        )),
        Some(payload) => {
            outbox.publish_derived(msg, payload, output, lane)?;
            Ok(())
        }
    }
}

#[async_trait]
impl Plugin for Relay {
    async fn run(&mut self) -> anyhow::Result<()> {
        let output = self.args.output.clone();
        self.bus
            .subscribe::<Value, Value, _>(&self.args.input, move |msg, lane, outbox| {
                forward(msg, lane, outbox, &output)
            })?;
        info!("relaying {} -> {}", self.args.input, self.args.output);
        let forwarded = drive(&mut self.bus, &self.worker).await?;
        info!("relay handled {forwarded} records");
        Ok(())
    }
}
