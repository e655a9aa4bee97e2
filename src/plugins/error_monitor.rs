//! Logs the error records of one topic.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use chrono::Utc;
use clap::Args;
use f4sten_core::{ArgsBinder, BindError, BusClient, Envelope, Failure};
use serde_json::Value;
use tracing::{info, warn};

use super::{WorkerArgs, drive};
use crate::loader::{Plugin, PluginContext, PluginEntry};

pub const NAME: &str = "eu.f4sten.errormonitor.Main";
pub const DEFAULT_TOPIC: &str = "f4sten.relay.in";

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct MonitorArgs {
    /// Topic whose ERROR lane is monitored
    #[arg(long = "monitor-topic", default_value = DEFAULT_TOPIC)]
    pub topic: String,
}

impl Default for MonitorArgs {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
        }
    }
}

pub fn entry() -> PluginEntry {
    PluginEntry {
        name: NAME,
        version: env!("CARGO_PKG_VERSION"),
        description: "logs the ERROR lane of a topic",
        bind_args,
        factory,
    }
}

fn bind_args(binder: &mut ArgsBinder) -> Result<(), BindError> {
    binder.bind::<MonitorArgs>()?;
    binder.bind::<WorkerArgs>()
}

fn factory(ctx: PluginContext) -> anyhow::Result<Box<dyn Plugin>> {
    Ok(Box::new(ErrorMonitor {
        args: ctx.args.get()?,
        worker: ctx.args.get()?,
        bus: ctx.bus,
        reported: Arc::new(AtomicUsize::new(0)),
    }))
}

pub struct ErrorMonitor {
    bus: BusClient,
    args: MonitorArgs,
    worker: WorkerArgs,
    reported: Arc<AtomicUsize>,
}

/// Logs one error record. Records without error details are rejected.
pub fn report(msg: &Envelope<Value, Value>) -> Result<(), Failure> {
    let Some(err) = msg.error() else {
        return Err(Failure::new(
            "MissingError",
            "record on the ERROR lane carries no error details",
        ));
    };
    let age = Utc::now() - msg.created_at();
    warn!(
        producer = msg.plugin_name().unwrap_or("unknown"),
        host = msg.host().unwrap_or("unknown"),
        age_ms = age.num_milliseconds(),
        "{}: {}",
        err.kind,
        err.message
    );
    Ok(())
}

#[async_trait]
impl Plugin for ErrorMonitor {
    async fn run(&mut self) -> anyhow::Result<()> {
        let reported = self.reported.clone();
        self.bus.subscribe_errors(&self.args.topic, move |msg| {
            report(msg)?;
            reported.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })?;
        info!("monitoring errors of {}", self.args.topic);
        drive(&mut self.bus, &self.worker).await?;
        info!(
            "{} error records reported",
            self.reported.load(Ordering::Relaxed)
        );
        Ok(())
    }
}
