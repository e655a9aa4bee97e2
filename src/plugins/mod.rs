//! Plugins compiled into the launcher.

use clap::Args;
use f4sten_core::BusClient;
use tokio::signal;
use tracing::{debug, info};

use crate::loader::{LoaderError, PluginRegistry};

pub mod error_monitor;
pub mod relay;

/// Loop options shared by the built-in plugins.
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerArgs {
    /// Stop after this many consecutive empty polls (0 keeps running)
    #[arg(long = "max-idle-polls", default_value_t = 0)]
    pub max_idle_polls: u64,
}

pub fn builtin_registry() -> Result<PluginRegistry, LoaderError> {
    let mut registry = PluginRegistry::new();
    registry.register(relay::entry())?;
    registry.register(error_monitor::entry())?;
    Ok(registry)
}

/// Polls `bus` until the idle limit is reached or the process is interrupted,
/// then stops it. Returns the number of records dispatched.
///
/// Positions are committed after every pass that dispatched something; idle
/// passes send a heartbeat instead.
pub async fn drive(bus: &mut BusClient, worker: &WorkerArgs) -> anyhow::Result<usize> {
    let mut total = 0;
    let mut idle = 0;
    loop {
        let dispatched = tokio::select! {
            polled = bus.poll() => polled?,
            _ = signal::ctrl_c() => {
                info!("interrupted, stopping");
                break;
            }
        };
        if dispatched > 0 {
            bus.commit().await?;
            total += dispatched;
            idle = 0;
            continue;
        }
        bus.send_heartbeat().await?;
        idle += 1;
        debug!("idle poll {idle}");
        if worker.max_idle_polls > 0 && idle >= worker.max_idle_polls {
            info!("no records for {idle} polls, stopping");
            break;
        }
    }
    bus.stop().await?;
    Ok(total)
}
