//! Launcher for f4sten plugins.
//!
//! [`loader::launch`] turns a command line into a running plugin: it selects
//! the plugin from the [`loader::PluginRegistry`], binds every option bundle,
//! resolves the connector identity, installs logging and hands a connected
//! [`f4sten_core::BusClient`] to the plugin factory.

pub mod cli;
pub mod loader;
pub mod logger;
pub mod plugins;

pub use loader::{
    LoaderError, Outcome, Plugin, PluginContext, PluginEntry, PluginRegistry, launch,
};
pub use plugins::builtin_registry;
