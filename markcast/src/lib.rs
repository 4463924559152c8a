//! # markcast
//!
//! Marker relay for a live broadcast. Source plugins publish markers (the
//! track now playing, the topic under discussion) to a
//! [`Mediator`](markcast_common::Mediator), which hands them to sink
//! plugins either at once or after the broadcast delay.
//!
//! The binary loads a TOML config, starts every configured plugin through
//! the [`PluginManager`](manager::PluginManager), and runs the control
//! [`Shell`](shell::Shell) on stdin until `quit` or a signal.

pub mod config;
pub mod manager;
pub mod plugins;
pub mod shell;
pub mod show;

pub use config::{Config, CoreConfig};
pub use manager::PluginManager;
pub use plugins::{PluginContext, PluginFactory};
pub use shell::{Flow, Shell};
pub use show::Show;
