//! # markcast Common Library
//!
//! Core of the marker relay shared by the markcast binary and its plugins:
//! - Marker model (`Marker`, `MarkerType`)
//! - Subscriber queues with an in-band termination sentinel
//! - The mediator (instant and delayed delivery lanes, gating, shutdown)
//! - Plugin lifecycle contract
//! - Error types and config-section helpers

pub mod config;
pub mod error;
pub mod marker;
pub mod mediator;
pub mod plugin;
pub mod queue;

pub use error::{ConfigError, Error, Result};
pub use marker::{Marker, MarkerType};
pub use mediator::{Lane, Mediator, MediatorState, QUEUE_MAX};
pub use plugin::{Plugin, PluginControl, PluginHandle, PluginKind, PluginState};
pub use queue::SubscriberQueue;
