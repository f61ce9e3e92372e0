//! # SIEM Agent
//!
//! A host-resident agent that collects security-relevant events (file logs,
//! OS event logs, syslog) and forwards them to a remote collector, with a
//! durable store-and-forward queue for connectivity gaps, a connectivity
//! supervisor, a health reporter, and a local admin HTTP surface for
//! configuration push/pull.

pub mod admin;
pub mod config;
pub mod config_manager;
pub mod dispatcher;
pub mod drainer;
pub mod error;
pub mod event;
pub mod forwarder;
pub mod health;
pub mod queue;
pub mod service;
pub mod sources;
pub mod supervisor;
pub mod types;

pub use config::AgentConfig;
pub use error::{AgentError, Result};
pub use event::Event;
pub use service::AgentService;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const SERVICE_NAME: &str = "siem-agent";
