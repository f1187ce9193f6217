//! Failure tracking core for log-driven brute-force mitigation.
//!
//! Log lines flow through [`filter::EventExtractor`] into a
//! [`registry::FailRegistry`]; identities that cross the retry threshold
//! come out as [`models::FailTicket`]s for whoever enforces bans.

pub mod config;
pub mod datedetector;
pub mod dns;
pub mod error;
pub mod filter;
pub mod ignore_list;
pub mod jail;
pub mod logsource;
pub mod models;
pub mod registry;
pub mod sampling;

pub use error::{ConfigError, RegistryEmpty};
pub use filter::EventExtractor;
pub use jail::Jail;
pub use logsource::LogSource;
pub use models::{FailRecord, FailTicket};
pub use registry::FailRegistry;
