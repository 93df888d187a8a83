//! `propdesk-core`: configuration and shared error types for the
//! property-management back office.

pub mod config;
pub mod error;

pub use config::PropdeskConfig;
pub use error::{CoreError, Result};
