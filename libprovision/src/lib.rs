#![allow(unused)]
#![forbid(unsafe_code)]

//! # provision
//!
//! Remote command execution and recovery for provisioning network devices
//! over SSH. Provides:
//!
//! - Sessions with ordered key, agent and password authentication
//! - Commands with timeouts, retries and success checks
//! - Sequential and bounded-parallel batches
//! - Reboot and reconnect with a reachability deadline
//! - Execution reports, plans and host inventories
//!
//! Device-specific commands are data: nothing here knows what a package
//! manager or a firewall rule is.

pub mod apply;
pub mod error;
pub mod executor;
pub mod log;
pub mod plan;
pub mod recovery;
pub mod report;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use error::ProvisionError;
