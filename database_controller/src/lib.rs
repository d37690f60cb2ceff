//! Placement and lifecycle of installation databases on shared Aurora clusters.
//!
//! Installations are packed onto long-lived MySQL and Postgres clusters, optionally behind
//! PGBouncer. The registry records which installation lives where; cloud tags let new
//! clusters be picked up without registering them by hand.

pub mod capacity;
pub mod cloud;
pub mod config;
pub mod context;
pub mod dialect;
pub mod discovery;
pub mod error;
pub mod k8s_secret;
pub mod lock;
pub mod logging;
pub mod metrics;
pub mod multitenant;
pub mod multitenant_pgbouncer;
pub mod naming;
pub mod placement;
pub mod registry;
pub mod secrets;
pub mod sql;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(test)]
mod tests;
