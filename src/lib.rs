//! Runnergate - a gateway in front of a fleet of application runners
//!
//! This library provides an HTTP gateway that:
//! - Keeps a persisted registry of runners and their capacity
//! - Maps application names to the runner hosting them, rebuilt from the runners themselves
//! - Places new applications on the least-loaded runner, retrying elsewhere on failure
//! - Routes `/{app}/...` traffic to the hosting runner with the path rewritten
//! - Aggregates application listings and system info across the cluster

pub mod aggregate;
pub mod api;
pub mod client;
pub mod cluster;
pub mod config;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod placement;
pub mod pool;
pub mod router;
pub mod runner;
pub mod server;
pub mod sync;
pub mod telemetry;
