//! Core library for the OpenStack CNI plugin and daemon
//!
//! This crate provides the core functionality for:
//! - Neutron port setup and teardown against the OpenStack APIs
//! - A read-through TTL cache in front of the cloud client
//! - CNI command handling and the daemon's HTTP API
//! - Background reaping of orphaned ports
//! - Moving the attached interface into the container's network namespace
//! - Health checks and observability

pub mod cni;
pub mod health;
pub mod models;
pub mod networking;
pub mod observability;
pub mod openstack;
pub mod server;
pub mod state;
pub mod util;

pub use cni::{CniResult, ErrorResult, VersionResult};
pub use health::{HealthChecker, HealthResponse};
pub use models::*;
pub use observability::{Metrics, StructuredLogger};
