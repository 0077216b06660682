//! Wakegate - A scale-to-zero reverse proxy for Kubernetes workloads
//!
//! This library provides a reverse proxy that:
//! - Routes HTTP traffic by host and longest path prefix to in-cluster services
//! - Wakes sleeping deployments (and their dependencies) when traffic arrives
//! - Serves a self-refreshing waiting page until every workload is ready
//! - Scales idle deployments back to zero after a per-route timeout
//! - Talks to the cluster through a pluggable control plane capability

pub mod admin;
pub mod config;
pub mod control_plane;
pub mod error;
pub mod kube;
pub mod matcher;
pub mod pool;
pub mod proxy;
pub mod readiness;
pub mod reaper;
pub mod registry;
pub mod route;
pub mod stats;
pub mod waiting;
