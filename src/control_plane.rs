//! The cluster capability the proxy consumes: reading and changing a
//! workload's replica counts.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Replica counts reported for a workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkloadStatus {
    /// Replicas currently requested (0 means asleep)
    pub desired_replicas: i32,
    /// Replicas currently serving traffic
    pub ready_replicas: i32,
}

impl WorkloadStatus {
    pub fn new(desired_replicas: i32, ready_replicas: i32) -> Self {
        Self {
            desired_replicas,
            ready_replicas,
        }
    }
}

/// Errors raised by a control plane
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("workload {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Reports and mutates workload replica counts
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn get_status(&self, namespace: &str, name: &str)
        -> Result<WorkloadStatus, ControlPlaneError>;

    async fn scale(&self, namespace: &str, name: &str, replicas: i32)
        -> Result<(), ControlPlaneError>;
}

pub type SharedControlPlane = Arc<dyn ControlPlane>;

/// A scale request recorded by [`InMemoryControlPlane`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleCall {
    pub namespace: String,
    pub name: String,
    pub replicas: i32,
}

#[derive(Debug, Default)]
struct MemoryState {
    workloads: HashMap<(String, String), WorkloadStatus>,
    failing: HashSet<(String, String)>,
    scale_calls: Vec<ScaleCall>,
}

/// Control plane kept entirely in memory.
///
/// Serves offline/demo mode and tests. When `instant_ready` is set, scaling
/// a workload also marks all of its replicas ready.
#[derive(Debug, Default)]
pub struct InMemoryControlPlane {
    state: Mutex<MemoryState>,
    instant_ready: bool,
}

impl InMemoryControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Workloads become ready as soon as they are scaled
    pub fn instant_ready() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            instant_ready: true,
        }
    }

    pub fn set_workload(&self, namespace: &str, name: &str, desired: i32, ready: i32) {
        self.state
            .lock()
            .workloads
            .insert(key(namespace, name), WorkloadStatus::new(desired, ready));
    }

    /// Make every call for this workload fail
    pub fn fail_workload(&self, namespace: &str, name: &str) {
        self.state.lock().failing.insert(key(namespace, name));
    }

    pub fn workload(&self, namespace: &str, name: &str) -> Option<WorkloadStatus> {
        self.state.lock().workloads.get(&key(namespace, name)).copied()
    }

    /// Every scale request received so far, in order
    pub fn scale_calls(&self) -> Vec<ScaleCall> {
        self.state.lock().scale_calls.clone()
    }

    /// Scale requests received for one workload
    pub fn scale_calls_for(&self, name: &str) -> Vec<ScaleCall> {
        self.state
            .lock()
            .scale_calls
            .iter()
            .filter(|c| c.name == name)
            .cloned()
            .collect()
    }
}

fn key(namespace: &str, name: &str) -> (String, String) {
    (namespace.to_string(), name.to_string())
}

#[async_trait]
impl ControlPlane for InMemoryControlPlane {
    async fn get_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<WorkloadStatus, ControlPlaneError> {
        let state = self.state.lock();
        let key = key(namespace, name);
        if state.failing.contains(&key) {
            return Err(ControlPlaneError::Transport(format!(
                "injected failure for {}/{}",
                namespace, name
            )));
        }
        state
            .workloads
            .get(&key)
            .copied()
            .ok_or_else(|| ControlPlaneError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn scale(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), ControlPlaneError> {
        let mut state = self.state.lock();
        state.scale_calls.push(ScaleCall {
            namespace: namespace.to_string(),
            name: name.to_string(),
            replicas,
        });

        let key = key(namespace, name);
        if state.failing.contains(&key) {
            return Err(ControlPlaneError::Transport(format!(
                "injected failure for {}/{}",
                namespace, name
            )));
        }

        let instant_ready = self.instant_ready;
        match state.workloads.get_mut(&key) {
            Some(status) => {
                status.desired_replicas = replicas;
                if instant_ready || replicas < status.ready_replicas {
                    status.ready_replicas = replicas;
                }
                Ok(())
            }
            None => Err(ControlPlaneError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_status_unknown_workload() {
        let cp = InMemoryControlPlane::new();
        let err = cp.get_status("default", "web").await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::NotFound { .. }));
        assert_eq!(err.to_string(), "workload default/web not found");
    }

    #[tokio::test]
    async fn test_scale_records_and_updates() {
        let cp = InMemoryControlPlane::new();
        cp.set_workload("default", "web", 2, 2);

        cp.scale("default", "web", 0).await.unwrap();

        assert_eq!(cp.workload("default", "web"), Some(WorkloadStatus::new(0, 0)));
        assert_eq!(
            cp.scale_calls(),
            vec![ScaleCall {
                namespace: "default".into(),
                name: "web".into(),
                replicas: 0
            }]
        );
    }

    #[tokio::test]
    async fn test_scale_up_is_not_ready_until_instant() {
        let cp = InMemoryControlPlane::new();
        cp.set_workload("default", "web", 0, 0);
        cp.scale("default", "web", 1).await.unwrap();
        assert_eq!(cp.workload("default", "web"), Some(WorkloadStatus::new(1, 0)));

        let demo = InMemoryControlPlane::instant_ready();
        demo.set_workload("default", "web", 0, 0);
        demo.scale("default", "web", 1).await.unwrap();
        assert_eq!(demo.workload("default", "web"), Some(WorkloadStatus::new(1, 1)));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let cp = InMemoryControlPlane::new();
        cp.set_workload("default", "web", 1, 1);
        cp.fail_workload("default", "web");

        assert!(cp.get_status("default", "web").await.is_err());
        assert!(cp.scale("default", "web", 0).await.is_err());
        // Failed calls are still recorded
        assert_eq!(cp.scale_calls_for("web").len(), 1);
    }
}
