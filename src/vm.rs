mod backend;
mod budget;
mod filesystem;
mod firecracker;
mod launch_manager;

// Re-export the seams and common types
pub use backend::{ChannelError, LaunchSpec, VmBackend, VmInstance};
pub use budget::ClusterBudget;
pub use filesystem::{
    FilesystemId, FilesystemLease, FilesystemPooler, FilesystemProvisioner, ImageCopyProvisioner,
    LeaseError, PoolerStats,
};
pub use firecracker::FirecrackerBackend;
pub use launch_manager::{ClusterSnapshot, VmHandle, VmLaunchManager, VmOutcome, VmSnapshot};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::JobId;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct VmId(pub Uuid);

impl VmId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for VmId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmRole {
    Compiler,
    Executor,
}

impl VmRole {
    pub const ALL: [VmRole; 2] = [VmRole::Compiler, VmRole::Executor];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compiler => "compiler",
            Self::Executor => "executor",
        }
    }
}

impl fmt::Display for VmRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// vCPU and memory a VM holds against the cluster budget
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct Reservation {
    pub vcpu: u32,
    pub memory_mb: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Provisioning,
    Idle,
    Busy,
    Terminating,
    Terminated,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    IdleTimeout,
    /// Executor VMs run a single user's code and are never handed on
    JobFinished,
    HealthCheckFailed,
    ClusterPressure,
    Orphaned,
    Error,
    Shutdown,
}

/// Audit record emitted once per VM teardown
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct VmTerminationEvent {
    pub vm_id: VmId,
    pub role: VmRole,
    pub reason: TerminationReason,
    pub terminated_at: DateTime<Utc>,
    pub affected_jobs: Vec<JobId>,
    pub lifetime_ms: u64,
}
