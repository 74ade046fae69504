use std::path::PathBuf;

use async_trait::async_trait;

use crate::protocol::VmPayload;

use super::{FilesystemId, Reservation, VmId, VmRole};

/// Everything a backend needs to boot one VM
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub vm_id: VmId,
    pub role: VmRole,
    pub reservation: Reservation,
    pub filesystem: FilesystemId,
    pub guest_cid: u32,
    /// Memory cap for the user program inside the guest, executors only
    pub user_memory_mb: Option<u32>,
}

/// A booted VM as seen by the backend that launched it
#[derive(Debug, Clone)]
pub struct VmInstance {
    pub vm_id: VmId,
    /// Hypervisor process, when the backend runs one per VM
    pub pid: Option<u32>,
    /// Host end of the guest control channel
    pub channel_path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("control channel broke: {0}")]
    Broken(#[from] std::io::Error),
    #[error("guest rejected the connection: {0}")]
    Handshake(String),
    #[error("guest closed the channel without a response")]
    NoOutput,
}

/// Trait for the hypervisor side of the VM pool
///
/// The launch manager owns scheduling and accounting; implementations only
/// boot, talk to and kill individual machines.
#[async_trait]
pub trait VmBackend: Send + Sync {
    /// Boots a VM on the leased filesystem. The caller bounds the wait.
    async fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<VmInstance>;

    /// Sends one payload over the control channel and returns the raw JSON reply
    async fn query(&self, vm: &VmInstance, payload: &VmPayload) -> Result<String, ChannelError>;

    /// Kills the VM; must tolerate a machine that already exited
    async fn terminate(&self, vm: &VmInstance) -> anyhow::Result<()>;
}
