use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::core::docker_manager::EngineApi;
use crate::errors::TestkitResult;

/// Everything needed to build a machine handle before the host is touched.
#[derive(Debug, Clone)]
pub struct MachineSpec {
    pub name: String,
    pub base_disk: PathBuf,
    pub disk_path: PathBuf,
    pub cpus: u32,
    pub memory_mb: u64,
    pub network: String,
    pub ssh_user: String,
    pub ssh_key: PathBuf,
}

/// Where a machine is in its life. Only ever moves forward, except for
/// `Stopped` which a fresh `start` leaves again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    /// Handle only, nothing on the host belongs to it yet.
    Created,
    /// Handle for a domain some earlier run created, picked up by name.
    Adopted,
    DiskCloned,
    Defined,
    Started,
    NetworkReady,
    SshReady,
    EngineVerified,
    Stopped,
    Removed,
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MachineState::Created => "created",
            MachineState::Adopted => "adopted",
            MachineState::DiskCloned => "disk-cloned",
            MachineState::Defined => "domain-defined",
            MachineState::Started => "started",
            MachineState::NetworkReady => "network-ready",
            MachineState::SshReady => "ssh-ready",
            MachineState::EngineVerified => "engine-verified",
            MachineState::Stopped => "stopped",
            MachineState::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// The capability set every test machine offers, whichever driver made it.
#[async_trait]
pub trait Machine: Send + Sync + 'static {
    /// Empty once the machine has been removed.
    fn name(&self) -> String;

    /// `tcp://<ip>:<port>` of the engine, once the machine has an address.
    fn docker_host(&self) -> Option<String>;

    fn ip(&self) -> Option<String>;

    /// Address other machines should use, e.g. for swarm joins.
    fn internal_ip(&self) -> Option<String>;

    fn engine(&self) -> TestkitResult<Arc<dyn EngineApi>>;

    /// Shell snippet pointing a docker client at this machine.
    fn connection_env(&self) -> String;

    async fn is_running(&self) -> bool;

    async fn start(&self, cancel: &CancellationToken) -> TestkitResult<()>;

    /// Graceful shutdown.
    async fn stop(&self) -> TestkitResult<()>;

    /// Forced power off; may corrupt the disk, don't start it again after.
    async fn kill(&self) -> TestkitResult<()>;

    async fn remove(&self) -> TestkitResult<()>;

    async fn remove_preserve_disk(&self) -> TestkitResult<()>;

    async fn ssh(&self, command: &str) -> TestkitResult<String>;

    async fn write_file(&self, remote_path: &str, data: &[u8]) -> TestkitResult<()>;

    async fn cat_host_file(&self, remote_path: &str) -> TestkitResult<String>;
}

/// Driver specific steps of building a batch.
///
/// `provision` mutates shared hypervisor state and is only ever called for
/// one machine at a time. `prepare` is independent per machine and runs
/// concurrently across the batch.
#[async_trait]
pub trait MachineDriver: Send + Sync + 'static {
    type Machine: Machine;

    /// Fail fast checks, run before anything is created.
    fn preflight(&self) -> TestkitResult<()>;

    /// Builds the handle; touches nothing on the host.
    fn new_machine(&self, name: &str) -> TestkitResult<Self::Machine>;

    async fn provision(&self, machine: &Self::Machine, cancel: &CancellationToken) -> TestkitResult<()>;

    async fn prepare(&self, machine: Arc<Self::Machine>, cancel: &CancellationToken) -> TestkitResult<()>;
}
