pub mod command;
pub mod docker_manager;
pub mod libvirt;
pub mod machine_set;
pub mod ssh;
pub mod virsh_machine;
pub mod vm;

// exports for lazy devs like us
pub use command::{CommandOutput, CommandRunner, SystemRunner};
pub use docker_manager::{DockerEngine, EngineApi, JoinSnapshot};
pub use machine_set::MachineSet;
pub use virsh_machine::{VirshDriver, VirshMachine};
pub use vm::{Machine, MachineDriver, MachineSpec, MachineState};
