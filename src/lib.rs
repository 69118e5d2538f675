pub mod cli;
pub mod cluster;
pub mod config;
pub mod core;
pub mod errors;
pub mod utils;

// Re-exports
pub use cluster::{BootstrapState, SwarmBootstrap, SwarmCluster};
pub use config::Settings;
pub use core::{EngineApi, JoinSnapshot, Machine, MachineDriver, MachineSet, VirshDriver, VirshMachine};
pub use errors::{TestkitError, TestkitResult};
pub use utils::await_converge;
