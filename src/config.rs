pub mod settings;

pub use settings::{EngineSettings, ProvisionSettings, Settings, SshSettings, VirshSettings};
