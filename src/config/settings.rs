/*
* Testkit Configuration
* ---------------------
*
* Everything the machine drivers need to know about the host they run on.
* Loaded once at startup and handed to the driver and the orchestrator as a
* plain value, nothing below this module reads the environment on its own.
*
* Configuration Hierarchy (from lowest to highest priority):
* -----------------------------------------------------
* 1. Hardcoded defaults (`Settings::default()`)
* 2. <CONFIG_PATH>/default.{toml,yaml,json} (optional)
* 3. <CONFIG_PATH>/local.{toml,yaml,json} (optional)
* 4. TESTKIT_* environment variables, `__` between sections
*    (TESTKIT_VIRSH__DISK_DIR=/e2e)
* 5. The variables the old shell tooling used: VIRSH_DISK_DIR, VIRSH_OS and
*    PRESERVE_TEST_MACHINE
*
* Sections:
* --------
* - virsh: where base disks live, which OS image to clone, machine sizing
* - ssh: login user, key file name inside the disk dir, timeouts
* - engine: engine API port, TLS and how long to wait for it to answer
* - provision: name prefix, batch/start/kill deadlines, preserve flag
*/

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub virsh: VirshSettings,
    pub ssh: SshSettings,
    pub engine: EngineSettings,
    pub provision: ProvisionSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirshSettings {
    /// Holds the base images, the ssh key and the engine TLS material.
    pub disk_dir: PathBuf,
    pub os: String,
    pub cpus: u32,
    pub memory_mb: u64,
    pub network: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    pub user: String,
    pub key_file: String,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    pub port: u16,
    pub tls: bool,
    pub request_timeout_secs: u64,
    pub verify_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionSettings {
    pub name_prefix: String,
    pub batch_timeout_secs: u64,
    pub start_timeout_secs: u64,
    pub kill_timeout_secs: u64,
    /// Leave machines behind instead of removing them, for poking around
    /// after a failed run.
    pub preserve_machines: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            virsh: VirshSettings {
                disk_dir: PathBuf::new(),
                os: "ubuntu16.04".to_string(),
                cpus: 1,
                memory_mb: 2048,
                network: "default".to_string(),
            },
            ssh: SshSettings {
                user: "docker".to_string(),
                key_file: "id_rsa".to_string(),
                connect_timeout_secs: 8,
                command_timeout_secs: 300,
            },
            engine: EngineSettings {
                port: 2376,
                tls: true,
                request_timeout_secs: 120,
                verify_timeout_secs: 120,
            },
            provision: ProvisionSettings {
                name_prefix: "e2e".to_string(),
                batch_timeout_secs: 60 * 60,
                start_timeout_secs: 60,
                kill_timeout_secs: 60,
                preserve_machines: false,
            },
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string());
        Self::load(Path::new(&config_path))
    }

    pub fn new_from_file(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from file: {}", path.display());
        let builder = Self::builder()?.add_source(File::from(path));
        Self::with_environment(builder)?.build()?.try_deserialize()
    }

    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from path: {}", config_dir.display());
        let builder = Self::builder()?
            .add_source(File::from(config_dir.join("default")).required(false))
            .add_source(File::from(config_dir.join("local")).required(false));
        Self::with_environment(builder)?.build()?.try_deserialize()
    }

    fn builder() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        Ok(Config::builder().add_source(Config::try_from(&Settings::default())?))
    }

    fn with_environment(
        builder: ConfigBuilder<DefaultState>,
    ) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        let preserve = std::env::var("PRESERVE_TEST_MACHINE")
            .ok()
            .filter(|v| !v.is_empty())
            .map(|_| true);

        builder
            .add_source(
                Environment::with_prefix("TESTKIT")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .set_override_option("virsh.disk_dir", std::env::var("VIRSH_DISK_DIR").ok())?
            .set_override_option("virsh.os", std::env::var("VIRSH_OS").ok().filter(|v| !v.is_empty()))?
            .set_override_option("provision.preserve_machines", preserve)
    }

    pub fn base_disk(&self) -> PathBuf {
        self.virsh.disk_dir.join(format!("{}.qcow2", self.virsh.os))
    }

    pub fn ssh_key_path(&self) -> PathBuf {
        self.virsh.disk_dir.join(&self.ssh.key_file)
    }

    /// Directory with key.pem/cert.pem/ca.pem, or `None` for a plain
    /// text engine endpoint.
    pub fn tls_dir(&self) -> Option<&Path> {
        self.engine.tls.then_some(self.virsh.disk_dir.as_path())
    }
}

impl SshSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl EngineSettings {
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }
}

impl ProvisionSettings {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    // process environment is shared by every test thread
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_KEYS: [&str; 5] = [
        "TESTKIT_VIRSH__NETWORK",
        "TESTKIT_SSH__USER",
        "VIRSH_DISK_DIR",
        "VIRSH_OS",
        "PRESERVE_TEST_MACHINE",
    ];

    /// Unsets the variables a test exported, however the test exits.
    struct EnvGuard;

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for key in ENV_KEYS {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn test_defaults_match_legacy_tooling() {
        let settings = Settings::default();
        assert_eq!(settings.virsh.os, "ubuntu16.04");
        assert_eq!(settings.virsh.cpus, 1);
        assert_eq!(settings.virsh.memory_mb, 2048);
        assert_eq!(settings.ssh.user, "docker");
        assert_eq!(settings.ssh.connect_timeout(), Duration::from_secs(8));
        assert_eq!(settings.provision.batch_timeout(), Duration::from_secs(3600));
        assert_eq!(settings.provision.start_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_derived_paths() {
        let mut settings = Settings::default();
        settings.virsh.disk_dir = PathBuf::from("/e2e");
        assert_eq!(settings.base_disk(), PathBuf::from("/e2e/ubuntu16.04.qcow2"));
        assert_eq!(settings.ssh_key_path(), PathBuf::from("/e2e/id_rsa"));
        assert_eq!(settings.tls_dir(), Some(Path::new("/e2e")));

        settings.engine.tls = false;
        assert_eq!(settings.tls_dir(), None);
    }

    #[test]
    fn test_load_layers_file_over_defaults() -> anyhow::Result<()> {
        let _env = ENV_LOCK.lock();
        let dir = tempfile::tempdir()?;
        std::fs::write(
            dir.path().join("default.toml"),
            "[virsh]\ncpus = 4\nmemory_mb = 8192\n\n[provision]\nname_prefix = \"ci\"\n",
        )?;

        let settings = Settings::load(dir.path())?;
        assert_eq!(settings.virsh.cpus, 4);
        assert_eq!(settings.virsh.memory_mb, 8192);
        assert_eq!(settings.provision.name_prefix, "ci");
        // untouched keys keep their defaults
        assert_eq!(settings.ssh.key_file, "id_rsa");
        assert_eq!(settings.engine.port, 2376);
        Ok(())
    }

    #[test]
    fn test_load_without_files_uses_defaults() -> anyhow::Result<()> {
        let _env = ENV_LOCK.lock();
        let dir = tempfile::tempdir()?;
        let settings = Settings::load(dir.path())?;
        assert_eq!(settings.ssh.command_timeout_secs, 300);
        assert_eq!(settings.provision.kill_timeout_secs, 60);
        Ok(())
    }

    #[test]
    fn test_environment_overrides_files() -> anyhow::Result<()> {
        let _env = ENV_LOCK.lock();
        let _cleanup = EnvGuard;
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("default.toml"), "[ssh]\nuser = \"ubuntu\"\n")?;

        std::env::set_var("TESTKIT_VIRSH__NETWORK", "e2e-net");
        std::env::set_var("TESTKIT_SSH__USER", "ci");
        std::env::set_var("VIRSH_DISK_DIR", "/var/lib/e2e");
        // empty legacy values are the same as unset
        std::env::set_var("VIRSH_OS", "");
        std::env::set_var("PRESERVE_TEST_MACHINE", "");
        let settings = Settings::load(dir.path())?;
        assert_eq!(settings.virsh.network, "e2e-net");
        assert_eq!(settings.ssh.user, "ci");
        assert_eq!(settings.virsh.disk_dir, PathBuf::from("/var/lib/e2e"));
        assert_eq!(settings.virsh.os, "ubuntu16.04");
        assert!(!settings.provision.preserve_machines);

        std::env::set_var("VIRSH_OS", "centos7");
        std::env::set_var("PRESERVE_TEST_MACHINE", "1");
        let settings = Settings::load(dir.path())?;
        assert_eq!(settings.virsh.os, "centos7");
        assert_eq!(settings.base_disk(), PathBuf::from("/var/lib/e2e/centos7.qcow2"));
        assert!(settings.provision.preserve_machines);
        Ok(())
    }
}
