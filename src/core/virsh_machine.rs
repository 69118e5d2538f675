use async_trait::async_trait;
use parking_lot::RwLock;
use std::io::Write;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::core::command::{CommandRunner, SystemRunner};
use crate::core::docker_manager::{verify_engine, DockerEngine, EngineApi};
use crate::core::libvirt::{DomainTemplate, Virsh};
use crate::core::ssh::SshTarget;
use crate::core::vm::{Machine, MachineDriver, MachineSpec, MachineState};
use crate::errors::{TestkitError, TestkitResult};
use crate::utils::await_converge;

/// A libvirt domain backed by a linked clone of the base image.
pub struct VirshMachine {
    spec: MachineSpec,
    // cleared on removal so a stale handle can't touch a recycled name
    name: RwLock<String>,
    address: RwLock<Option<Ipv4Addr>>,
    state: RwLock<MachineState>,
    virsh: Virsh,
    runner: Arc<dyn CommandRunner>,
    settings: Arc<Settings>,
}

impl VirshMachine {
    fn with_state(
        spec: MachineSpec,
        runner: Arc<dyn CommandRunner>,
        settings: Arc<Settings>,
        state: MachineState,
    ) -> Self {
        Self {
            name: RwLock::new(spec.name.clone()),
            address: RwLock::new(None),
            state: RwLock::new(state),
            virsh: Virsh::new(runner.clone()),
            spec,
            runner,
            settings,
        }
    }

    pub fn spec(&self) -> &MachineSpec {
        &self.spec
    }

    pub fn state(&self) -> MachineState {
        *self.state.read()
    }

    fn set_state(&self, state: MachineState) {
        debug!(machine = %self.spec.name, %state, "state change");
        *self.state.write() = state;
    }

    fn tombstone(&self) {
        self.name.write().clear();
        self.set_state(MachineState::Removed);
    }

    fn shell(&self) -> TestkitResult<SshTarget> {
        let ip = self.address.read().ok_or_else(|| TestkitError::NotReady(self.name()))?;
        Ok(SshTarget::new(
            self.runner.clone(),
            self.spec.ssh_user.clone(),
            ip.to_string(),
            self.spec.ssh_key.clone(),
        )
        .with_timeouts(
            self.settings.ssh.connect_timeout(),
            self.settings.ssh.command_timeout(),
        ))
    }

    pub async fn clone_disk(&self) -> TestkitResult<()> {
        self.virsh.clone_disk(&self.spec.base_disk, &self.spec.disk_path).await?;
        self.set_state(MachineState::DiskCloned);
        Ok(())
    }

    pub async fn define(&self) -> TestkitResult<()> {
        let scratch = self
            .spec
            .disk_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(std::env::temp_dir);
        let domain = DomainTemplate {
            name: &self.spec.name,
            memory_mb: self.spec.memory_mb,
            vcpus: self.spec.cpus,
            disk_path: &self.spec.disk_path,
            network: &self.spec.network,
        };
        self.virsh.define(&domain, &scratch).await?;
        self.set_state(MachineState::Defined);
        Ok(())
    }

    async fn await_reachable(
        &self,
        name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> TestkitResult<()> {
        let deadline = Instant::now() + timeout;

        debug!("Waiting for IP to appear for {}", name);
        let virsh = &self.virsh;
        let address = &self.address;
        await_converge(cancel, timeout, Duration::from_secs(1), || async move {
            match virsh.domain_ipv4(name).await? {
                Some(ip) => {
                    *address.write() = Some(ip);
                    Ok(())
                }
                None => Err(TestkitError::NotReady(name.to_string())),
            }
        })
        .await?;
        self.set_state(MachineState::NetworkReady);
        debug!("Machine {} has IP {}", name, self.ip().unwrap_or_default());

        let remaining = deadline.saturating_duration_since(Instant::now());
        await_converge(cancel, remaining, Duration::from_millis(500), || async move {
            let uptime = self.ssh("uptime").await?;
            debug!("{} has been up {}", name, uptime);
            Ok::<(), TestkitError>(())
        })
        .await?;
        self.set_state(MachineState::SshReady);
        Ok(())
    }

    fn start_timeout_error(&self, err: TestkitError, timeout: Duration) -> TestkitError {
        match err {
            TestkitError::NotConverged { last_error, .. } => TestkitError::Timeout(format!(
                "Unable to bring up {} within {:?}: {}",
                self.spec.name, timeout, last_error
            )),
            other => other,
        }
    }
}

#[async_trait]
impl Machine for VirshMachine {
    fn name(&self) -> String {
        self.name.read().clone()
    }

    fn docker_host(&self) -> Option<String> {
        self.address
            .read()
            .map(|ip| format!("tcp://{}:{}", ip, self.settings.engine.port))
    }

    fn ip(&self) -> Option<String> {
        self.address.read().map(|ip| ip.to_string())
    }

    // domains sit on one libvirt network, so both addresses are the same
    fn internal_ip(&self) -> Option<String> {
        self.ip()
    }

    fn engine(&self) -> TestkitResult<Arc<dyn EngineApi>> {
        let host = self.docker_host().ok_or_else(|| TestkitError::NotReady(self.name()))?;
        let engine = DockerEngine::connect(
            &host,
            self.settings.tls_dir(),
            Duration::from_secs(self.settings.engine.request_timeout_secs),
        )?;
        Ok(Arc::new(engine))
    }

    fn connection_env(&self) -> String {
        let Some(host) = self.docker_host() else {
            return format!("# {} has no address yet", self.spec.name);
        };
        let mut env = format!("# {}\nexport DOCKER_HOST={}", self.spec.name, host);
        if let Some(dir) = self.settings.tls_dir() {
            env.push_str(&format!(
                "\nexport DOCKER_TLS_VERIFY=1\nexport DOCKER_CERT_PATH={}",
                dir.display()
            ));
        }
        env
    }

    async fn is_running(&self) -> bool {
        let name = self.name();
        !name.is_empty() && self.virsh.is_active(&name).await
    }

    /// Powers the domain on and waits for it to be reachable: first an IPv4
    /// lease (libvirt has no event for this, so it is polled), then a
    /// working ssh login. Both phases share one deadline, which also cuts
    /// short a login attempt that hangs. On expiry the domain is left
    /// running; cleaning up is the caller's call.
    async fn start(&self, cancel: &CancellationToken) -> TestkitResult<()> {
        let name = self.name();
        self.virsh.start(&name).await?;
        self.set_state(MachineState::Started);

        let timeout = self.settings.provision.start_timeout();
        match tokio::time::timeout(timeout, self.await_reachable(&name, timeout, cancel)).await {
            Ok(result) => result.map_err(|e| self.start_timeout_error(e, timeout)),
            Err(_) => Err(TestkitError::Timeout(format!(
                "Unable to bring up {} within {:?}",
                name, timeout
            ))),
        }
    }

    async fn stop(&self) -> TestkitResult<()> {
        let name = self.name();
        if let Err(e) = self.virsh.shutdown(&name).await {
            error!("{}", e);
            return Err(e);
        }
        self.set_state(MachineState::Stopped);
        Ok(())
    }

    /// `virsh destroy` returns before the domain is actually gone, so this
    /// polls the active list until it drops out.
    async fn kill(&self) -> TestkitResult<()> {
        let name = self.name();
        if let Err(e) = self.virsh.destroy(&name).await {
            error!("{}", e);
            return Err(e);
        }

        let timeout = self.settings.provision.kill_timeout();
        let virsh = &self.virsh;
        let domain = name.as_str();
        await_converge(
            &CancellationToken::new(),
            timeout,
            Duration::from_millis(500),
            || async move {
                if virsh.is_active(domain).await {
                    Err(format!("{} is still running", domain))
                } else {
                    Ok(())
                }
            },
        )
        .await
        .map_err(|e| match e {
            TestkitError::NotConverged { .. } => {
                TestkitError::Timeout(format!("Unable to verify {} stopped within {:?}", name, timeout))
            }
            other => other,
        })?;
        self.set_state(MachineState::Stopped);
        Ok(())
    }

    async fn remove(&self) -> TestkitResult<()> {
        let name = self.name();
        if self.settings.provision.preserve_machines {
            info!("Skipping removal of machine {} with PRESERVE_TEST_MACHINE set", name);
            return Ok(());
        }
        if name.is_empty() {
            debug!(disk = %self.spec.disk_path.display(), "machine already removed");
            return Ok(());
        }

        let state = self.state();
        match state {
            // the name may well belong to someone else's domain and disk
            MachineState::Created => {
                debug!(machine = %name, "nothing was created, dropping handle");
                self.tombstone();
                return Ok(());
            }
            // our clone, but no domain was ever registered
            MachineState::DiskCloned => {
                if let Err(e) = tokio::fs::remove_file(&self.spec.disk_path).await {
                    warn!(machine = %name, error = %e, "Failed to delete disk");
                }
                info!("Machine {} deleted", name);
                self.tombstone();
                return Ok(());
            }
            _ => {}
        }

        if self.is_running().await {
            if let Err(e) = self.kill().await {
                warn!(machine = %name, error = %e, "kill before removal failed");
            }
        }

        let undefined = self.virsh.undefine(&name, Some(&self.spec.disk_path)).await;
        if undefined.is_ok() || state != MachineState::Adopted {
            // If the disk still exists, nuke it, but ignore errors
            let _ = tokio::fs::remove_file(&self.spec.disk_path).await;
        }
        if let Err(e) = undefined {
            error!(machine = %name, error = %e, "undefine failed");
            return Err(e);
        }

        info!("Machine {} deleted", name);
        self.tombstone();
        Ok(())
    }

    async fn remove_preserve_disk(&self) -> TestkitResult<()> {
        let name = self.name();
        if self.settings.provision.preserve_machines {
            info!("Skipping removal of machine {} with PRESERVE_TEST_MACHINE set", name);
            return Ok(());
        }
        if name.is_empty() {
            debug!(disk = %self.spec.disk_path.display(), "machine already removed");
            return Ok(());
        }
        if matches!(self.state(), MachineState::Created | MachineState::DiskCloned) {
            debug!(machine = %name, "no domain was registered, dropping handle");
            self.tombstone();
            return Ok(());
        }
        if self.is_running().await {
            if let Err(e) = self.stop().await {
                warn!(machine = %name, error = %e, "shutdown before removal failed");
            }
        }

        if let Err(e) = self.virsh.undefine(&name, None).await {
            error!(machine = %name, error = %e, "undefine failed");
            return Err(e);
        }

        info!("Preserving {}", self.spec.disk_path.display());
        info!("Machine {} deleted", name);
        self.tombstone();
        Ok(())
    }

    async fn ssh(&self, command: &str) -> TestkitResult<String> {
        debug!("SSH to {}: {}", self.spec.name, command);
        self.shell()?.run(command).await
    }

    /// Lands `data` at `remote_path` with 0600 permissions.
    async fn write_file(&self, remote_path: &str, data: &[u8]) -> TestkitResult<()> {
        let shell = self.shell()?;
        let mut local = tempfile::Builder::new().prefix("E2ETestTempFile").tempfile()?;
        local.write_all(data)?;
        local.flush()?;
        shell.copy_to(local.path(), remote_path).await
    }

    async fn cat_host_file(&self, remote_path: &str) -> TestkitResult<String> {
        self.ssh(&format!("cat {}", remote_path)).await
    }
}

/// Builds machines out of linked clones of `<disk_dir>/<os>.qcow2`.
pub struct VirshDriver {
    settings: Arc<Settings>,
    runner: Arc<dyn CommandRunner>,
}

impl VirshDriver {
    pub fn new(settings: Settings) -> Self {
        Self::with_runner(settings, Arc::new(SystemRunner))
    }

    pub fn with_runner(settings: Settings, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            settings: Arc::new(settings),
            runner,
        }
    }

    pub fn spec_for(&self, name: &str) -> MachineSpec {
        let base_disk = self.settings.base_disk();
        let disk_dir = base_disk
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| self.settings.virsh.disk_dir.clone());
        MachineSpec {
            name: name.to_string(),
            disk_path: disk_dir.join(format!("{}.qcow2", name)),
            base_disk,
            cpus: self.settings.virsh.cpus,
            memory_mb: self.settings.virsh.memory_mb,
            network: self.settings.virsh.network.clone(),
            ssh_user: self.settings.ssh.user.clone(),
            ssh_key: self.settings.ssh_key_path(),
        }
    }

    /// Handle for a machine a previous run left behind, e.g. for removal.
    pub fn existing(&self, name: &str) -> VirshMachine {
        VirshMachine::with_state(
            self.spec_for(name),
            self.runner.clone(),
            self.settings.clone(),
            MachineState::Adopted,
        )
    }
}

#[async_trait]
impl MachineDriver for VirshDriver {
    type Machine = VirshMachine;

    fn preflight(&self) -> TestkitResult<()> {
        let disk_dir = &self.settings.virsh.disk_dir;
        if disk_dir.as_os_str().is_empty() {
            return Err(TestkitError::Precondition(
                "To use the virsh driver, you must set VIRSH_DISK_DIR to point to where your base OS disks and ssh key live"
                    .to_string(),
            ));
        }

        let mut required = vec![self.settings.base_disk(), self.settings.ssh_key_path()];
        if let Some(dir) = self.settings.tls_dir() {
            required.extend(["key.pem", "cert.pem", "ca.pem"].iter().map(|f| dir.join(f)));
        }
        for path in required {
            if !path.exists() {
                return Err(TestkitError::Precondition(format!("Unable to locate {}", path.display())));
            }
        }
        Ok(())
    }

    fn new_machine(&self, name: &str) -> TestkitResult<VirshMachine> {
        Ok(VirshMachine::with_state(
            self.spec_for(name),
            self.runner.clone(),
            self.settings.clone(),
            MachineState::Created,
        ))
    }

    async fn provision(&self, machine: &VirshMachine, cancel: &CancellationToken) -> TestkitResult<()> {
        machine.clone_disk().await?;
        machine.define().await?;
        machine.start(cancel).await
    }

    async fn prepare(&self, machine: Arc<VirshMachine>, cancel: &CancellationToken) -> TestkitResult<()> {
        let name = machine.name();
        let set_hostname = format!(
            r#"sudo hostname "{name}"; sudo sed -e 's/.*/{name}/' -i /etc/hostname"#,
            name = name
        );
        if let Err(e) = machine.ssh(&set_hostname).await {
            warn!("Failed to set hostname to {}: {}", name, e);
        }

        let engine = machine.engine()?;
        verify_engine(&engine, &name, self.settings.engine.verify_timeout(), cancel).await?;
        machine.set_state(MachineState::EngineVerified);
        Ok(())
    }
}
