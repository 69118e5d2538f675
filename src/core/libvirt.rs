use regex::Regex;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info};

use crate::core::command::{render_command, CommandRunner};
use crate::errors::{TestkitError, TestkitResult};

// `virsh -q list` rows look like ` 3     e2e-1A2B3C-0   running`
static ACTIVE_DOMAIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+(\S+)\s+running").expect("static regex"));

// `virsh -q domifaddr` rows look like
// ` vnet0  52:54:00:6b:3c:58  ipv4  192.168.122.45/24`
static IPV4_ADDR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ipv4\s+([^/\s]+)").expect("static regex"));

/// Names of running domains in `virsh -q list` output.
pub fn parse_active_domains(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter_map(|line| ACTIVE_DOMAIN.captures(line))
        .map(|caps| caps[1].to_string())
        .collect()
}

/// First IPv4 lease in `virsh -q domifaddr` output, if there is one yet.
pub fn parse_domifaddr(output: &str) -> Option<Ipv4Addr> {
    output
        .lines()
        .filter_map(|line| IPV4_ADDR.captures(line))
        .find_map(|caps| caps[1].parse().ok())
}

/// The bits of a domain that vary per machine.
#[derive(Debug, Clone)]
pub struct DomainTemplate<'a> {
    pub name: &'a str,
    pub memory_mb: u64,
    pub vcpus: u32,
    pub disk_path: &'a Path,
    pub network: &'a str,
}

impl DomainTemplate<'_> {
    pub fn render(&self) -> String {
        format!(
            r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='M'>{memory}</memory>
  <vcpu>{vcpus}</vcpu>
  <features><acpi/><apic/><pae/></features>
  <cpu mode='host-passthrough'></cpu>
  <os>
    <type>hvm</type>
    <boot dev='hd'/>
    <bootmenu enable='no'/>
  </os>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2' cache='unsafe' io='threads'/>
      <source file='{disk}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <graphics type='vnc' autoport='yes' listen='127.0.0.1'>
      <listen type='address' address='127.0.0.1'/>
    </graphics>
    <interface type='network'>
      <source network='{network}'/>
      <model type='virtio'/>
    </interface>
  </devices>
</domain>
"#,
            name = self.name,
            memory = self.memory_mb,
            vcpus = self.vcpus,
            disk = self.disk_path.display(),
            network = self.network,
        )
    }
}

/// Thin async wrapper over the `virsh` and `qemu-img` CLIs. Every call is a
/// single subprocess; a non-zero exit is returned as an error with the raw
/// output and never retried here.
#[derive(Clone)]
pub struct Virsh {
    runner: Arc<dyn CommandRunner>,
}

impl Virsh {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn exec(&self, program: &str, args: &[&str]) -> TestkitResult<String> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let command = render_command(program, &args);
        self.runner
            .run(program, &args)
            .await?
            .into_hypervisor_result(command)
    }

    /// Running domain names. A failing `virsh list` is logged and treated as
    /// "nothing running".
    pub async fn active_domains(&self) -> Vec<String> {
        match self.exec("virsh", &["-q", "list"]).await {
            Ok(out) => parse_active_domains(&out),
            Err(e) => {
                info!("Failed to get list - assuming no VMs: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn is_active(&self, name: &str) -> bool {
        self.active_domains().await.iter().any(|d| d == name)
    }

    /// Copy-on-write clone of `base` at `target`. Refuses to clobber an
    /// existing clone.
    pub async fn clone_disk(&self, base: &Path, target: &Path) -> TestkitResult<()> {
        if tokio::fs::try_exists(target).await? {
            return Err(TestkitError::Precondition(format!(
                "Linked clone {} of base disk {} already exists",
                target.display(),
                base.display()
            )));
        }
        debug!("Creating linked clone {} with base disk {}", target.display(), base.display());
        let base = base.display().to_string();
        let target = target.display().to_string();
        let out = self
            .exec(
                "qemu-img",
                &["create", "-f", "qcow2", "-o", "backing_fmt=qcow2", "-b", &base, &target],
            )
            .await?;
        debug!("{}", out);
        Ok(())
    }

    /// Registers the domain. The rendered descriptor lives in `scratch_dir`
    /// only for the duration of the `virsh define` call.
    pub async fn define(&self, domain: &DomainTemplate<'_>, scratch_dir: &Path) -> TestkitResult<()> {
        debug!("Creating vm {}", domain.name);
        let mut descriptor = tempfile::Builder::new()
            .prefix(domain.name)
            .suffix(".xml")
            .tempfile_in(scratch_dir)?;
        descriptor.write_all(domain.render().as_bytes())?;
        descriptor.flush()?;

        let path = descriptor.path().display().to_string();
        self.exec("virsh", &["define", &path]).await?;
        Ok(())
    }

    pub async fn start(&self, name: &str) -> TestkitResult<()> {
        self.exec("virsh", &["start", name]).await.map(drop)
    }

    pub async fn shutdown(&self, name: &str) -> TestkitResult<()> {
        self.exec("virsh", &["shutdown", name]).await.map(drop)
    }

    pub async fn destroy(&self, name: &str) -> TestkitResult<()> {
        self.exec("virsh", &["destroy", name]).await.map(drop)
    }

    /// Unregisters the domain, taking `storage` with it when given.
    pub async fn undefine(&self, name: &str, storage: Option<&Path>) -> TestkitResult<()> {
        let result = match storage {
            Some(disk) => {
                let disk = disk.display().to_string();
                self.exec("virsh", &["undefine", "--storage", &disk, name]).await
            }
            None => self.exec("virsh", &["undefine", name]).await,
        };
        result.map(drop)
    }

    /// The domain's IPv4 lease, `None` while DHCP has not handed one out.
    pub async fn domain_ipv4(&self, name: &str) -> TestkitResult<Option<Ipv4Addr>> {
        let out = self.exec("virsh", &["-q", "domifaddr", name]).await?;
        let ip = parse_domifaddr(&out);
        if ip.is_none() && !out.is_empty() {
            debug!(machine = name, output = %out, "no usable ipv4 in domifaddr output");
        }
        Ok(ip)
    }
}
