#![allow(dead_code)]

use async_trait::async_trait;
use e2e_testkit::core::docker_manager::verify_engine;
use e2e_testkit::errors::{TestkitError, TestkitResult};
use e2e_testkit::{EngineApi, JoinSnapshot, Machine, MachineDriver};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub type CallLog = Arc<Mutex<Vec<String>>>;

pub const MANAGER_ADDR: &str = "10.0.0.1:2377";

/// Engine stand-in that writes every swarm call into a shared log.
#[derive(Default)]
pub struct FakeEngine {
    pub machine: String,
    pub log: CallLog,
    pub never_ready: bool,
    pub fail_join: bool,
    pub join_delay: Duration,
    /// `ready_nodes` climbs by one per call until it reaches this.
    pub reported_nodes: usize,
    snapshots: AtomicUsize,
    ready_calls: AtomicUsize,
}

impl FakeEngine {
    pub fn new(machine: &str, log: &CallLog) -> Self {
        Self {
            machine: machine.to_string(),
            log: log.clone(),
            ..Default::default()
        }
    }

    pub fn snapshots_taken(&self) -> usize {
        self.snapshots.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineApi for FakeEngine {
    async fn verify(&self) -> TestkitResult<String> {
        if self.never_ready {
            return Err(TestkitError::EngineState("connection refused".to_string()));
        }
        Ok("24.0.7".to_string())
    }

    async fn init_swarm(&self, listen_addr: &str, advertise_addr: &str) -> TestkitResult<()> {
        self.log
            .lock()
            .push(format!("init {} {} {}", self.machine, listen_addr, advertise_addr));
        Ok(())
    }

    async fn join_snapshot(&self) -> TestkitResult<JoinSnapshot> {
        let n = self.snapshots.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.lock().push(format!("snapshot {}", self.machine));
        Ok(JoinSnapshot {
            worker_token: format!("SWMTKN-{}-{}", self.machine, n),
            remote_manager: MANAGER_ADDR.to_string(),
        })
    }

    async fn join_swarm(&self, listen_addr: &str, snapshot: &JoinSnapshot) -> TestkitResult<()> {
        tokio::time::sleep(self.join_delay).await;
        if self.fail_join {
            self.log.lock().push(format!("join-failed {}", self.machine));
            return Err(TestkitError::Engine(
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 503,
                    message: "rpc error: code = Unavailable".to_string(),
                },
            ));
        }
        self.log.lock().push(format!(
            "join {} {} {}@{}",
            self.machine, listen_addr, snapshot.worker_token, snapshot.remote_manager
        ));
        Ok(())
    }

    async fn ready_nodes(&self) -> TestkitResult<usize> {
        let n = self.ready_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(n.min(self.reported_nodes))
    }
}

pub struct FakeMachine {
    name: RwLock<String>,
    ip: String,
    pub engine: Arc<FakeEngine>,
    pub removes: Arc<AtomicUsize>,
}

impl FakeMachine {
    pub fn new(name: &str, index: usize, engine: FakeEngine) -> Self {
        Self {
            name: RwLock::new(name.to_string()),
            ip: format!("10.0.0.{}", index + 1),
            engine: Arc::new(engine),
            removes: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Machine for FakeMachine {
    fn name(&self) -> String {
        self.name.read().clone()
    }

    fn docker_host(&self) -> Option<String> {
        Some(format!("tcp://{}:2376", self.ip))
    }

    fn ip(&self) -> Option<String> {
        Some(self.ip.clone())
    }

    fn internal_ip(&self) -> Option<String> {
        Some(self.ip.clone())
    }

    fn engine(&self) -> TestkitResult<Arc<dyn EngineApi>> {
        let engine: Arc<dyn EngineApi> = self.engine.clone();
        Ok(engine)
    }

    fn connection_env(&self) -> String {
        format!("export DOCKER_HOST=tcp://{}:2376", self.ip)
    }

    async fn is_running(&self) -> bool {
        !self.name.read().is_empty()
    }

    async fn start(&self, _cancel: &CancellationToken) -> TestkitResult<()> {
        Ok(())
    }

    async fn stop(&self) -> TestkitResult<()> {
        Ok(())
    }

    async fn kill(&self) -> TestkitResult<()> {
        Ok(())
    }

    async fn remove(&self) -> TestkitResult<()> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.name.write().clear();
        Ok(())
    }

    async fn remove_preserve_disk(&self) -> TestkitResult<()> {
        self.remove().await
    }

    async fn ssh(&self, _command: &str) -> TestkitResult<String> {
        Ok(String::new())
    }

    async fn write_file(&self, _remote_path: &str, _data: &[u8]) -> TestkitResult<()> {
        Ok(())
    }

    async fn cat_host_file(&self, _remote_path: &str) -> TestkitResult<String> {
        Ok(String::new())
    }
}

/// Driver whose misbehaviour is picked per machine index.
#[derive(Default)]
pub struct FakeDriver {
    pub log: CallLog,
    pub fail_preflight: bool,
    pub fail_provision_at: Option<usize>,
    pub never_ready_at: Option<usize>,
    pub prepare_delay: Duration,
    pub verify_timeout: Duration,
    /// Every machine handed out, with its removal counter.
    pub registry: Mutex<Vec<(String, Arc<AtomicUsize>)>>,
}

impl FakeDriver {
    pub fn created(&self) -> Vec<String> {
        self.registry.lock().iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn removes(&self) -> Vec<usize> {
        self.registry
            .lock()
            .iter()
            .map(|(_, removes)| removes.load(Ordering::SeqCst))
            .collect()
    }
}

fn index_of(name: &str) -> usize {
    name.rsplit('-').next().and_then(|i| i.parse().ok()).unwrap_or(0)
}

#[async_trait]
impl MachineDriver for FakeDriver {
    type Machine = FakeMachine;

    fn preflight(&self) -> TestkitResult<()> {
        if self.fail_preflight {
            return Err(TestkitError::Precondition("Unable to locate /e2e/ubuntu16.04.qcow2".to_string()));
        }
        Ok(())
    }

    fn new_machine(&self, name: &str) -> TestkitResult<FakeMachine> {
        let index = index_of(name);
        let engine = FakeEngine {
            never_ready: self.never_ready_at == Some(index),
            ..FakeEngine::new(name, &self.log)
        };
        let machine = FakeMachine::new(name, index, engine);
        self.registry.lock().push((name.to_string(), machine.removes.clone()));
        Ok(machine)
    }

    async fn provision(&self, machine: &FakeMachine, _cancel: &CancellationToken) -> TestkitResult<()> {
        let name = machine.name();
        self.log.lock().push(format!("provision {}", name));
        if self.fail_provision_at == Some(index_of(&name)) {
            return Err(TestkitError::Hypervisor {
                command: format!("virsh start {}", name),
                output: "error: Failed to start domain".to_string(),
            });
        }
        Ok(())
    }

    async fn prepare(&self, machine: Arc<FakeMachine>, cancel: &CancellationToken) -> TestkitResult<()> {
        tokio::select! {
            _ = cancel.cancelled() => return Err(TestkitError::Cancelled),
            _ = tokio::time::sleep(self.prepare_delay) => {}
        }
        let name = machine.name();
        verify_engine(&machine.engine()?, &name, self.verify_timeout, cancel).await?;
        self.log.lock().push(format!("ready {}", name));
        Ok(())
    }
}

/// `count` machines named m0..m{count-1}, all logging into `log`.
pub fn fleet(count: usize, log: &CallLog, tweak: impl Fn(usize, &mut FakeEngine)) -> Vec<Arc<FakeMachine>> {
    (0..count)
        .map(|i| {
            let name = format!("m{}", i);
            let mut engine = FakeEngine::new(&name, log);
            tweak(i, &mut engine);
            Arc::new(FakeMachine::new(&name, i, engine))
        })
        .collect()
}
