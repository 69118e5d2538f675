use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::core::docker_manager::{EngineApi, JoinSnapshot};
use crate::core::vm::Machine;
use crate::errors::{BootstrapStage, TestkitError, TestkitResult};
use crate::utils::await_converge;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    Unstarted,
    LeaderInitialized,
    /// Workers joined so far.
    WorkersJoining(usize),
    Complete,
    /// Terminal. Only a teardown of the whole batch gets out of here.
    Failed,
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapState::Unstarted => write!(f, "unstarted"),
            BootstrapState::LeaderInitialized => write!(f, "leader-initialized"),
            BootstrapState::WorkersJoining(k) => write!(f, "workers-joining({})", k),
            BootstrapState::Complete => write!(f, "complete"),
            BootstrapState::Failed => write!(f, "failed"),
        }
    }
}

/// Turns a batch of ready machines into a swarm with machine[0] as leader.
///
/// Workers join one after the other against the snapshot taken right after
/// the leader came up. Nothing is retried and nothing is undone on failure.
pub struct SwarmBootstrap {
    listen_addr: String,
    state: RwLock<BootstrapState>,
}

impl SwarmBootstrap {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            state: RwLock::new(BootstrapState::Unstarted),
        }
    }

    pub fn state(&self) -> BootstrapState {
        *self.state.read()
    }

    fn set_state(&self, state: BootstrapState) {
        debug!(%state, "bootstrap");
        *self.state.write() = state;
    }

    pub async fn bootstrap<M: Machine>(&self, machines: &[Arc<M>]) -> TestkitResult<SwarmCluster<M>> {
        let result = self.run(machines).await;
        if let Err(e) = &result {
            error!(error = %e, "Swarm bootstrap failed");
            self.set_state(BootstrapState::Failed);
        }
        result
    }

    async fn run<M: Machine>(&self, machines: &[Arc<M>]) -> TestkitResult<SwarmCluster<M>> {
        let (leader, workers) = machines.split_first().ok_or_else(|| {
            TestkitError::Precondition("a swarm needs at least one machine".to_string())
        })?;

        let leader_name = leader.name();
        let fail_at = |stage: BootstrapStage, machine: &str| {
            let machine = machine.to_string();
            move |source: TestkitError| TestkitError::Bootstrap {
                stage,
                machine,
                source: Box::new(source),
            }
        };

        let leader_engine = leader
            .engine()
            .map_err(fail_at(BootstrapStage::InitLeader, &leader_name))?;
        let advertise_addr = leader
            .internal_ip()
            .ok_or_else(|| TestkitError::NotReady(leader_name.clone()))
            .map_err(fail_at(BootstrapStage::InitLeader, &leader_name))?;

        info!(leader = %leader_name, listen_addr = %self.listen_addr, "Initializing swarm");
        leader_engine
            .init_swarm(&self.listen_addr, &advertise_addr)
            .await
            .map_err(fail_at(BootstrapStage::InitLeader, &leader_name))?;
        self.set_state(BootstrapState::LeaderInitialized);

        let snapshot = leader_engine
            .join_snapshot()
            .await
            .map_err(fail_at(BootstrapStage::FetchJoinSnapshot, &leader_name))?;
        debug!(remote_manager = %snapshot.remote_manager, "join snapshot taken");

        self.set_state(BootstrapState::WorkersJoining(0));
        for (joined, worker) in workers.iter().enumerate() {
            let name = worker.name();
            info!(worker = %name, manager = %snapshot.remote_manager, "Joining swarm");
            worker
                .engine()
                .map_err(fail_at(BootstrapStage::JoinWorker, &name))?
                .join_swarm(&self.listen_addr, &snapshot)
                .await
                .map_err(fail_at(BootstrapStage::JoinWorker, &name))?;
            self.set_state(BootstrapState::WorkersJoining(joined + 1));
        }

        self.set_state(BootstrapState::Complete);
        info!(leader = %leader_name, nodes = machines.len(), "Swarm bootstrapped");
        Ok(SwarmCluster {
            leader: leader_engine,
            listen_addr: self.listen_addr.clone(),
            snapshot,
            machines: machines.to_vec(),
        })
    }
}

/// A bootstrapped swarm. Workers are every machine after the first.
pub struct SwarmCluster<M: Machine> {
    leader: Arc<dyn EngineApi>,
    listen_addr: String,
    snapshot: JoinSnapshot,
    machines: Vec<Arc<M>>,
}

impl<M: Machine> SwarmCluster<M> {
    pub fn leader(&self) -> &Arc<M> {
        &self.machines[0]
    }

    pub fn workers(&self) -> &[Arc<M>] {
        &self.machines[1..]
    }

    pub fn machines(&self) -> &[Arc<M>] {
        &self.machines
    }

    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    pub fn join_snapshot(&self) -> &JoinSnapshot {
        &self.snapshot
    }

    /// Waits until the leader reports every machine as a ready node.
    pub async fn await_ready(&self, cancel: &CancellationToken, timeout: Duration) -> TestkitResult<()> {
        let leader = self.leader.as_ref();
        let expected = self.machines.len();
        await_converge(cancel, timeout, Duration::from_secs(1), || async move {
            let ready = leader.ready_nodes().await?;
            if ready == expected {
                Ok(())
            } else {
                Err(TestkitError::EngineState(format!(
                    "{} of {} nodes ready",
                    ready, expected
                )))
            }
        })
        .await
    }
}
