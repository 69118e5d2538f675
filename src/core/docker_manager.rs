use async_trait::async_trait;
use bollard::models::{NodeState, SwarmInitRequest, SwarmJoinRequest};
use bollard::query_parameters::ListNodesOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::{TestkitError, TestkitResult};
use crate::utils::await_converge;

/// What a worker needs to join: taken once from the leader right after the
/// control plane comes up and handed unchanged to every worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinSnapshot {
    pub worker_token: String,
    pub remote_manager: String,
}

impl JoinSnapshot {
    pub fn join_request(&self, listen_addr: &str) -> SwarmJoinRequest {
        SwarmJoinRequest {
            listen_addr: Some(listen_addr.to_string()),
            remote_addrs: Some(vec![self.remote_manager.clone()]),
            join_token: Some(self.worker_token.clone()),
            ..Default::default()
        }
    }
}

/// The engine calls the orchestrator and the bootstrap rely on.
#[async_trait]
pub trait EngineApi: Send + Sync {
    /// Cheap liveness probe; returns the engine version.
    async fn verify(&self) -> TestkitResult<String>;

    async fn init_swarm(&self, listen_addr: &str, advertise_addr: &str) -> TestkitResult<()>;

    async fn join_snapshot(&self) -> TestkitResult<JoinSnapshot>;

    async fn join_swarm(&self, listen_addr: &str, snapshot: &JoinSnapshot) -> TestkitResult<()>;

    /// Nodes the control plane currently reports as ready.
    async fn ready_nodes(&self) -> TestkitResult<usize>;
}

/// Engine API of one machine, spoken through bollard.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
    host: String,
}

impl DockerEngine {
    /// `host` is a `tcp://ip:port` endpoint. With a `tls_dir` the client
    /// authenticates with key.pem/cert.pem/ca.pem from it.
    pub fn connect(host: &str, tls_dir: Option<&Path>, timeout: Duration) -> TestkitResult<Self> {
        let docker = match tls_dir {
            Some(dir) => Docker::connect_with_ssl(
                host,
                &dir.join("key.pem"),
                &dir.join("cert.pem"),
                &dir.join("ca.pem"),
                timeout.as_secs(),
                API_DEFAULT_VERSION,
            )?,
            None => Docker::connect_with_http(host, timeout.as_secs(), API_DEFAULT_VERSION)?,
        };
        Ok(Self {
            docker,
            host: host.to_string(),
        })
    }
}

#[async_trait]
impl EngineApi for DockerEngine {
    async fn verify(&self) -> TestkitResult<String> {
        self.docker.ping().await?;
        let version = self.docker.version().await?;
        Ok(version.version.unwrap_or_default())
    }

    async fn init_swarm(&self, listen_addr: &str, advertise_addr: &str) -> TestkitResult<()> {
        let node_id = self
            .docker
            .init_swarm(SwarmInitRequest {
                listen_addr: Some(listen_addr.to_string()),
                advertise_addr: Some(advertise_addr.to_string()),
                ..Default::default()
            })
            .await?;
        info!(host = %self.host, node_id = %node_id, advertise_addr, "🐳 swarm initialized");
        Ok(())
    }

    async fn join_snapshot(&self) -> TestkitResult<JoinSnapshot> {
        let swarm = self.docker.inspect_swarm().await?;
        let worker_token = swarm
            .join_tokens
            .and_then(|tokens| tokens.worker)
            .ok_or_else(|| TestkitError::EngineState("swarm reports no worker join token".to_string()))?;

        let info = self.docker.info().await?;
        let remote_manager = info
            .swarm
            .and_then(|swarm| swarm.remote_managers)
            .and_then(|managers| managers.into_iter().find_map(|peer| peer.addr))
            .ok_or_else(|| TestkitError::EngineState("swarm reports no remote managers".to_string()))?;

        Ok(JoinSnapshot {
            worker_token,
            remote_manager,
        })
    }

    async fn join_swarm(&self, listen_addr: &str, snapshot: &JoinSnapshot) -> TestkitResult<()> {
        self.docker.join_swarm(snapshot.join_request(listen_addr)).await?;
        debug!(host = %self.host, manager = %snapshot.remote_manager, "joined swarm");
        Ok(())
    }

    async fn ready_nodes(&self) -> TestkitResult<usize> {
        let nodes = self.docker.list_nodes(None::<ListNodesOptions>).await?;
        Ok(nodes
            .iter()
            .filter(|node| {
                matches!(
                    node.status.as_ref().and_then(|status| status.state.as_ref()),
                    Some(NodeState::READY)
                )
            })
            .count())
    }
}

/// Polls `engine` once a second until it answers or `timeout` runs out.
pub async fn verify_engine(
    engine: &Arc<dyn EngineApi>,
    name: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> TestkitResult<String> {
    let engine = engine.as_ref();
    let version = OnceLock::new();
    let seen = &version;
    await_converge(cancel, timeout, Duration::from_secs(1), || async move {
        let v = engine.verify().await?;
        let _ = seen.set(v);
        Ok::<(), TestkitError>(())
    })
    .await
    .map_err(|e| match e {
        TestkitError::NotConverged { last_error, .. } => TestkitError::Timeout(format!(
            "Unable to verify docker engine on {} within {:?}: {}",
            name, timeout, last_error
        )),
        other => other,
    })?;

    let version = version.into_inner().unwrap_or_default();
    info!(machine = name, version = %version, "engine verified");
    Ok(version)
}
