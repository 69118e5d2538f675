use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ProvisionSettings;
use crate::core::vm::{Machine, MachineDriver};
use crate::errors::{TestkitError, TestkitResult};

type PrepareOutcome = (String, TestkitResult<()>);

/// `<prefix>-<ID>-<index>` for every machine of one batch.
pub fn batch_names(prefix: &str, batch_id: u32, count: usize) -> Vec<String> {
    (0..count)
        .map(|index| format!("{}-{:X}-{}", prefix, batch_id, index))
        .collect()
}

fn new_batch_id() -> u32 {
    rand::thread_rng().gen_range(0..=0x00ff_ffff)
}

/// Best effort: failures are logged and the rest still get removed.
pub async fn remove_all<M: Machine>(machines: &[Arc<M>]) {
    for machine in machines {
        let name = machine.name();
        if let Err(e) = machine.remove().await {
            warn!(machine = %name, error = %e, "Failed to remove machine");
        }
    }
}

/// Creates batches of ready machines through a driver. A batch is either
/// handed back complete or rolled back entirely.
pub struct MachineSet<D: MachineDriver> {
    driver: Arc<D>,
    name_prefix: String,
    batch_timeout: Duration,
    cancel: CancellationToken,
}

impl<D: MachineDriver> MachineSet<D> {
    pub fn new(driver: Arc<D>, settings: &ProvisionSettings) -> Self {
        Self {
            driver,
            name_prefix: settings.name_prefix.clone(),
            batch_timeout: settings.batch_timeout(),
            cancel: CancellationToken::new(),
        }
    }

    /// Aborts every batch in flight; they roll back and return `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Builds `count` machines and waits until every engine answers.
    ///
    /// Provisioning is serial since it mutates shared hypervisor state. The
    /// readiness checks then run concurrently, one task each. On any
    /// failure, deadline or cancellation every machine of the batch is
    /// removed and the first error is returned.
    pub async fn create_machines(&self, count: usize) -> TestkitResult<Vec<Arc<D::Machine>>> {
        if count == 0 {
            return Err(TestkitError::Precondition(
                "a batch needs at least one machine".to_string(),
            ));
        }
        self.driver.preflight()?;

        let names = batch_names(&self.name_prefix, new_batch_id(), count);
        info!(count, first = %names[0], "Creating machines");

        let token = self.cancel.child_token();
        let created = Mutex::new(Vec::with_capacity(count));
        let mut tasks = JoinSet::new();

        let outcome = tokio::select! {
            result = self.run_batch(&names, &created, &mut tasks, &token) => result,
            _ = tokio::time::sleep(self.batch_timeout) => Err(TestkitError::Timeout(format!(
                "Unable to create {} machines within {:?}",
                count, self.batch_timeout
            ))),
            _ = self.cancel.cancelled() => Err(TestkitError::Cancelled),
        };

        // nothing may still be touching a machine once rollback starts
        token.cancel();
        tasks.shutdown().await;

        let machines = created.into_inner();
        match outcome {
            Ok(()) => {
                info!(count, "All machines ready");
                Ok(machines)
            }
            Err(e) => {
                error!(error = %e, "Batch failed, removing {} machines", machines.len());
                remove_all(&machines).await;
                Err(e)
            }
        }
    }

    async fn run_batch(
        &self,
        names: &[String],
        created: &Mutex<Vec<Arc<D::Machine>>>,
        tasks: &mut JoinSet<PrepareOutcome>,
        cancel: &CancellationToken,
    ) -> TestkitResult<()> {
        for name in names {
            let machine = Arc::new(self.driver.new_machine(name)?);
            created.lock().push(machine.clone());
            debug!(machine = %name, "provisioning");
            self.driver.provision(&machine, cancel).await?;
        }

        let machines = created.lock().clone();
        for machine in machines {
            let driver = self.driver.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let name = machine.name();
                let result = driver.prepare(machine, &cancel).await;
                (name, result)
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let failure = match joined {
                Ok((name, Ok(()))) => {
                    debug!(machine = %name, "ready");
                    None
                }
                Ok((name, Err(e))) => {
                    error!(machine = %name, error = %e, "Machine failed to become ready");
                    Some(e)
                }
                Err(e) => Some(TestkitError::Task(e)),
            };
            if let Some(e) = failure {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
