use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::core::command::{render_command, CommandRunner};
use crate::errors::{TestkitError, TestkitResult};

// Test machines are throwaway and their IPs get recycled between runs, so
// host keys are never worth checking.
const HOST_KEY_OPTIONS: &[&str] = &[
    "StrictHostKeyChecking=no",
    "GlobalKnownHostsFile=/dev/null",
    "UserKnownHostsFile=/dev/null",
    "UpdateHostKeys=no",
    "CheckHostIP=no",
    "VerifyHostKeyDNS=no",
];

/// One ssh endpoint: user, address and the batch key.
#[derive(Clone)]
pub struct SshTarget {
    user: String,
    host: String,
    key_path: PathBuf,
    connect_timeout: Duration,
    command_timeout: Duration,
    runner: Arc<dyn CommandRunner>,
}

impl SshTarget {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        user: impl Into<String>,
        host: impl Into<String>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            key_path: key_path.into(),
            connect_timeout: Duration::from_secs(8),
            command_timeout: Duration::from_secs(300),
            runner,
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, command: Duration) -> Self {
        self.connect_timeout = connect;
        self.command_timeout = command;
        self
    }

    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn host_key_args(&self) -> Vec<String> {
        HOST_KEY_OPTIONS
            .iter()
            .flat_map(|opt| ["-o".to_string(), opt.to_string()])
            .collect()
    }

    pub fn ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = vec!["-q".to_string()];
        args.extend(self.host_key_args());
        args.push("-o".to_string());
        args.push(format!("ConnectTimeout={}", self.connect_timeout.as_secs()));
        args.push("-i".to_string());
        args.push(self.key_path.display().to_string());
        args.push(self.destination());
        args.push(command.to_string());
        args
    }

    pub fn scp_args(&self, local: &Path, remote: &str) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            self.key_path.display().to_string(),
            "-q".to_string(),
        ];
        args.extend(self.host_key_args());
        args.push("-o".to_string());
        args.push(format!("ConnectTimeout={}", self.connect_timeout.as_secs()));
        args.push(local.display().to_string());
        args.push(format!("{}:{}", self.destination(), remote));
        args
    }

    /// Runs `command` remotely and returns the trimmed stdout+stderr.
    /// A non-zero remote status is an error carrying that output.
    pub async fn run(&self, command: &str) -> TestkitResult<String> {
        let args = self.ssh_args(command);
        debug!(target = %self.destination(), command, "ssh");
        self.exec("ssh", &args, command).await
    }

    pub async fn copy_to(&self, local: &Path, remote: &str) -> TestkitResult<()> {
        let args = self.scp_args(local, remote);
        let out = self.exec("scp", &args, &format!("scp {}", remote)).await?;
        if !out.is_empty() {
            debug!(target = %self.destination(), "{}", out);
        }
        Ok(())
    }

    async fn exec(&self, program: &str, args: &[String], command: &str) -> TestkitResult<String> {
        let out = tokio::time::timeout(self.command_timeout, self.runner.run(program, args))
            .await
            .map_err(|_| {
                TestkitError::Timeout(format!(
                    "`{}` on {} did not finish within {:?}",
                    command,
                    self.destination(),
                    self.command_timeout
                ))
            })??;

        if out.success {
            Ok(out.output)
        } else {
            debug!(command = %render_command(program, args), code = ?out.code, "remote command failed");
            Err(TestkitError::Shell {
                target: self.destination(),
                command: command.to_string(),
                output: out.output,
            })
        }
    }
}
