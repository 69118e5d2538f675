use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::errors::{TestkitError, TestkitResult};

/// What a finished host process left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    /// stdout followed by stderr, trimmed.
    pub output: String,
}

impl CommandOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            output: output.into(),
        }
    }

    pub fn failed(code: i32, output: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            output: output.into(),
        }
    }

    fn from_process(status: std::process::ExitStatus, stdout: &[u8], stderr: &[u8]) -> Self {
        let mut combined = String::from_utf8_lossy(stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(stderr));
        Self {
            success: status.success(),
            code: status.code(),
            output: combined.trim().to_string(),
        }
    }

    /// Hypervisor flavoured conversion: a non-zero exit aborts with the raw
    /// output attached.
    pub fn into_hypervisor_result(self, command: String) -> TestkitResult<String> {
        if self.success {
            Ok(self.output)
        } else {
            Err(TestkitError::Hypervisor {
                command,
                output: self.output,
            })
        }
    }
}

pub fn render_command(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Seam between the drivers and the host's process table.
#[async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    async fn run(&self, program: &str, args: &[String]) -> TestkitResult<CommandOutput>;
}

/// Spawns real processes. Children are killed when the future running them
/// is dropped, so cancelling a caller also stops its subprocess.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> TestkitResult<CommandOutput> {
        debug!(command = %render_command(program, args), "exec");
        let out = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(CommandOutput::from_process(out.status, &out.stdout, &out.stderr))
    }
}
