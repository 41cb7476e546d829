//! Execution of privileged host commands. The plugin runs containerized,
//! so every side effect (iscsiadm, nvme, multipath, mount, sysfs echo)
//! must happen inside the host's mount/ipc/net namespaces; commands are
//! wrapped in `nsenter` against PID 1 and killed after a hard wall-clock
//! timeout.

use std::{env, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use tokio::process::Command;

use crate::error::DeviceError;

/// Result of a host command: exit code plus combined stdout and stderr.
#[derive(Clone, Debug)]
pub struct CmdOutput {
    pub code: i32,
    pub output: String,
}

impl CmdOutput {
    pub fn ok(output: &str) -> CmdOutput {
        CmdOutput {
            code: 0,
            output: output.to_string(),
        }
    }

    pub fn failed(code: i32, output: &str) -> CmdOutput {
        CmdOutput {
            code,
            output: output.to_string(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Classify the exit code against an allow-list. Several of the host
    /// CLIs use nonzero codes for benign conditions (iscsiadm 15 "session
    /// exists", 21 "no objects found", 255 "object not found"); callers
    /// pass the codes acceptable for their invocation.
    pub fn require_code(
        self,
        command: &str,
        allowed: &[i32],
    ) -> Result<CmdOutput, DeviceError> {
        if self.code == 0 || allowed.contains(&self.code) {
            return Ok(self);
        }
        Err(DeviceError::CommandFailed {
            command: command.to_string(),
            code: self.code,
            output: self.output,
        })
    }

    /// Classify with an empty allow-list.
    pub fn require_success(
        self,
        command: &str,
    ) -> Result<CmdOutput, DeviceError> {
        self.require_code(command, &[])
    }

    /// Whether the output indicates the invoked binary does not exist on
    /// the host (used to fall back when multipath tooling is absent).
    pub fn command_not_found(&self) -> bool {
        self.code == 127 || self.output.contains("command not found")
    }
}

/// Seam between the transport code and the host. The production
/// implementation shells out through nsenter; tests substitute a scripted
/// transcript.
#[async_trait]
pub trait HostExec: Send + Sync {
    /// Run a command line on the host, returning its exit code and
    /// combined output. `Err` is reserved for spawn failures and the
    /// wall-clock timeout.
    async fn exec(&self, command: &str) -> Result<CmdOutput, DeviceError>;

    /// Same as `exec` but `display` is logged in place of the real
    /// command line. Used for invocations carrying credentials (CHAP
    /// secrets must never reach the logs).
    async fn exec_redacted(
        &self,
        command: &str,
        display_cmd: &str,
    ) -> Result<CmdOutput, DeviceError>;
}

/// Hard wall-clock limit for any single host command.
pub const EXEC_TIMEOUT: Duration = Duration::from_secs(30);

static NSENTER: Lazy<String> = Lazy::new(|| match env::var("NSENTER") {
    Ok(path) => {
        tracing::debug!("using environment: NSENTER={}", path);
        path
    }
    _ => match which::which("nsenter") {
        Ok(path) => path.display().to_string(),
        _ => {
            tracing::debug!("nsenter binary not found");
            String::new()
        }
    },
});

/// Real host shell. When `enter_host_ns` is set the command is run inside
/// PID 1's mount/ipc/net namespaces.
pub struct HostShell {
    timeout: Duration,
    enter_host_ns: bool,
}

impl Default for HostShell {
    fn default() -> Self {
        HostShell {
            timeout: EXEC_TIMEOUT,
            enter_host_ns: true,
        }
    }
}

impl HostShell {
    pub fn new() -> Arc<HostShell> {
        Arc::new(HostShell::default())
    }

    /// A shell that executes in the current namespaces, for development
    /// hosts running the plugin unconfined.
    pub fn unconfined(timeout: Duration) -> Arc<HostShell> {
        Arc::new(HostShell {
            timeout,
            enter_host_ns: false,
        })
    }

    fn build(&self, command: &str) -> Result<Command, DeviceError> {
        let mut cmd;
        if self.enter_host_ns {
            let nsenter = NSENTER.as_str();
            if nsenter.is_empty() {
                return Err(DeviceError::new("nsenter binary not found"));
            }
            cmd = Command::new(nsenter);
            // mount, ipc and net namespaces of the host's PID 1
            cmd.args(["--target", "1", "--mount", "--ipc", "--net", "--"]);
            cmd.args(["sh", "-c", command]);
        } else {
            cmd = Command::new("sh");
            cmd.args(["-c", command]);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }

    async fn run(
        &self,
        command: &str,
        display_cmd: &str,
    ) -> Result<CmdOutput, DeviceError> {
        tracing::trace!("exec: {}", display_cmd);
        let child = self.build(command)?.spawn().map_err(|source| {
            DeviceError::CommandSpawn {
                command: display_cmd.to_string(),
                source,
            }
        })?;

        // kill_on_drop reaps the child when the timeout drops the future
        let output =
            match tokio::time::timeout(self.timeout, child.wait_with_output())
                .await
            {
                Ok(result) => result.map_err(|source| {
                    DeviceError::CommandSpawn {
                        command: display_cmd.to_string(),
                        source,
                    }
                })?,
                Err(_) => {
                    tracing::warn!(
                        "command timed out after {:?}: {}",
                        self.timeout,
                        display_cmd
                    );
                    return Err(DeviceError::CommandTimeout {
                        command: display_cmd.to_string(),
                    });
                }
            };

        let mut combined =
            String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let code = output.status.code().unwrap_or(-1);
        tracing::trace!("exec done ({}): {}", code, display_cmd);
        Ok(CmdOutput {
            code,
            output: combined,
        })
    }
}

#[async_trait]
impl HostExec for HostShell {
    async fn exec(&self, command: &str) -> Result<CmdOutput, DeviceError> {
        self.run(command, command).await
    }

    async fn exec_redacted(
        &self,
        command: &str,
        display_cmd: &str,
    ) -> Result<CmdOutput, DeviceError> {
        self.run(command, display_cmd).await
    }
}
