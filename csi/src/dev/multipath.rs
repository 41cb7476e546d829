//! Operations over the system multipath daemon. The daemon owns map
//! assembly; this module registers WWIDs and paths with it, watches
//! `/sys/block/*/holders` for the assembled `dm-*`, and tears maps down
//! together with their member devices.

use std::{path::PathBuf, sync::Arc};

use tracing::{debug, warn};

use crate::{
    error::DeviceError,
    shell::{CmdOutput, HostExec},
};

pub struct MultipathOps {
    shell: Arc<dyn HostExec>,
    sys_block: PathBuf,
}

impl MultipathOps {
    pub fn new(shell: Arc<dyn HostExec>) -> MultipathOps {
        MultipathOps {
            shell,
            sys_block: PathBuf::from("/sys/block"),
        }
    }

    pub fn with_sys_block(
        shell: Arc<dyn HostExec>,
        sys_block: PathBuf,
    ) -> MultipathOps {
        MultipathOps {
            shell,
            sys_block,
        }
    }

    fn classify(out: CmdOutput) -> Result<CmdOutput, DeviceError> {
        if out.command_not_found() {
            return Err(DeviceError::MultipathUnavailable {
                reason: out.output,
            });
        }
        Ok(out)
    }

    /// Register a WWID with the daemon. Re-registration is not an error.
    pub async fn add_wwid(&self, wwid: &str) -> Result<(), DeviceError> {
        let command = format!("multipath -a {}", wwid);
        let out =
            Self::classify(self.shell.exec(&command).await?)?;
        if out.success() || out.output.contains("already") {
            return Ok(());
        }
        Err(DeviceError::CommandFailed {
            command,
            code: out.code,
            output: out.output,
        })
    }

    /// Feed a freshly discovered path device to the daemon. The daemon
    /// answers "ok" when it takes the path; anything else is logged and
    /// tolerated since the path may simply not be multipath-managed yet.
    pub async fn add_path(&self, dev_path: &str) -> Result<(), DeviceError> {
        let command = format!("multipath add path {}", dev_path);
        let out =
            Self::classify(self.shell.exec(&command).await?)?;
        if !out.output.trim().eq_ignore_ascii_case("ok") {
            warn!(
                "multipath did not accept path {}: {}",
                dev_path,
                out.output.trim()
            );
        }
        Ok(())
    }

    /// Look for the dm the daemon assembled over any of the member
    /// devices. Empty until the daemon has coalesced the paths.
    pub fn find_assembled_dm(&self, devices: &[String]) -> Option<String> {
        for device in devices {
            let pattern = format!(
                "{}/holders/dm-*",
                self.sys_block.join(device).display()
            );
            let holders = match glob::glob(&pattern) {
                Ok(paths) => paths,
                Err(_) => continue,
            };
            for holder in holders.flatten() {
                if let Some(name) = holder.file_name() {
                    return Some(name.to_string_lossy().to_string());
                }
            }
        }
        None
    }

    /// Flush a dm map (by name or alias).
    pub async fn flush(&self, map: &str) -> Result<(), DeviceError> {
        let command = format!("multipath -f {}", map);
        Self::classify(self.shell.exec(&command).await?)?
            .require_success(&command)?;
        Ok(())
    }

    /// Ask the daemon to pick up a resized LUN.
    pub async fn resize_map(&self, dm: &str) -> Result<(), DeviceError> {
        let command = format!("multipathd resize map {}", dm);
        Self::classify(self.shell.exec(&command).await?)?
            .require_success(&command)?;
        Ok(())
    }

    /// Remove a member device from the kernel: SCSI devices are deleted,
    /// NVMe members get a controller rescan so the kernel drops the
    /// namespace that went away.
    pub fn remove_member(&self, device: &str) -> Result<(), DeviceError> {
        let dir = self.sys_block.join(device).join("device");
        if device.starts_with("nvme") {
            debug!("rescanning controller of member {}", device);
            sysfs::write_value(&dir, "rescan_controller", 1)?;
        } else {
            debug!("deleting scsi member {}", device);
            sysfs::write_value(&dir, "delete", 1)?;
        }
        Ok(())
    }

    /// Tear down a dm map: remove every member, then flush the map.
    pub async fn flush_with_members(
        &self,
        dm: &str,
        members: &[String],
    ) -> Result<(), DeviceError> {
        for member in members {
            if let Err(error) = self.remove_member(member) {
                warn!("failed to remove member {}: {}", member, error);
            }
        }
        self.flush(dm).await
    }
}
