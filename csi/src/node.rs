//! Node-side lifecycle of the assembled device: waiting for it to
//! appear, laying down a filesystem, mounting it onto the target path,
//! unmounting, and growing the filesystem after a LUN expansion. All of
//! it runs through the host shell since the block stack being driven is
//! the host's.

use std::{sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    dev::multipath::MultipathOps,
    error::DeviceError,
    findmnt,
    shell::HostExec,
};

pub struct NodeDevLifecycle {
    shell: Arc<dyn HostExec>,
    multipath: Arc<MultipathOps>,
}

impl NodeDevLifecycle {
    pub fn new(
        shell: Arc<dyn HostExec>,
        multipath: Arc<MultipathOps>,
    ) -> NodeDevLifecycle {
        NodeDevLifecycle {
            shell,
            multipath,
        }
    }

    /// Bounded poll for a device path to appear on the host.
    pub async fn wait_for_device(
        &self,
        device_path: &str,
        attempts: u32,
        interval: Duration,
    ) -> Result<(), DeviceError> {
        for _ in 0 .. attempts {
            let probe = format!("test -e {}", device_path);
            if self.shell.exec(&probe).await?.success() {
                return Ok(());
            }
            tokio::time::sleep(interval).await;
        }
        Err(DeviceError::new(&format!(
            "device {} did not appear",
            device_path
        )))
    }

    /// Probe the device for an existing filesystem and create one only
    /// on a blank device. Never reformat: the mindset is to never
    /// overwrite data.
    pub async fn format_device(
        &self,
        device_path: &str,
        fstype: &str,
    ) -> Result<(), DeviceError> {
        let probe = format!("blkid -o value -s TYPE {}", device_path);
        let out = self.shell.exec(&probe).await?;
        // blkid exits 2 on a device carrying no signature at all
        let existing = out.output.trim().to_string();
        if out.success() && !existing.is_empty() {
            info!(
                "skipping format: {} contains a preexisting {} filesystem",
                device_path, existing
            );
            return Ok(());
        }

        debug!("formatting {} with {}", device_path, fstype);
        let mkfs = format!("mkfs -t {} -F {}", fstype, device_path);
        self.shell.exec(&mkfs).await?.require_success(&mkfs)?;
        info!("device {} formatted with {}", device_path, fstype);
        Ok(())
    }

    /// Mount the device onto the target path. Already mounted there is
    /// success; mounted elsewhere under the same target is an error
    /// surfaced by the mount itself.
    pub async fn mount_device(
        &self,
        device_path: &str,
        target: &str,
        fstype: &str,
    ) -> Result<(), DeviceError> {
        if let Some(existing) =
            findmnt::get_devicepath(&self.shell, target).await?
        {
            if existing == device_path {
                debug!("{} already mounted at {}", device_path, target);
                return Ok(());
            }
            return Err(DeviceError::new(&format!(
                "{} is occupied by {}",
                target, existing
            )));
        }
        let mkdir = format!("mkdir -p {}", target);
        self.shell.exec(&mkdir).await?.require_success(&mkdir)?;
        let mount =
            format!("mount -t {} {} {}", fstype, device_path, target);
        self.shell.exec(&mount).await?.require_success(&mount)?;
        Ok(())
    }

    /// Unmount the target path. Not mounted is success.
    pub async fn unmount(&self, target: &str) -> Result<(), DeviceError> {
        if findmnt::get_devicepath(&self.shell, target).await?.is_none() {
            debug!("{} is not mounted", target);
            return Ok(());
        }
        let umount = format!("umount {}", target);
        self.shell.exec(&umount).await?.require_success(&umount)?;
        Ok(())
    }

    /// Grow the block device and filesystem after the array expanded
    /// the LUN: rescan the paths, let the multipath daemon resize the
    /// map, then grow the filesystem.
    pub async fn expand_device(
        &self,
        device_path: &str,
    ) -> Result<(), DeviceError> {
        if let Some(dm) = device_path.strip_prefix("/dev/").filter(|name| {
            name.starts_with("dm-")
        }) {
            if let Err(error) = self.multipath.resize_map(dm).await {
                warn!("multipathd resize of {} failed: {}", dm, error);
            }
        }
        let resize = format!("resize2fs {}", device_path);
        self.shell.exec(&resize).await?.require_success(&resize)?;
        Ok(())
    }

    /// The mount points currently backed by the device, for unstage
    /// safety checks.
    pub async fn mounts_of(
        &self,
        device_path: &str,
    ) -> Result<Vec<findmnt::DeviceMount>, DeviceError> {
        findmnt::get_mountpaths(&self.shell, device_path).await
    }
}
