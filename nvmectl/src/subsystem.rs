//! Model of the NVMe-over-Fabrics controllers the kernel currently holds.
//!
//! Controllers show up in two sysfs shapes depending on kernel vintage:
//! grouped under `/sys/class/nvme-subsystem/nvme-subsysN/nvmeM`, or flat
//! under `/sys/devices/virtual/nvme-fabrics/ctl/nvmeM`. Both carry the same
//! attributes (`subsysnqn`, `state`, `transport`, `address`) and both are
//! handled here. PCIe controllers have no fabrics address and are skipped.

use std::path::{Path, PathBuf};

use snafu::ResultExt;

use crate::error::{FileIoSnafu, NvmeError, SubsystemScanSnafu};

pub const SUBSYS_CLASS: &str = "/sys/class/nvme-subsystem";
pub const FABRICS_CTL: &str = "/sys/devices/virtual/nvme-fabrics/ctl";

/// One fabrics controller: a single transport path into a subsystem.
#[derive(Clone, Debug)]
pub struct Controller {
    /// controller name (`nvme0`)
    pub name: String,
    /// NVMe Qualified Name of the subsystem behind this controller
    pub nqn: String,
    /// connection state, `live` when usable
    pub state: String,
    /// transport in use (`rdma`, `tcp`, `fc`)
    pub transport: String,
    /// address string, `traddr=X,trsvcid=Y`
    pub address: String,
    ctrl_dir: PathBuf,
}

impl Controller {
    /// Build a controller from its sysfs directory. Directories without a
    /// transport attribute (PCIe devices) are rejected.
    pub fn from_path(source: &Path) -> Result<Self, NvmeError> {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if !sysfs::exists(source, "transport") {
            return Err(NvmeError::NotFabrics { name });
        }
        let nqn: String = sysfs::parse_value(source, "subsysnqn")?;
        let state: String = sysfs::parse_value(source, "state")?;
        let transport: String = sysfs::parse_value(source, "transport")?;
        let address = sysfs::read_trimmed(source, "address")?;

        Ok(Controller {
            name,
            nqn,
            state,
            transport,
            address,
            ctrl_dir: source.to_path_buf(),
        })
    }

    /// Whether the connection is established and usable.
    pub fn is_live(&self) -> bool {
        self.state == "live"
    }

    /// Whether this controller terminates at the given portal address.
    pub fn has_traddr(&self, portal: &str) -> bool {
        self.address
            .split(',')
            .map(str::trim)
            .any(|field| field == format!("traddr={}", portal))
    }

    /// Issue a namespace rescan to the controller.
    pub fn rescan(&self) -> Result<(), NvmeError> {
        self.write_attr("rescan_controller")
    }

    /// Disconnect the controller, dropping all of its namespaces.
    pub fn disconnect(&self) -> Result<(), NvmeError> {
        self.write_attr("delete_controller")
    }

    fn write_attr(&self, attr: &str) -> Result<(), NvmeError> {
        sysfs::write_value(&self.ctrl_dir, attr, 1).context(FileIoSnafu {
            filename: self.ctrl_dir.join(attr).display().to_string(),
        })
    }

    /// Namespace block devices currently exposed by this controller
    /// (`nvme0n1`, ...).
    pub fn namespaces(&self) -> Vec<String> {
        sysfs::list_names(&self.ctrl_dir)
            .unwrap_or_default()
            .into_iter()
            .filter(|name| is_namespace_name(name))
            .collect()
    }
}

/// Whether a sysfs entry names a namespace block device: `nvme<i>n<j>`.
fn is_namespace_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix("nvme") else {
        return false;
    };
    let mut split = rest.splitn(2, 'n');
    let (Some(instance), Some(index)) = (split.next(), split.next()) else {
        return false;
    };
    !instance.is_empty()
        && !index.is_empty()
        && instance.chars().all(|c| c.is_ascii_digit())
        && index.chars().all(|c| c.is_ascii_digit())
}

/// Enumerate every fabrics controller visible under `root`. Handles both
/// the grouped (nvme-subsystem class) and the flat (fabrics ctl) layouts.
pub fn controllers_at(root: &Path) -> Result<Vec<Controller>, NvmeError> {
    let pattern = format!("{}/*", root.display());
    let entries = glob::glob(&pattern).context(SubsystemScanSnafu {
        path_prefix: pattern.clone(),
    })?;

    let mut found = Vec::new();
    for entry in entries.flatten() {
        let name = entry
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if name.starts_with("nvme-subsys") {
            // grouped layout: controllers are children of the subsystem
            let nested = glob::glob(&format!("{}/nvme*", entry.display()))
                .context(SubsystemScanSnafu {
                    path_prefix: entry.display().to_string(),
                })?;
            for ctrl in nested.flatten() {
                if let Ok(controller) = Controller::from_path(&ctrl) {
                    found.push(controller);
                }
            }
        } else if let Ok(controller) = Controller::from_path(&entry) {
            found.push(controller);
        }
    }
    Ok(found)
}

/// Enumerate the fabrics controllers of the running host.
pub fn controllers() -> Result<Vec<Controller>, NvmeError> {
    let grouped = controllers_at(Path::new(SUBSYS_CLASS))?;
    if !grouped.is_empty() {
        return Ok(grouped);
    }
    controllers_at(Path::new(FABRICS_CTL))
}

/// Find the live controller serving the given subsystem NQN.
pub fn controller_for_nqn(nqn: &str) -> Result<Controller, NvmeError> {
    controllers()?
        .into_iter()
        .find(|c| c.nqn == nqn)
        .ok_or_else(|| NvmeError::CtrlNotFound {
            nqn: nqn.to_string(),
        })
}

/// Map a namespace block device (`nvme0n1`) to its controller (`nvme0`).
pub fn controller_name(device: &str) -> Result<String, NvmeError> {
    let stripped = device.strip_prefix("nvme").ok_or_else(|| {
        NvmeError::NotNamespace {
            device: device.to_string(),
        }
    })?;
    match stripped.split_once('n') {
        Some((instance, _)) if !instance.is_empty() => {
            Ok(format!("nvme{}", instance))
        }
        _ => Err(NvmeError::NotNamespace {
            device: device.to_string(),
        }),
    }
}
