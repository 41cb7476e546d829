//! NVMe-over-RoCE transport. Target NQNs are discovered at runtime per
//! portal; an existing live rdma controller for the portal is reused
//! instead of connecting again, and the namespace is matched by GUID
//! under that controller.

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use nvmectl::Controller;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, warn};

use super::{
    assembly::{self, AssemblyParams, PortalOps, SharedPathState},
    ConnectRequest, DeviceStack, LunId, Transport, TransportOps,
};
use crate::error::DeviceError;

/// `nvme connect` exits with 70 when the controller already exists.
const ERR_ALREADY_CONNECTED: i32 = 70;

pub struct RoceConnector {
    stack: DeviceStack,
    subsys_roots: Vec<PathBuf>,
}

impl RoceConnector {
    pub fn new(stack: DeviceStack) -> RoceConnector {
        RoceConnector {
            stack,
            subsys_roots: vec![
                PathBuf::from(nvmectl::subsystem::SUBSYS_CLASS),
                PathBuf::from(nvmectl::subsystem::FABRICS_CTL),
            ],
        }
    }
}

#[async_trait]
impl TransportOps for RoceConnector {
    fn transport(&self) -> Transport {
        Transport::Roce
    }

    fn stack(&self) -> &DeviceStack {
        &self.stack
    }

    async fn try_connect(
        &self,
        request: &ConnectRequest,
    ) -> Result<String, DeviceError> {
        let ConnectRequest::Roce(info) = request else {
            return Err(DeviceError::InvalidRequest {
                reason: "not a roce request".to_string(),
            });
        };
        let params = AssemblyParams::from_config(
            info.lun_guid.clone(),
            info.use_multipath,
        );
        let count = if info.use_multipath {
            info.portals.len()
        } else {
            1
        };
        let portals = (0 .. count)
            .map(|i| {
                Arc::new(RocePortalOps {
                    portal: info.portals[i].clone(),
                    lun_guid: info.lun_guid.clone(),
                    stack: self.stack.clone(),
                    subsys_roots: self.subsys_roots.clone(),
                    nqn: Mutex::new(None),
                }) as Arc<dyn PortalOps>
            })
            .collect();
        assembly::establish(&self.stack, &params, portals).await
    }

    /// Once the namespace is gone, drop the rdma controllers that no
    /// longer carry any namespace for us.
    async fn post_disconnect(
        &self,
        _id: &LunId,
    ) -> Result<(), DeviceError> {
        for root in &self.subsys_roots {
            for controller in nvmectl::controllers_at(root)? {
                if controller.transport != "rdma" {
                    continue;
                }
                if controller.namespaces().is_empty() {
                    debug!(
                        "disconnecting empty rdma controller {}",
                        controller.name
                    );
                    if let Err(error) = controller.disconnect() {
                        warn!(
                            "disconnect of {} failed: {}",
                            controller.name, error
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

struct RocePortalOps {
    portal: String,
    lun_guid: LunId,
    stack: DeviceStack,
    subsys_roots: Vec<PathBuf>,
    nqn: Mutex<Option<String>>,
}

impl RocePortalOps {
    /// The live rdma controller terminating at this portal, if any.
    fn live_controller(&self) -> Option<Controller> {
        for root in &self.subsys_roots {
            let controllers = match nvmectl::controllers_at(root) {
                Ok(controllers) => controllers,
                Err(_) => continue,
            };
            if let Some(controller) = controllers.into_iter().find(|c| {
                c.transport == "rdma"
                    && c.is_live()
                    && c.has_traddr(&self.portal)
            }) {
                return Some(controller);
            }
        }
        None
    }
}

#[async_trait]
impl PortalOps for RocePortalOps {
    fn label(&self) -> String {
        format!("roce {}", self.portal)
    }

    async fn ensure_session(&self) -> Result<(), DeviceError> {
        let discover = format!("nvme discover -t rdma -a {}", self.portal);
        let out = self
            .stack
            .shell
            .exec(&discover)
            .await?
            .require_success(&discover)
            .map_err(|error| DeviceError::LoginFailed {
                portal: self.portal.clone(),
                reason: error.to_string(),
            })?;
        let nqn = parse_discover_subnqn(&out.output).ok_or_else(|| {
            DeviceError::LoginFailed {
                portal: self.portal.clone(),
                reason: "discovery listing carries no subsystem nqn"
                    .to_string(),
            }
        })?;
        *self.nqn.lock() = Some(nqn.clone());

        if self.live_controller().is_some() {
            debug!("{} already connected", self.label());
            return Ok(());
        }

        let connect =
            format!("nvme connect -t rdma -a {} -n {}", self.portal, nqn);
        let out = self.stack.shell.exec(&connect).await?;
        if out.success() || out.code == ERR_ALREADY_CONNECTED {
            return Ok(());
        }
        // the kernel answers EIO to a connect racing an existing session
        if out.output.contains("Input/output error")
            && self.live_controller().is_some()
        {
            debug!("{} connect raced an existing session", self.label());
            return Ok(());
        }
        Err(DeviceError::LoginFailed {
            portal: self.portal.clone(),
            reason: out.output,
        })
    }

    async fn rescan(&self) -> Result<(), DeviceError> {
        match self.live_controller() {
            Some(controller) => Ok(controller.rescan()?),
            None => Ok(()),
        }
    }

    async fn find_device(
        &self,
        state: &SharedPathState,
    ) -> Result<Option<String>, DeviceError> {
        let claimed = state.claimed_devices();
        if let Some(controller) = self.live_controller() {
            for namespace in controller.namespaces() {
                if claimed.contains(&namespace)
                    || !self.stack.resolver.exists(&namespace)
                {
                    continue;
                }
                match self.stack.resolver.device_identity(&namespace) {
                    Ok(identity) if self.lun_guid.matches(&identity) => {
                        return Ok(Some(namespace));
                    }
                    _ => {}
                }
            }
        }
        Ok(self
            .stack
            .resolver
            .find_by_sysfs_wwid(&claimed, &self.lun_guid))
    }
}

/// Pull the subsystem NQN out of a `nvme discover` listing, skipping the
/// discovery subsystem itself.
fn parse_discover_subnqn(listing: &str) -> Option<String> {
    static PATTERN: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?m)^\s*subnqn:\s*(?P<nqn>\S+)").unwrap()
    });

    PATTERN
        .captures_iter(listing)
        .map(|captures| captures["nqn"].to_string())
        .find(|nqn| !nqn.ends_with("discovery"))
}
