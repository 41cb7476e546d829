//! FC-NVMe transport. Like FC there is no login: the fabric presents the
//! namespace once zoning is in place. Attach scans the FC fabrics
//! controllers (`nvme list-subsys`, `nvme ns-rescan`) and resolves the
//! namespace by its GUID.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::{
    assembly::{self, AssemblyParams, PortalOps, SharedPathState},
    ConnectRequest, DeviceStack, LunId, Transport, TransportOps,
};
use crate::error::DeviceError;

pub struct FcNvmeConnector {
    stack: DeviceStack,
}

impl FcNvmeConnector {
    pub fn new(stack: DeviceStack) -> FcNvmeConnector {
        FcNvmeConnector {
            stack,
        }
    }
}

#[async_trait]
impl TransportOps for FcNvmeConnector {
    fn transport(&self) -> Transport {
        Transport::FcNvme
    }

    fn stack(&self) -> &DeviceStack {
        &self.stack
    }

    async fn try_connect(
        &self,
        request: &ConnectRequest,
    ) -> Result<String, DeviceError> {
        let ConnectRequest::FcNvme(info) = request else {
            return Err(DeviceError::InvalidRequest {
                reason: "not an fc-nvme request".to_string(),
            });
        };
        // one namespace per fabric presentation: single-path mode
        let params =
            AssemblyParams::from_config(info.lun_guid.clone(), false);
        let worker: Arc<dyn PortalOps> = Arc::new(FcNvmeScanOps {
            lun_guid: info.lun_guid.clone(),
            stack: self.stack.clone(),
        });
        assembly::establish(&self.stack, &params, vec![worker]).await
    }
}

struct FcNvmeScanOps {
    lun_guid: LunId,
    stack: DeviceStack,
}

#[async_trait]
impl PortalOps for FcNvmeScanOps {
    fn label(&self) -> String {
        format!("fc-nvme {}", self.lun_guid)
    }

    async fn ensure_session(&self) -> Result<(), DeviceError> {
        // connectivity is fabric-intrinsic
        Ok(())
    }

    async fn rescan(&self) -> Result<(), DeviceError> {
        let command = "nvme list-subsys -o json";
        let out = self
            .stack
            .shell
            .exec(command)
            .await?
            .require_success(command)?;
        let controllers = fc_controllers(&out.output)?;
        if controllers.is_empty() {
            debug!("no fc fabrics controllers present");
            return Ok(());
        }
        for controller in controllers {
            let rescan = format!("nvme ns-rescan /dev/{}", controller);
            if let Err(error) = self.stack.shell.exec(&rescan).await {
                warn!("rescan of {} failed: {}", controller, error);
            }
        }
        Ok(())
    }

    async fn find_device(
        &self,
        state: &SharedPathState,
    ) -> Result<Option<String>, DeviceError> {
        let claimed = state.claimed_devices();
        if let Some(device) = self
            .stack
            .resolver
            .find_by_sysfs_wwid(&claimed, &self.lun_guid)
        {
            return Ok(Some(device));
        }
        Ok(self.stack.resolver.get_device(&claimed, &self.lun_guid))
    }
}

/// Pull the FC controller names out of `nvme list-subsys -o json`. The
/// document shape differs between nvme-cli versions (top-level object or
/// a one-element array, `Subsystems`/`Paths` capitalization varies), so
/// the walk is deliberately generic.
fn fc_controllers(json: &str) -> Result<Vec<String>, DeviceError> {
    let root: Value = serde_json::from_str(json)?;
    let mut controllers = Vec::new();
    collect_fc_paths(&root, &mut controllers);
    Ok(controllers)
}

fn collect_fc_paths(value: &Value, controllers: &mut Vec<String>) {
    match value {
        Value::Array(entries) => {
            for entry in entries {
                collect_fc_paths(entry, controllers);
            }
        }
        Value::Object(map) => {
            let transport = map
                .get("Transport")
                .or_else(|| map.get("transport"))
                .and_then(Value::as_str);
            let name = map
                .get("Name")
                .or_else(|| map.get("name"))
                .and_then(Value::as_str);
            if let (Some("fc"), Some(name)) = (transport, name) {
                controllers.push(name.to_string());
            }
            for nested in map.values() {
                if nested.is_array() {
                    collect_fc_paths(nested, controllers);
                }
            }
        }
        _ => {}
    }
}
