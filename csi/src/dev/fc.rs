//! Fibre Channel transport. There is no login operation: zoning and LUN
//! masking happen on the fabric, so attach reduces to a wildcard scan of
//! every SCSI host followed by resolution of the LUN WWN.

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use tracing::debug;

use super::{
    assembly::{self, AssemblyParams, PortalOps, SharedPathState},
    ConnectRequest, DeviceStack, LunId, Transport, TransportOps,
};
use crate::error::DeviceError;

const SCSI_HOST_ROOT: &str = "/sys/class/scsi_host";

pub struct FcConnector {
    stack: DeviceStack,
    scsi_host_root: PathBuf,
}

impl FcConnector {
    pub fn new(stack: DeviceStack) -> FcConnector {
        FcConnector {
            stack,
            scsi_host_root: PathBuf::from(SCSI_HOST_ROOT),
        }
    }
}

#[async_trait]
impl TransportOps for FcConnector {
    fn transport(&self) -> Transport {
        Transport::Fc
    }

    fn stack(&self) -> &DeviceStack {
        &self.stack
    }

    async fn try_connect(
        &self,
        request: &ConnectRequest,
    ) -> Result<String, DeviceError> {
        let ConnectRequest::Fc(info) = request else {
            return Err(DeviceError::InvalidRequest {
                reason: "not an fc request".to_string(),
            });
        };
        let params = AssemblyParams::from_config(info.lun_wwn.clone(), true);
        let worker: Arc<dyn PortalOps> = Arc::new(FcScanOps {
            lun_wwn: info.lun_wwn.clone(),
            stack: self.stack.clone(),
            scsi_host_root: self.scsi_host_root.clone(),
        });
        assembly::establish(&self.stack, &params, vec![worker]).await
    }
}

struct FcScanOps {
    lun_wwn: LunId,
    stack: DeviceStack,
    scsi_host_root: PathBuf,
}

#[async_trait]
impl PortalOps for FcScanOps {
    fn label(&self) -> String {
        format!("fc {}", self.lun_wwn)
    }

    async fn ensure_session(&self) -> Result<(), DeviceError> {
        // connectivity is fabric-intrinsic
        Ok(())
    }

    async fn rescan(&self) -> Result<(), DeviceError> {
        for name in sysfs::list_names(&self.scsi_host_root)? {
            if !name.starts_with("host") {
                continue;
            }
            let dir = self.scsi_host_root.join(&name);
            debug!("wildcard scan of {}", name);
            if let Err(error) = sysfs::write_value(&dir, "scan", "- - -") {
                debug!("scan of {} failed: {}", name, error);
            }
        }
        Ok(())
    }

    async fn find_device(
        &self,
        state: &SharedPathState,
    ) -> Result<Option<String>, DeviceError> {
        let claimed = state.claimed_devices();
        if let Some(device) =
            self.stack.resolver.get_device(&claimed, &self.lun_wwn)
        {
            return Ok(Some(device));
        }
        // by-id aliases can lag a fabric scan; ask udev directly
        match self.stack.resolver.lookup_by_wwn(&self.lun_wwn) {
            Some(device) if !claimed.contains(&device) => Ok(Some(device)),
            _ => Ok(None),
        }
    }
}
