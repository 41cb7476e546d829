//! Attacher for hypermetro LUNs: the volume is active-active across two
//! arrays, so attach runs against both sites and the merged portal list
//! lets a single multipath assembly aggregate paths from both.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{AttachOps, AttachRequest, AttachResult, Attacher};
use crate::{client::TargetPortal, error::DeviceError};

pub struct MetroAttacher {
    local: Arc<Attacher>,
    remote: Arc<Attacher>,
}

impl MetroAttacher {
    pub fn new(local: Arc<Attacher>, remote: Arc<Attacher>) -> MetroAttacher {
        MetroAttacher {
            local,
            remote,
        }
    }
}

#[async_trait]
impl AttachOps for MetroAttacher {
    /// Attach on both sites. Either side failing rolls back the side
    /// that succeeded, so a half-attached pair never leaks. The merged
    /// result carries 2N index-aligned paths.
    async fn controller_attach(
        &self,
        request: &AttachRequest,
    ) -> Result<AttachResult, DeviceError> {
        let local = self.local.controller_attach(request).await?;

        let remote = match self.remote.controller_attach(request).await {
            Ok(remote) => remote,
            Err(error) => {
                warn!(
                    "remote site attach of {} failed: {}, rolling back",
                    request.lun_name, error
                );
                if let Err(rollback) = self
                    .local
                    .controller_detach(&request.lun_name, &request.host_name)
                    .await
                {
                    warn!(
                        "local rollback of {} failed: {}",
                        request.lun_name, rollback
                    );
                }
                return Err(error);
            }
        };

        if remote.lun_unique_id != local.lun_unique_id {
            warn!(
                "metro pair identity diverges: local {}, remote {}",
                local.lun_unique_id, remote.lun_unique_id
            );
        }

        let mut merged = local;
        merged.portals.extend(remote.portals);
        merged.iqns.extend(remote.iqns);
        merged.host_luns.extend(remote.host_luns);
        info!(
            "metro attach of {} spans {} paths",
            request.lun_name,
            merged.portals.len().max(merged.host_luns.len())
        );
        Ok(merged)
    }

    /// Detach on both sites, tolerating one of them being offline. The
    /// returned identifier prefers the local site's answer.
    async fn controller_detach(
        &self,
        lun_name: &str,
        host_name: &str,
    ) -> Result<Option<String>, DeviceError> {
        let local = self.local.controller_detach(lun_name, host_name).await;
        let remote =
            self.remote.controller_detach(lun_name, host_name).await;

        match (local, remote) {
            (Ok(local_id), Ok(remote_id)) => Ok(local_id.or(remote_id)),
            (Ok(local_id), Err(error)) => {
                warn!("remote site detach failed: {}", error);
                Ok(local_id)
            }
            (Err(error), Ok(remote_id)) => {
                warn!("local site detach failed: {}", error);
                Ok(remote_id)
            }
            (Err(error), Err(remote_error)) => {
                warn!("both sites failed to detach: {}", remote_error);
                Err(error)
            }
        }
    }

    async fn iscsi_target_portals(
        &self,
    ) -> Result<Vec<TargetPortal>, DeviceError> {
        let mut portals = self.local.iscsi_target_portals().await?;
        portals.extend(self.remote.iscsi_target_portals().await?);
        Ok(portals)
    }

    async fn roce_target_portals(&self) -> Result<Vec<String>, DeviceError> {
        let mut portals = self.local.roce_target_portals().await?;
        portals.extend(self.remote.roce_target_portals().await?);
        Ok(portals)
    }
}
