//! Transport connectors: turning an abstract "connect this LUN" request
//! into a local block device path, and the inverse. Each transport
//! implements the session/scan primitives; the shared machinery here owns
//! request validation, the per-transport attach mutex, the bounded outer
//! retry loops and the connector registry.

use std::{collections::HashMap, collections::HashSet, sync::Arc};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

pub mod assembly;
pub mod fc;
pub mod fcnvme;
pub mod iscsi;
pub mod multipath;
pub mod resolver;
pub mod roce;

use crate::{config, error::DeviceError, shell::HostExec};
use multipath::MultipathOps;
pub use resolver::{DeviceResolver, LunId};

/// The transports a LUN can be presented over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transport {
    Iscsi,
    Fc,
    FcNvme,
    Roce,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Iscsi => "iscsi",
            Transport::Fc => "fc",
            Transport::FcNvme => "fc-nvme",
            Transport::Roce => "roce",
        }
    }

    /// Whether LUN identity on this transport is an NVMe GUID rather
    /// than a SCSI WWN.
    pub fn is_nvme(&self) -> bool {
        matches!(self, Transport::FcNvme | Transport::Roce)
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// CHAP credentials for iSCSI sessions.
#[derive(Clone, Debug)]
pub struct ChapConfig {
    pub user: String,
    pub password: String,
    pub method: String,
}

/// iSCSI connect parameters. The three portal-indexed lists are parallel:
/// index i describes path i.
#[derive(Debug)]
pub struct IscsiConnectInfo {
    pub lun_wwn: LunId,
    pub portals: Vec<String>,
    pub iqns: Vec<String>,
    pub host_luns: Vec<String>,
    pub chap: Option<ChapConfig>,
    pub use_multipath: bool,
}

impl IscsiConnectInfo {
    pub fn new(
        lun_wwn: LunId,
        portals: Vec<String>,
        iqns: Vec<String>,
        host_luns: Vec<String>,
        chap: Option<ChapConfig>,
        use_multipath: bool,
    ) -> Result<IscsiConnectInfo, DeviceError> {
        if portals.is_empty() {
            return Err(DeviceError::InvalidRequest {
                reason: "no target portals".to_string(),
            });
        }
        if portals.len() != iqns.len() || portals.len() != host_luns.len() {
            return Err(DeviceError::InvalidRequest {
                reason: format!(
                    "portal/target/lun lists must align: {}/{}/{}",
                    portals.len(),
                    iqns.len(),
                    host_luns.len()
                ),
            });
        }
        Ok(IscsiConnectInfo {
            lun_wwn,
            portals,
            iqns,
            host_luns,
            chap,
            use_multipath,
        })
    }
}

/// FC connect parameters: the HBA fabric resolves targets, so only the
/// LUN identity travels.
pub struct FcConnectInfo {
    pub lun_wwn: LunId,
}

/// FC-NVMe connect parameters.
pub struct FcNvmeConnectInfo {
    pub lun_guid: LunId,
}

/// NVMe-over-RoCE connect parameters. Target NQNs are discovered at
/// runtime per portal.
pub struct RoceConnectInfo {
    pub lun_guid: LunId,
    pub portals: Vec<String>,
    pub use_multipath: bool,
}

impl RoceConnectInfo {
    pub fn new(
        lun_guid: LunId,
        portals: Vec<String>,
        use_multipath: bool,
    ) -> Result<RoceConnectInfo, DeviceError> {
        if portals.is_empty() {
            return Err(DeviceError::InvalidRequest {
                reason: "no target portals".to_string(),
            });
        }
        Ok(RoceConnectInfo {
            lun_guid,
            portals,
            use_multipath,
        })
    }
}

/// One connect request, tagged per transport and validated at
/// construction.
pub enum ConnectRequest {
    Iscsi(IscsiConnectInfo),
    Fc(FcConnectInfo),
    FcNvme(FcNvmeConnectInfo),
    Roce(RoceConnectInfo),
}

impl ConnectRequest {
    pub fn transport(&self) -> Transport {
        match self {
            ConnectRequest::Iscsi(_) => Transport::Iscsi,
            ConnectRequest::Fc(_) => Transport::Fc,
            ConnectRequest::FcNvme(_) => Transport::FcNvme,
            ConnectRequest::Roce(_) => Transport::Roce,
        }
    }

    pub fn lun_id(&self) -> &LunId {
        match self {
            ConnectRequest::Iscsi(info) => &info.lun_wwn,
            ConnectRequest::Fc(info) => &info.lun_wwn,
            ConnectRequest::FcNvme(info) => &info.lun_guid,
            ConnectRequest::Roce(info) => &info.lun_guid,
        }
    }
}

/// The bundle of host-facing facilities every transport works through.
#[derive(Clone)]
pub struct DeviceStack {
    pub shell: Arc<dyn HostExec>,
    pub resolver: DeviceResolver,
    pub multipath: Arc<MultipathOps>,
}

impl DeviceStack {
    pub fn new(shell: Arc<dyn HostExec>) -> DeviceStack {
        let multipath = Arc::new(MultipathOps::new(shell.clone()));
        DeviceStack {
            shell,
            resolver: DeviceResolver::default(),
            multipath,
        }
    }

    /// Verify a plain device presents the expected identity. A mismatch
    /// means a stale or foreign device answered the scan: it is removed
    /// before the error is returned so it cannot be handed out later.
    pub async fn verify_single_device(
        &self,
        name: &str,
        expected: &LunId,
    ) -> Result<(), DeviceError> {
        let actual = self.resolver.device_identity(name)?;
        if expected.matches(&actual) {
            return Ok(());
        }
        warn!(
            "device {} identity {} does not match {}, removing it",
            name, actual, expected
        );
        if let Err(error) = self.multipath.remove_member(name) {
            warn!("failed to remove mismatched device {}: {}", name, error);
        }
        Err(DeviceError::IdentityMismatch {
            device: name.to_string(),
            actual,
            expected: expected.to_string(),
        })
    }

    /// Verify an assembled dm map aggregates the expected LUN. A mismatch
    /// flushes the map before the error is returned.
    pub async fn verify_multipath_device(
        &self,
        dm: &str,
        expected: &LunId,
    ) -> Result<(), DeviceError> {
        let actual = self.resolver.dm_identity(dm)?;
        if expected.matches_dm_uuid(&actual) {
            return Ok(());
        }
        warn!(
            "dm {} uuid {} does not match {}, flushing it",
            dm, actual, expected
        );
        if let Err(error) = self.multipath.flush(dm).await {
            warn!("failed to flush mismatched map {}: {}", dm, error);
        }
        Err(DeviceError::IdentityMismatch {
            device: dm.to_string(),
            actual,
            expected: expected.to_string(),
        })
    }
}

/// Per-transport session and teardown primitives, consumed by the shared
/// connector machinery.
#[async_trait]
pub(crate) trait TransportOps: Send + Sync {
    fn transport(&self) -> Transport;

    fn stack(&self) -> &DeviceStack;

    /// One attach attempt: establish sessions, scan, assemble, verify.
    async fn try_connect(
        &self,
        request: &ConnectRequest,
    ) -> Result<String, DeviceError>;

    /// Transport-specific teardown once the identifier no longer
    /// resolves to a device (e.g. dropping a fabrics controller).
    async fn post_disconnect(&self, _id: &LunId) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// Retry budgets of the connector outer loops, snapshotted from the
/// global config at construction.
#[derive(Clone, Debug)]
pub(crate) struct RetryParams {
    pub connect_retries: u32,
    pub connect_interval: std::time::Duration,
    pub disconnect_retries: u32,
    pub disconnect_interval: std::time::Duration,
    pub resolve_attempts: u32,
    pub resolve_interval: std::time::Duration,
}

impl RetryParams {
    fn from_config() -> RetryParams {
        let cfg = config::config();
        RetryParams {
            connect_retries: cfg.connect_retries,
            connect_interval: cfg.connect_retry_interval,
            disconnect_retries: cfg.disconnect_retries,
            disconnect_interval: cfg.disconnect_retry_interval,
            resolve_attempts: cfg.disconnect_resolve_attempts,
            resolve_interval: cfg.disconnect_resolve_interval,
        }
    }
}

/// A registered transport connector. Owns the attach mutex serializing
/// connect and disconnect on this node: the host CLIs mutate shared
/// kernel state and interleaving them produces undefined sessions.
pub struct Connector {
    ops: Box<dyn TransportOps>,
    lock: tokio::sync::Mutex<()>,
    retry: RetryParams,
}

impl Connector {
    pub(crate) fn new(ops: Box<dyn TransportOps>) -> Connector {
        Connector {
            ops,
            lock: tokio::sync::Mutex::new(()),
            retry: RetryParams::from_config(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_retry(
        ops: Box<dyn TransportOps>,
        retry: RetryParams,
    ) -> Connector {
        Connector {
            ops,
            lock: tokio::sync::Mutex::new(()),
            retry,
        }
    }

    pub fn transport(&self) -> Transport {
        self.ops.transport()
    }

    /// Attach the LUN and return the local device path. Retried only on
    /// the device-not-found sentinel; every other error is final.
    pub async fn connect_volume(
        &self,
        request: &ConnectRequest,
    ) -> Result<String, DeviceError> {
        if request.transport() != self.ops.transport() {
            return Err(DeviceError::InvalidRequest {
                reason: format!(
                    "request for {} sent to {} connector",
                    request.transport(),
                    self.ops.transport()
                ),
            });
        }
        let _serialized = self.lock.lock().await;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.ops.try_connect(request).await {
                Err(error)
                    if error.is_volume_not_found()
                        && attempt < self.retry.connect_retries =>
                {
                    warn!(
                        "connect attempt {} for {} failed: {}, retrying",
                        attempt,
                        request.lun_id(),
                        error
                    );
                    tokio::time::sleep(self.retry.connect_interval).await;
                }
                outcome => {
                    if let Ok(path) = &outcome {
                        info!(
                            "volume {} attached at {}",
                            request.lun_id(),
                            path
                        );
                    }
                    return outcome;
                }
            }
        }
    }

    /// Detach whatever device currently presents the identifier. The
    /// mutex is held for the entire teardown sequence so a concurrent
    /// re-attach cannot race a half-removed device.
    pub async fn disconnect_volume(
        &self,
        id: &LunId,
    ) -> Result<(), DeviceError> {
        let _serialized = self.lock.lock().await;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_disconnect(id).await {
                Ok(()) => {
                    if let Err(error) = self.ops.post_disconnect(id).await {
                        warn!(
                            "post-disconnect cleanup for {} failed: {}",
                            id, error
                        );
                    }
                    return Ok(());
                }
                Err(error) if attempt < self.retry.disconnect_retries => {
                    warn!(
                        "disconnect attempt {} for {} failed: {}, retrying",
                        attempt, id, error
                    );
                    tokio::time::sleep(self.retry.disconnect_interval).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn try_disconnect(&self, id: &LunId) -> Result<(), DeviceError> {
        let stack = self.ops.stack();
        let exclude = HashSet::new();

        for _ in 0 .. self.retry.resolve_attempts {
            let device = match stack.resolver.get_device(&exclude, id) {
                None => {
                    debug!("{} no longer resolves to a device", id);
                    return Ok(());
                }
                Some(device) => device,
            };
            if device.starts_with("dm-") {
                let slaves = stack.resolver.dm_slaves(&device);
                debug!(
                    "flushing {} with members {:?} for {}",
                    device, slaves, id
                );
                if let Err(error) = stack
                    .multipath
                    .flush_with_members(&device, &slaves)
                    .await
                {
                    warn!("flush of {} failed: {}", device, error);
                }
            } else if let Err(error) = stack.multipath.remove_member(&device)
            {
                warn!("removal of {} failed: {}", device, error);
            }
            tokio::time::sleep(self.retry.resolve_interval).await;
        }
        Err(DeviceError::DisconnectTimeout {
            id: id.to_string(),
        })
    }
}

static CONNECTORS: Lazy<RwLock<HashMap<Transport, Arc<Connector>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a connector. Fails if the transport already has one; the
/// registry is populated once at startup and read-only thereafter.
pub fn register_connector(
    connector: Arc<Connector>,
) -> Result<(), DeviceError> {
    let mut connectors = CONNECTORS.write();
    let transport = connector.transport();
    if connectors.contains_key(&transport) {
        return Err(DeviceError::AlreadyRegistered {
            transport: transport.to_string(),
        });
    }
    connectors.insert(transport, connector);
    Ok(())
}

pub fn get_connector(transport: Transport) -> Option<Arc<Connector>> {
    CONNECTORS.read().get(&transport).cloned()
}

/// Build and register a connector per transport. Called during program
/// startup, before any attach can be dispatched.
pub fn register_all_connectors(
    shell: Arc<dyn HostExec>,
) -> Result<(), DeviceError> {
    let stack = DeviceStack::new(shell);
    register_connector(Arc::new(Connector::new(Box::new(
        iscsi::IscsiConnector::new(stack.clone()),
    ))))?;
    register_connector(Arc::new(Connector::new(Box::new(
        fc::FcConnector::new(stack.clone()),
    ))))?;
    register_connector(Arc::new(Connector::new(Box::new(
        fcnvme::FcNvmeConnector::new(stack.clone()),
    ))))?;
    register_connector(Arc::new(Connector::new(Box::new(
        roce::RoceConnector::new(stack),
    ))))?;
    Ok(())
}
