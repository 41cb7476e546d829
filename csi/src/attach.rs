//! Bridge between a logical attach ("this LUN to this host over
//! protocol P") and the array's object model. Ensures the
//! host/hostgroup/lungroup/mapping chain exists and is wired up, binds
//! the host's initiators, applies ALUA preferences, and hands the portal
//! and host-LUN lists to the transport connectors.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

pub mod metro;

use crate::{
    client::{
        AluaSettings, ArrayClient, ArrayHost, InitiatorKind, Lun,
        ProductFamily, TargetPortal,
    },
    dev::{
        self, ChapConfig, ConnectRequest, FcConnectInfo, FcNvmeConnectInfo,
        IscsiConnectInfo, LunId, RoceConnectInfo, Transport,
    },
    error::DeviceError,
};

/// Identities of the local host's adapters on the fabrics.
#[derive(Clone, Debug, Default)]
pub struct HostInitiators {
    pub iqn: Option<String>,
    pub wwpns: Vec<String>,
    pub host_nqn: Option<String>,
}

#[derive(Clone, Debug)]
pub struct AttachRequest {
    pub lun_name: String,
    pub protocol: Transport,
    /// Host object name on the array; defaults to the node's hostname
    /// upstream, overridable per storage class.
    pub host_name: String,
    pub initiators: HostInitiators,
    pub alua: Option<AluaSettings>,
}

/// Everything a connector needs to reach the attached LUN.
#[derive(Clone, Debug, Default)]
pub struct AttachResult {
    /// WWN for SCSI transports, NGUID for NVMe ones.
    pub lun_unique_id: String,
    pub portals: Vec<String>,
    pub iqns: Vec<String>,
    pub host_luns: Vec<String>,
}

/// Attach operations exposed to the plugin layer. `MetroAttacher`
/// implements the same surface by composing two of these.
#[async_trait]
pub trait AttachOps: Send + Sync {
    async fn controller_attach(
        &self,
        request: &AttachRequest,
    ) -> Result<AttachResult, DeviceError>;

    /// Reverse of attach on the array side. Removes the LunGroup
    /// membership only: host, hostgroup and mapping are shared with
    /// other volumes and stay. Returns the LUN's unique id when the LUN
    /// still exists.
    async fn controller_detach(
        &self,
        lun_name: &str,
        host_name: &str,
    ) -> Result<Option<String>, DeviceError>;

    async fn iscsi_target_portals(
        &self,
    ) -> Result<Vec<TargetPortal>, DeviceError>;

    async fn roce_target_portals(&self) -> Result<Vec<String>, DeviceError>;

    /// Attach on the array and connect on the node, returning the local
    /// device path.
    async fn node_stage(
        &self,
        request: &AttachRequest,
        chap: Option<ChapConfig>,
        use_multipath: bool,
    ) -> Result<String, DeviceError> {
        let attach = self.controller_attach(request).await?;
        let connect = build_connect_request(
            request.protocol,
            &attach,
            chap,
            use_multipath,
        )?;
        let connector =
            dev::get_connector(request.protocol).ok_or_else(|| {
                DeviceError::NotRegistered {
                    transport: request.protocol.to_string(),
                }
            })?;
        connector.connect_volume(&connect).await
    }

    /// Disconnect the local device presenting the LUN.
    async fn node_unstage(
        &self,
        lun_unique_id: &LunId,
        protocol: Transport,
    ) -> Result<(), DeviceError> {
        let connector = dev::get_connector(protocol).ok_or_else(|| {
            DeviceError::NotRegistered {
                transport: protocol.to_string(),
            }
        })?;
        connector.disconnect_volume(lun_unique_id).await
    }
}

/// Translate an attach result into the transport's connect request.
pub fn build_connect_request(
    protocol: Transport,
    attach: &AttachResult,
    chap: Option<ChapConfig>,
    use_multipath: bool,
) -> Result<ConnectRequest, DeviceError> {
    let id = LunId::new(&attach.lun_unique_id);
    match protocol {
        Transport::Iscsi => Ok(ConnectRequest::Iscsi(IscsiConnectInfo::new(
            id,
            attach.portals.clone(),
            attach.iqns.clone(),
            attach.host_luns.clone(),
            chap,
            use_multipath,
        )?)),
        Transport::Fc => Ok(ConnectRequest::Fc(FcConnectInfo {
            lun_wwn: id,
        })),
        Transport::FcNvme => Ok(ConnectRequest::FcNvme(FcNvmeConnectInfo {
            lun_guid: id,
        })),
        Transport::Roce => Ok(ConnectRequest::Roce(RoceConnectInfo::new(
            id,
            attach.portals.clone(),
            use_multipath,
        )?)),
    }
}

/// Attacher against a single array.
pub struct Attacher {
    client: Arc<dyn ArrayClient>,
}

impl Attacher {
    pub fn new(client: Arc<dyn ArrayClient>) -> Attacher {
        Attacher {
            client,
        }
    }

    /// The unique identifier the node uses to verify device identity.
    pub fn lun_unique_id(protocol: Transport, lun: &Lun) -> String {
        if protocol.is_nvme() {
            lun.nguid.clone()
        } else {
            lun.wwn.clone()
        }
    }

    fn hostgroup_name(host: &str) -> String {
        format!("hg_{}", host)
    }

    fn lungroup_name(host: &str) -> String {
        format!("lg_{}", host)
    }

    fn mapping_name(host: &str) -> String {
        format!("map_{}", host)
    }

    async fn ensure_host(
        &self,
        name: &str,
    ) -> Result<ArrayHost, DeviceError> {
        if let Some(host) = self.client.get_host_by_name(name).await? {
            return Ok(host);
        }
        match self.client.create_host(name).await {
            Ok(host) => Ok(host),
            // a sibling node may have created it concurrently
            Err(error) => match self.client.get_host_by_name(name).await? {
                Some(host) => Ok(host),
                None => Err(error),
            },
        }
    }

    async fn ensure_hostgroup(
        &self,
        host: &ArrayHost,
    ) -> Result<String, DeviceError> {
        let name = Self::hostgroup_name(&host.name);
        let group_id = match self.client.get_hostgroup_by_name(&name).await? {
            Some(id) => id,
            None => self.client.create_hostgroup(&name).await?,
        };
        // membership is tested by listing, never by adding and
        // swallowing an "already exists" code
        let members = self.client.hosts_in_hostgroup(&group_id).await?;
        if !members.contains(&host.id) {
            self.client
                .add_host_to_hostgroup(&group_id, &host.id)
                .await?;
        }
        Ok(group_id)
    }

    async fn ensure_lungroup(
        &self,
        host_name: &str,
        lun: &Lun,
    ) -> Result<String, DeviceError> {
        let name = Self::lungroup_name(host_name);
        let group_id = match self.client.get_lungroup_by_name(&name).await? {
            Some(id) => id,
            None => self.client.create_lungroup(&name).await?,
        };
        let members = self.client.luns_in_lungroup(&group_id).await?;
        if !members.contains(&lun.id) {
            self.client.add_lun_to_lungroup(&group_id, &lun.id).await?;
        }
        Ok(group_id)
    }

    async fn ensure_mapping(
        &self,
        host_name: &str,
        hostgroup_id: &str,
        lungroup_id: &str,
    ) -> Result<String, DeviceError> {
        let name = Self::mapping_name(host_name);
        let mapping_id = match self.client.get_mapping_by_name(&name).await? {
            Some(id) => id,
            None => self.client.create_mapping(&name).await?,
        };
        let hostgroups =
            self.client.hostgroups_in_mapping(&mapping_id).await?;
        if !hostgroups.iter().any(|id| id == hostgroup_id) {
            self.client
                .associate_hostgroup(&mapping_id, hostgroup_id)
                .await?;
        }
        let lungroups =
            self.client.lungroups_in_mapping(&mapping_id).await?;
        if !lungroups.iter().any(|id| id == lungroup_id) {
            self.client
                .associate_lungroup(&mapping_id, lungroup_id)
                .await?;
        }
        Ok(mapping_id)
    }

    fn request_initiators(
        request: &AttachRequest,
    ) -> Result<Vec<(InitiatorKind, String)>, DeviceError> {
        let missing = |what: &str| DeviceError::InvalidRequest {
            reason: format!("{} initiator missing from request", what),
        };
        match request.protocol {
            Transport::Iscsi => {
                let iqn = request
                    .initiators
                    .iqn
                    .clone()
                    .ok_or_else(|| missing("iscsi"))?;
                Ok(vec![(InitiatorKind::Iscsi, iqn)])
            }
            Transport::Fc => {
                if request.initiators.wwpns.is_empty() {
                    return Err(missing("fc"));
                }
                Ok(request
                    .initiators
                    .wwpns
                    .iter()
                    .map(|wwpn| (InitiatorKind::Fc, wwpn.clone()))
                    .collect())
            }
            Transport::FcNvme | Transport::Roce => {
                let nqn = request
                    .initiators
                    .host_nqn
                    .clone()
                    .ok_or_else(|| missing("nvme"))?;
                Ok(vec![(InitiatorKind::Nvme, nqn)])
            }
        }
    }

    async fn ensure_initiator(
        &self,
        kind: InitiatorKind,
        id: &str,
        host: &ArrayHost,
    ) -> Result<(), DeviceError> {
        let initiator = match self.client.get_initiator(kind, id).await? {
            Some(initiator) => initiator,
            None => self.client.add_initiator(kind, id).await?,
        };
        match &initiator.parent_host {
            Some(parent) if parent == &host.id => {
                debug!("{} initiator {} already bound", kind, id);
                Ok(())
            }
            Some(parent) => Err(DeviceError::InitiatorConflict {
                initiator: id.to_string(),
                host: parent.clone(),
            }),
            None if initiator.is_free => {
                self.client
                    .attach_initiator_to_host(kind, id, &host.id)
                    .await
            }
            None => Err(DeviceError::InitiatorConflict {
                initiator: id.to_string(),
                host: "<unknown>".to_string(),
            }),
        }
    }

    /// Apply ALUA preferences where the product family takes them, and
    /// only when they differ from what the array already holds.
    async fn apply_alua(
        &self,
        request: &AttachRequest,
        host: &ArrayHost,
        initiators: &[(InitiatorKind, String)],
    ) -> Result<(), DeviceError> {
        let Some(wanted) = &request.alua else {
            return Ok(());
        };
        match self.client.product_family() {
            ProductFamily::DoradoV6 => {
                let current = self.client.get_host_alua(&host.id).await?;
                if current.as_ref() != Some(wanted) {
                    info!("updating host {} alua settings", host.name);
                    self.client.update_host_alua(&host.id, wanted).await?;
                }
            }
            ProductFamily::Legacy => {
                for (kind, id) in initiators {
                    let current = self
                        .client
                        .get_initiator(*kind, id)
                        .await?
                        .and_then(|initiator| initiator.alua);
                    if current.as_ref() != Some(wanted) {
                        info!("updating initiator {} alua settings", id);
                        self.client
                            .update_initiator_alua(*kind, id, wanted)
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AttachOps for Attacher {
    async fn controller_attach(
        &self,
        request: &AttachRequest,
    ) -> Result<AttachResult, DeviceError> {
        let lun = self
            .client
            .get_lun_by_name(&request.lun_name)
            .await?
            .ok_or_else(|| DeviceError::Array {
                reason: format!("lun {} not found", request.lun_name),
            })?;

        let host = self.ensure_host(&request.host_name).await?;
        let hostgroup_id = self.ensure_hostgroup(&host).await?;
        let lungroup_id = self.ensure_lungroup(&host.name, &lun).await?;
        self.ensure_mapping(&host.name, &hostgroup_id, &lungroup_id)
            .await?;

        let initiators = Self::request_initiators(request)?;
        for (kind, id) in &initiators {
            self.ensure_initiator(*kind, id, &host).await?;
        }
        self.apply_alua(request, &host, &initiators).await?;

        let host_lun = self.client.host_lun_id(&host.id, &lun.id).await?;
        let lun_unique_id = Self::lun_unique_id(request.protocol, &lun);

        let (portals, iqns) = match request.protocol {
            Transport::Iscsi => {
                let targets = self.client.iscsi_portals().await?;
                (
                    targets.iter().map(|t| t.portal.clone()).collect(),
                    targets.into_iter().map(|t| t.iqn).collect(),
                )
            }
            Transport::Roce => {
                (self.client.roce_portals().await?, Vec::new())
            }
            Transport::Fc | Transport::FcNvme => (Vec::new(), Vec::new()),
        };
        // one host-LUN entry per path, index-aligned with the portals
        let host_luns = if portals.is_empty() {
            vec![host_lun]
        } else {
            vec![host_lun; portals.len()]
        };

        Ok(AttachResult {
            lun_unique_id,
            portals,
            iqns,
            host_luns,
        })
    }

    async fn controller_detach(
        &self,
        lun_name: &str,
        host_name: &str,
    ) -> Result<Option<String>, DeviceError> {
        let Some(lun) = self.client.get_lun_by_name(lun_name).await? else {
            warn!("lun {} is gone from the array", lun_name);
            return Ok(None);
        };
        if let Some(group_id) = self
            .client
            .get_lungroup_by_name(&Self::lungroup_name(host_name))
            .await?
        {
            let members = self.client.luns_in_lungroup(&group_id).await?;
            if members.contains(&lun.id) {
                self.client
                    .remove_lun_from_lungroup(&group_id, &lun.id)
                    .await?;
            }
        }
        // host, hostgroup and mapping are shared and intentionally stay
        let id = if lun.wwn.is_empty() {
            lun.nguid
        } else {
            lun.wwn
        };
        Ok(Some(id))
    }

    async fn iscsi_target_portals(
        &self,
    ) -> Result<Vec<TargetPortal>, DeviceError> {
        self.client.iscsi_portals().await
    }

    async fn roce_target_portals(&self) -> Result<Vec<String>, DeviceError> {
        self.client.roce_portals().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::FakeArray;

    const WWN: &str = "6a00b08b000f1a2b0000000000000001";
    const NGUID: &str = "deadbeef001122330000000000000001";

    fn iscsi_request() -> AttachRequest {
        AttachRequest {
            lun_name: "pvc-1".to_string(),
            protocol: Transport::Iscsi,
            host_name: "node-a".to_string(),
            initiators: HostInitiators {
                iqn: Some("iqn.1994-05.com.example:node-a".to_string()),
                ..Default::default()
            },
            alua: None,
        }
    }

    fn seeded_array(family: ProductFamily) -> Arc<FakeArray> {
        let array = FakeArray::new(family);
        array.seed_lun("pvc-1", WWN, NGUID);
        array.seed_iscsi_portal("10.0.0.1", "iqn.x:1");
        array.seed_iscsi_portal("10.0.0.2", "iqn.x:2");
        array.seed_roce_portal("10.0.1.5");
        array
    }

    #[tokio::test]
    async fn attach_builds_the_whole_chain() {
        let array = seeded_array(ProductFamily::DoradoV6);
        let attacher = Attacher::new(array.clone());

        let result =
            attacher.controller_attach(&iscsi_request()).await.unwrap();

        assert_eq!(result.lun_unique_id, WWN);
        assert_eq!(result.portals, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(result.iqns, vec!["iqn.x:1", "iqn.x:2"]);
        assert_eq!(result.host_luns, vec!["1", "1"]);
        assert!(array.has_host("node-a"));
        assert!(array.lun_in_lungroup("lg_node-a", "pvc-1"));
        assert_eq!(array.count_calls("create_mapping map_node-a"), 1);
        assert_eq!(array.count_calls("associate_hostgroup"), 1);
        assert_eq!(array.count_calls("associate_lungroup"), 1);
        assert_eq!(array.count_calls("attach_initiator_to_host"), 1);
    }

    #[tokio::test]
    async fn attach_is_idempotent() {
        let array = seeded_array(ProductFamily::DoradoV6);
        let attacher = Attacher::new(array.clone());

        attacher.controller_attach(&iscsi_request()).await.unwrap();
        attacher.controller_attach(&iscsi_request()).await.unwrap();

        assert_eq!(array.count_calls("create_host"), 1);
        assert_eq!(array.count_calls("create_hostgroup"), 1);
        assert_eq!(array.count_calls("create_lungroup"), 1);
        assert_eq!(array.count_calls("create_mapping"), 1);
        assert_eq!(array.count_calls("add_host_to_hostgroup"), 1);
        assert_eq!(array.count_calls("add_lun_to_lungroup"), 1);
        assert_eq!(array.count_calls("associate_hostgroup"), 1);
        assert_eq!(array.count_calls("associate_lungroup"), 1);
        assert_eq!(array.count_calls("attach_initiator_to_host"), 1);
    }

    #[tokio::test]
    async fn foreign_initiator_aborts_with_a_conflict() {
        let array = seeded_array(ProductFamily::DoradoV6);
        array.seed_initiator(
            InitiatorKind::Iscsi,
            "iqn.1994-05.com.example:node-a",
            Some("H99"),
        );
        let attacher = Attacher::new(array.clone());

        let error = attacher
            .controller_attach(&iscsi_request())
            .await
            .unwrap_err();
        assert!(matches!(error, DeviceError::InitiatorConflict { .. }));
    }

    #[tokio::test]
    async fn alua_lands_on_the_host_for_dorado_and_only_on_change() {
        let array = seeded_array(ProductFamily::DoradoV6);
        let attacher = Attacher::new(array.clone());
        let mut request = iscsi_request();
        request.alua = Some(AluaSettings {
            enabled: true,
            path_type: 1,
        });

        attacher.controller_attach(&request).await.unwrap();
        assert_eq!(array.count_calls("update_host_alua"), 1);
        assert_eq!(array.count_calls("update_initiator_alua"), 0);

        // settings already match: no further update
        attacher.controller_attach(&request).await.unwrap();
        assert_eq!(array.count_calls("update_host_alua"), 1);
    }

    #[tokio::test]
    async fn alua_lands_on_the_initiator_for_legacy_arrays() {
        let array = seeded_array(ProductFamily::Legacy);
        let attacher = Attacher::new(array.clone());
        let mut request = iscsi_request();
        request.alua = Some(AluaSettings {
            enabled: true,
            path_type: 1,
        });

        attacher.controller_attach(&request).await.unwrap();
        attacher.controller_attach(&request).await.unwrap();
        assert_eq!(array.count_calls("update_initiator_alua"), 1);
        assert_eq!(array.count_calls("update_host_alua"), 0);
    }

    #[tokio::test]
    async fn nvme_protocols_use_the_nguid() {
        let array = seeded_array(ProductFamily::DoradoV6);
        let attacher = Attacher::new(array.clone());
        let request = AttachRequest {
            lun_name: "pvc-1".to_string(),
            protocol: Transport::Roce,
            host_name: "node-a".to_string(),
            initiators: HostInitiators {
                host_nqn: Some("nqn.2014-08.org:host-a".to_string()),
                ..Default::default()
            },
            alua: None,
        };

        let result = attacher.controller_attach(&request).await.unwrap();
        assert_eq!(result.lun_unique_id, NGUID);
        assert_eq!(result.portals, vec!["10.0.1.5"]);
        assert!(result.iqns.is_empty());
    }

    #[tokio::test]
    async fn detach_removes_the_lun_and_keeps_shared_objects() {
        let array = seeded_array(ProductFamily::DoradoV6);
        let attacher = Attacher::new(array.clone());
        attacher.controller_attach(&iscsi_request()).await.unwrap();

        let id = attacher
            .controller_detach("pvc-1", "node-a")
            .await
            .unwrap();
        assert_eq!(id, Some(WWN.to_string()));
        assert!(!array.lun_in_lungroup("lg_node-a", "pvc-1"));
        assert!(array.has_host("node-a"));
        assert_eq!(array.count_calls("remove_lun_from_lungroup"), 1);

        // detaching again touches nothing further
        attacher
            .controller_detach("pvc-1", "node-a")
            .await
            .unwrap();
        assert_eq!(array.count_calls("remove_lun_from_lungroup"), 1);
    }

    #[tokio::test]
    async fn missing_lun_is_an_array_error() {
        let array = FakeArray::new(ProductFamily::DoradoV6);
        let attacher = Attacher::new(array);
        let error = attacher
            .controller_attach(&iscsi_request())
            .await
            .unwrap_err();
        assert!(matches!(error, DeviceError::Array { .. }));
    }

    #[test]
    fn connect_requests_are_index_aligned() {
        let attach = AttachResult {
            lun_unique_id: WWN.to_string(),
            portals: vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
            iqns: vec!["iqn.x:1".to_string()],
            host_luns: vec!["1".to_string(), "1".to_string()],
        };
        // unequal lists must be rejected at construction
        assert!(build_connect_request(
            Transport::Iscsi,
            &attach,
            None,
            true
        )
        .is_err());
    }
}
