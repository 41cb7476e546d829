//! Interface to the storage array's management plane. The REST protocol
//! itself (login, request signing, error-code tables) lives outside this
//! crate; the attach logic only consumes the object model below. Every
//! membership query is explicit so callers can list-and-match instead of
//! add-and-swallow: the array uses disjoint numeric codes for "already
//! in group" per object type and those must never be confused with real
//! errors.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

pub type ClientResult<T> = Result<T, DeviceError>;

/// Array product family. Newer families take ALUA settings on the host
/// object, older ones on each initiator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProductFamily {
    DoradoV6,
    Legacy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InitiatorKind {
    Iscsi,
    Fc,
    Nvme,
}

impl std::fmt::Display for InitiatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let kind = match self {
            InitiatorKind::Iscsi => "iscsi",
            InitiatorKind::Fc => "fc",
            InitiatorKind::Nvme => "nvme",
        };
        write!(f, "{}", kind)
    }
}

/// A LUN as the array reports it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Lun {
    pub id: String,
    pub name: String,
    /// SCSI identity, 32 hex digits.
    pub wwn: String,
    /// NVMe namespace identity.
    pub nguid: String,
    pub capacity_bytes: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArrayHost {
    pub id: String,
    pub name: String,
}

/// Path-preference settings the array honours for active-active access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AluaSettings {
    pub enabled: bool,
    pub path_type: u32,
}

#[derive(Clone, Debug)]
pub struct Initiator {
    pub id: String,
    pub kind: InitiatorKind,
    /// Unparented and available for association.
    pub is_free: bool,
    pub parent_host: Option<String>,
    pub alua: Option<AluaSettings>,
}

/// An iSCSI target portal advertised by the array.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetPortal {
    pub portal: String,
    pub iqn: String,
}

/// Management operations of one array. Object getters return `None` for
/// absent objects; creators fail on true errors only (a name collision
/// is resolved by the implementation re-reading the object).
#[async_trait]
pub trait ArrayClient: Send + Sync {
    fn product_family(&self) -> ProductFamily;

    /// Establish a management session with the array.
    async fn login(&self) -> ClientResult<()>;

    /// Drop the management session.
    async fn logout(&self) -> ClientResult<()>;

    async fn get_lun_by_name(&self, name: &str) -> ClientResult<Option<Lun>>;

    async fn get_host_by_name(
        &self,
        name: &str,
    ) -> ClientResult<Option<ArrayHost>>;
    async fn create_host(&self, name: &str) -> ClientResult<ArrayHost>;
    async fn get_host_alua(
        &self,
        host_id: &str,
    ) -> ClientResult<Option<AluaSettings>>;
    async fn update_host_alua(
        &self,
        host_id: &str,
        alua: &AluaSettings,
    ) -> ClientResult<()>;

    async fn get_hostgroup_by_name(
        &self,
        name: &str,
    ) -> ClientResult<Option<String>>;
    async fn create_hostgroup(&self, name: &str) -> ClientResult<String>;
    async fn hosts_in_hostgroup(
        &self,
        group_id: &str,
    ) -> ClientResult<Vec<String>>;
    async fn add_host_to_hostgroup(
        &self,
        group_id: &str,
        host_id: &str,
    ) -> ClientResult<()>;

    async fn get_lungroup_by_name(
        &self,
        name: &str,
    ) -> ClientResult<Option<String>>;
    async fn create_lungroup(&self, name: &str) -> ClientResult<String>;
    async fn luns_in_lungroup(
        &self,
        group_id: &str,
    ) -> ClientResult<Vec<String>>;
    async fn add_lun_to_lungroup(
        &self,
        group_id: &str,
        lun_id: &str,
    ) -> ClientResult<()>;
    async fn remove_lun_from_lungroup(
        &self,
        group_id: &str,
        lun_id: &str,
    ) -> ClientResult<()>;

    async fn get_mapping_by_name(
        &self,
        name: &str,
    ) -> ClientResult<Option<String>>;
    async fn create_mapping(&self, name: &str) -> ClientResult<String>;
    async fn hostgroups_in_mapping(
        &self,
        mapping_id: &str,
    ) -> ClientResult<Vec<String>>;
    async fn lungroups_in_mapping(
        &self,
        mapping_id: &str,
    ) -> ClientResult<Vec<String>>;
    async fn associate_hostgroup(
        &self,
        mapping_id: &str,
        group_id: &str,
    ) -> ClientResult<()>;
    async fn associate_lungroup(
        &self,
        mapping_id: &str,
        group_id: &str,
    ) -> ClientResult<()>;

    async fn get_initiator(
        &self,
        kind: InitiatorKind,
        id: &str,
    ) -> ClientResult<Option<Initiator>>;
    async fn add_initiator(
        &self,
        kind: InitiatorKind,
        id: &str,
    ) -> ClientResult<Initiator>;
    async fn attach_initiator_to_host(
        &self,
        kind: InitiatorKind,
        id: &str,
        host_id: &str,
    ) -> ClientResult<()>;
    async fn update_initiator_alua(
        &self,
        kind: InitiatorKind,
        id: &str,
        alua: &AluaSettings,
    ) -> ClientResult<()>;

    /// The host-LUN number under which the mapping presents the LUN to
    /// this host.
    async fn host_lun_id(
        &self,
        host_id: &str,
        lun_id: &str,
    ) -> ClientResult<String>;

    async fn iscsi_portals(&self) -> ClientResult<Vec<TargetPortal>>;
    async fn roce_portals(&self) -> ClientResult<Vec<String>>;
}

/// Reference-counted array session shared by the flows of one plugin.
/// The first acquirer logs in, the last releaser logs out; the counter
/// and the login/logout transitions sit behind one async mutex so two
/// flows cannot race a login against a logout.
pub struct SharedClient {
    client: std::sync::Arc<dyn ArrayClient>,
    refs: tokio::sync::Mutex<u32>,
}

impl SharedClient {
    pub fn new(client: std::sync::Arc<dyn ArrayClient>) -> SharedClient {
        SharedClient {
            client,
            refs: tokio::sync::Mutex::new(0),
        }
    }

    pub fn client(&self) -> &std::sync::Arc<dyn ArrayClient> {
        &self.client
    }

    pub async fn acquire(&self) -> ClientResult<()> {
        let mut refs = self.refs.lock().await;
        if *refs == 0 {
            self.client.login().await?;
        }
        *refs += 1;
        Ok(())
    }

    pub async fn release(&self) {
        let mut refs = self.refs.lock().await;
        match *refs {
            0 => tracing::warn!("array session released more than acquired"),
            1 => {
                if let Err(error) = self.client.logout().await {
                    tracing::warn!("array logout failed: {}", error);
                }
                *refs = 0;
            }
            _ => *refs -= 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::FakeArray;
    use std::sync::Arc;

    #[tokio::test]
    async fn last_releaser_logs_out() {
        let array = FakeArray::new(ProductFamily::DoradoV6);
        let shared = SharedClient::new(array.clone() as Arc<dyn ArrayClient>);

        shared.acquire().await.unwrap();
        shared.acquire().await.unwrap();
        assert_eq!(array.count_calls("login"), 1);

        shared.release().await;
        assert_eq!(array.count_calls("logout"), 0);
        shared.release().await;
        assert_eq!(array.count_calls("logout"), 1);

        // over-release must not underflow or log out again
        shared.release().await;
        assert_eq!(array.count_calls("logout"), 1);
    }

    #[tokio::test]
    async fn a_new_acquire_logs_in_again() {
        let array = FakeArray::new(ProductFamily::DoradoV6);
        let shared = SharedClient::new(array.clone() as Arc<dyn ArrayClient>);

        shared.acquire().await.unwrap();
        shared.release().await;
        shared.acquire().await.unwrap();
        assert_eq!(array.count_calls("login"), 2);
    }
}
