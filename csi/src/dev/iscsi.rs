//! iSCSI transport. One worker per `(portal, iqn)` establishes the
//! session through iscsiadm, issues targeted HCTL scans and watches the
//! session's sysfs tree for the block device carrying its host-LUN.

use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

mod iscsiadm;
use iscsiadm::IscsiAdmin;

use super::{
    assembly::{self, AssemblyParams, PortalOps, SharedPathState},
    ConnectRequest, DeviceStack, Transport, TransportOps,
};
use crate::{config, error::DeviceError};

const ISCSI_SESSION_ROOT: &str = "/sys/class/iscsi_session";
const SCSI_HOST_ROOT: &str = "/sys/class/scsi_host";

pub struct IscsiConnector {
    stack: DeviceStack,
    session_root: PathBuf,
    scsi_host_root: PathBuf,
}

impl IscsiConnector {
    pub fn new(stack: DeviceStack) -> IscsiConnector {
        IscsiConnector {
            stack,
            session_root: PathBuf::from(ISCSI_SESSION_ROOT),
            scsi_host_root: PathBuf::from(SCSI_HOST_ROOT),
        }
    }

    /// Tear down the session for one portal once the last LUN riding it
    /// is gone: flip the record to manual startup, log out, delete it.
    pub async fn logout_portal(
        &self,
        portal: &str,
        iqn: &str,
    ) -> Result<(), DeviceError> {
        let admin = IscsiAdmin::new(self.stack.shell.clone());
        if let Err(error) =
            admin.set_startup(portal, iqn, "manual").await
        {
            warn!("could not set node.startup=manual: {}", error);
        }
        admin.logout(portal, iqn).await?;
        admin.delete_record(portal, iqn).await
    }

    fn portal_ops(
        &self,
        info: &super::IscsiConnectInfo,
        index: usize,
    ) -> Arc<dyn PortalOps> {
        let cfg = config::config();
        Arc::new(IscsiPortalOps {
            portal: info.portals[index].clone(),
            iqn: info.iqns[index].clone(),
            host_lun: info.host_luns[index].clone(),
            chap: info.chap.clone(),
            stack: self.stack.clone(),
            admin: IscsiAdmin::new(self.stack.shell.clone()),
            session_root: self.session_root.clone(),
            scsi_host_root: self.scsi_host_root.clone(),
            login_attempts: cfg.login_poll_attempts,
            login_interval: cfg.login_poll_interval,
            sid: Mutex::new(None),
        })
    }
}

#[async_trait]
impl TransportOps for IscsiConnector {
    fn transport(&self) -> Transport {
        Transport::Iscsi
    }

    fn stack(&self) -> &DeviceStack {
        &self.stack
    }

    async fn try_connect(
        &self,
        request: &ConnectRequest,
    ) -> Result<String, DeviceError> {
        let ConnectRequest::Iscsi(info) = request else {
            return Err(DeviceError::InvalidRequest {
                reason: "not an iscsi request".to_string(),
            });
        };
        let params =
            AssemblyParams::from_config(info.lun_wwn.clone(), info.use_multipath);
        // single-path mode drives one portal only
        let count = if info.use_multipath {
            info.portals.len()
        } else {
            1
        };
        let portals =
            (0 .. count).map(|i| self.portal_ops(info, i)).collect();
        assembly::establish(&self.stack, &params, portals).await
    }
}

struct IscsiPortalOps {
    portal: String,
    iqn: String,
    host_lun: String,
    chap: Option<super::ChapConfig>,
    stack: DeviceStack,
    admin: IscsiAdmin,
    session_root: PathBuf,
    scsi_host_root: PathBuf,
    login_attempts: u32,
    login_interval: Duration,
    sid: Mutex<Option<u32>>,
}

/// HCTL address of the session's SCSI target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Hctl {
    host: u32,
    channel: u32,
    target: u32,
}

impl IscsiPortalOps {
    fn session_dir(&self, sid: u32) -> PathBuf {
        self.session_root
            .join(format!("session{}", sid))
            .join("device")
    }

    /// Locate the `targetH:C:T` child of the session device directory.
    fn find_hctl(&self, sid: u32) -> Option<Hctl> {
        let names = sysfs::list_names(&self.session_dir(sid)).ok()?;
        for name in names {
            if let Some(address) = name.strip_prefix("target") {
                let mut parts = address.splitn(3, ':');
                let host = parts.next()?.parse().ok()?;
                let channel = parts.next()?.parse().ok()?;
                let target = parts.next()?.parse().ok()?;
                return Some(Hctl {
                    host,
                    channel,
                    target,
                });
            }
        }
        None
    }

    async fn await_session(&self) -> Result<u32, DeviceError> {
        for _ in 0 .. self.login_attempts {
            if let Some(record) = self
                .admin
                .sessions()
                .await?
                .into_iter()
                .find(|record| record.serves(&self.portal, &self.iqn))
            {
                return Ok(record.sid);
            }
            tokio::time::sleep(self.login_interval).await;
        }
        Err(DeviceError::LoginFailed {
            portal: self.portal.clone(),
            reason: "session did not appear".to_string(),
        })
    }
}

#[async_trait]
impl PortalOps for IscsiPortalOps {
    fn label(&self) -> String {
        format!("iscsi {} {}", self.portal, self.iqn)
    }

    async fn ensure_session(&self) -> Result<(), DeviceError> {
        let login_error = |error: DeviceError| DeviceError::LoginFailed {
            portal: self.portal.clone(),
            reason: error.to_string(),
        };

        self.admin
            .ensure_node_record(&self.portal, &self.iqn)
            .await
            .map_err(login_error)?;

        match self.admin.set_manual_scan(&self.portal, &self.iqn).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    "{} does not support manual scan, staying in auto",
                    self.label()
                )
            }
            Err(error) => return Err(login_error(error)),
        }

        if let Some(chap) = &self.chap {
            self.admin
                .apply_chap(
                    &self.portal,
                    &self.iqn,
                    &chap.method,
                    &chap.user,
                    &chap.password,
                )
                .await
                .map_err(login_error)?;
        }

        // reuse an established session if one already serves the target
        if let Some(record) = self
            .admin
            .sessions()
            .await
            .map_err(login_error)?
            .into_iter()
            .find(|record| record.serves(&self.portal, &self.iqn))
        {
            debug!("{} reusing session {}", self.label(), record.sid);
            *self.sid.lock() = Some(record.sid);
            return Ok(());
        }

        self.admin
            .login(&self.portal, &self.iqn)
            .await
            .map_err(login_error)?;
        let sid = self.await_session().await?;
        *self.sid.lock() = Some(sid);

        if let Err(error) = self
            .admin
            .set_startup(&self.portal, &self.iqn, "automatic")
            .await
        {
            warn!("could not set node.startup=automatic: {}", error);
        }
        Ok(())
    }

    async fn rescan(&self) -> Result<(), DeviceError> {
        let sid = match *self.sid.lock() {
            Some(sid) => sid,
            None => return Err(DeviceError::new("no session to rescan")),
        };
        let (value, host) = match self.find_hctl(sid) {
            Some(hctl) => (
                format!("{} {} {}", hctl.channel, hctl.target, self.host_lun),
                hctl.host,
            ),
            None => {
                // the target may not have surfaced yet; wildcard scan
                let Some(host) = self.session_host(sid) else {
                    return Ok(());
                };
                ("- - -".to_string(), host)
            }
        };
        let host_dir = self.scsi_host_root.join(format!("host{}", host));
        debug!("{} scanning host{} with \"{}\"", self.label(), host, value);
        Ok(sysfs::write_value(&host_dir, "scan", value)?)
    }

    async fn find_device(
        &self,
        state: &SharedPathState,
    ) -> Result<Option<String>, DeviceError> {
        let sid = match *self.sid.lock() {
            Some(sid) => sid,
            None => return Ok(None),
        };
        let Some(hctl) = self.find_hctl(sid) else {
            return Ok(None);
        };
        let address = format!(
            "{}:{}:{}:{}",
            hctl.host, hctl.channel, hctl.target, self.host_lun
        );
        let block = self
            .session_dir(sid)
            .join(format!("target{}:{}:{}", hctl.host, hctl.channel, hctl.target))
            .join(&address)
            .join("block");
        let claimed = state.claimed_devices();
        for name in sysfs::list_names(&block)? {
            if claimed.contains(&name) {
                continue;
            }
            // the node must exist under /dev at the moment we adopt it
            if self.stack.resolver.exists(&name) {
                return Ok(Some(name));
            }
        }
        Ok(None)
    }
}

impl IscsiPortalOps {
    fn session_host(&self, sid: u32) -> Option<u32> {
        // without a target entry the session still names its host via
        // the `host` symlink exposed next to it
        let names = sysfs::list_names(&self.session_dir(sid)).ok()?;
        for name in names {
            if let Some(host) = name.strip_prefix("host") {
                if let Ok(host) = host.parse() {
                    return Some(host);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dev::{multipath::MultipathOps, DeviceResolver},
        shell::CmdOutput,
        testsupport::FakeShell,
    };
    use std::fs;

    const IQN: &str = "iqn.2006-08.com.example:lun1";

    struct Fixture {
        root: tempfile::TempDir,
        shell: Arc<FakeShell>,
    }

    impl Fixture {
        fn new() -> Fixture {
            Fixture {
                root: tempfile::tempdir().unwrap(),
                shell: FakeShell::new(),
            }
        }

        fn stack(&self) -> DeviceStack {
            let dev = self.root.path().join("dev");
            let by_id = dev.join("disk/by-id");
            let sys = self.root.path().join("sys/block");
            fs::create_dir_all(&by_id).unwrap();
            fs::create_dir_all(&sys).unwrap();
            DeviceStack {
                shell: self.shell.clone(),
                resolver: DeviceResolver::with_roots(&dev, &by_id, &sys),
                multipath: Arc::new(MultipathOps::with_sys_block(
                    self.shell.clone(),
                    sys,
                )),
            }
        }

        fn ops(&self) -> IscsiPortalOps {
            IscsiPortalOps {
                portal: "10.0.0.1".to_string(),
                iqn: IQN.to_string(),
                host_lun: "5".to_string(),
                chap: None,
                stack: self.stack(),
                admin: IscsiAdmin::new(self.shell.clone()),
                session_root: self.root.path().join("sys/class/iscsi_session"),
                scsi_host_root: self.root.path().join("sys/class/scsi_host"),
                login_attempts: 3,
                login_interval: Duration::from_millis(1),
                sid: Mutex::new(None),
            }
        }

        /// Build the sysfs tree of session `sid` exposing `device` at
        /// the given HCTL.
        fn add_session_tree(&self, sid: u32, device: &str) {
            let session = self
                .root
                .path()
                .join("sys/class/iscsi_session")
                .join(format!("session{}", sid))
                .join("device");
            let block = session.join("target12:0:0/12:0:0:5/block");
            fs::create_dir_all(block.join(device)).unwrap();
            fs::create_dir_all(
                self.root.path().join("sys/class/scsi_host/host12"),
            )
            .unwrap();
            let dev = self.root.path().join("dev");
            fs::create_dir_all(&dev).unwrap();
            fs::write(dev.join(device), "").unwrap();
        }
    }

    fn session_listing() -> CmdOutput {
        CmdOutput::ok(&format!(
            "tcp: [3] 10.0.0.1:3260,1 {} (non-flash)\n",
            IQN
        ))
    }

    #[tokio::test]
    async fn logs_in_when_no_session_exists() {
        let fx = Fixture::new();
        // no sessions before login, one after
        let logged_in = std::sync::atomic::AtomicBool::new(false);
        let listing = session_listing();
        fx.shell.on_fn(move |command| {
            if command.contains("--login") {
                logged_in.store(true, std::sync::atomic::Ordering::SeqCst);
                return Some(CmdOutput::ok(""));
            }
            if command.ends_with("-m session") {
                return Some(
                    if logged_in.load(std::sync::atomic::Ordering::SeqCst) {
                        listing.clone()
                    } else {
                        CmdOutput::failed(
                            iscsiadm::ERR_NO_OBJS_FOUND,
                            "iscsiadm: No active sessions.",
                        )
                    },
                );
            }
            None
        });

        let ops = fx.ops();
        ops.ensure_session().await.unwrap();
        assert_eq!(*ops.sid.lock(), Some(3));
        assert_eq!(fx.shell.count_calls("--login"), 1);
        assert_eq!(
            fx.shell.count_calls("-n node.startup -v automatic"),
            1
        );
    }

    #[tokio::test]
    async fn reuses_existing_sessions() {
        let fx = Fixture::new();
        fx.shell.on("-m session", session_listing());
        let ops = fx.ops();
        ops.ensure_session().await.unwrap();
        assert_eq!(*ops.sid.lock(), Some(3));
        assert_eq!(fx.shell.count_calls("--login"), 0);
    }

    #[tokio::test]
    async fn failed_login_is_reported_as_such() {
        let fx = Fixture::new();
        fx.shell.on(
            "-m session",
            CmdOutput::failed(
                iscsiadm::ERR_NO_OBJS_FOUND,
                "iscsiadm: No active sessions.",
            ),
        );
        fx.shell
            .on("--login", CmdOutput::failed(8, "login rejected"));
        let ops = fx.ops();
        let error = ops.ensure_session().await.unwrap_err();
        assert!(matches!(error, DeviceError::LoginFailed { .. }));
    }

    #[tokio::test]
    async fn rescan_targets_the_sessions_hctl() {
        let fx = Fixture::new();
        fx.add_session_tree(3, "sdb");
        let ops = fx.ops();
        *ops.sid.lock() = Some(3);

        ops.rescan().await.unwrap();
        let written = fs::read_to_string(
            fx.root.path().join("sys/class/scsi_host/host12/scan"),
        )
        .unwrap();
        assert_eq!(written, "0 0 5");
    }

    #[tokio::test]
    async fn finds_the_sessions_block_device() {
        let fx = Fixture::new();
        fx.add_session_tree(3, "sdb");
        let ops = fx.ops();
        *ops.sid.lock() = Some(3);

        let state = SharedPathState::new();
        assert_eq!(
            ops.find_device(&state).await.unwrap(),
            Some("sdb".to_string())
        );

        // a sibling already claimed it
        state.record_device("sdb");
        assert_eq!(ops.find_device(&state).await.unwrap(), None);
    }

    #[tokio::test]
    async fn logout_sequence_is_manual_logout_delete() {
        let fx = Fixture::new();
        let connector = IscsiConnector::new(fx.stack());
        connector.logout_portal("10.0.0.1", IQN).await.unwrap();
        let calls = fx.shell.calls();
        let startup = calls
            .iter()
            .position(|c| c.contains("-n node.startup -v manual"))
            .unwrap();
        let logout =
            calls.iter().position(|c| c.contains("--logout")).unwrap();
        let delete =
            calls.iter().position(|c| c.contains("--op delete")).unwrap();
        assert!(startup < logout && logout < delete);
    }
}
