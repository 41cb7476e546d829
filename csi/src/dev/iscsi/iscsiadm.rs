//! Thin interface to the iscsiadm command. Contains a function per
//! iSCSI operation we require, with the exit-code allow-lists that
//! distinguish benign conditions from real failures:
//! 15 = session already present, 21 = no objects found,
//! 255 = no records found.

use std::{env, sync::Arc};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::{
    error::DeviceError,
    shell::{CmdOutput, HostExec},
};

pub(crate) const ERR_SESS_EXISTS: i32 = 15;
pub(crate) const ERR_NO_OBJS_FOUND: i32 = 21;
pub(crate) const ERR_NO_RECORDS: i32 = 255;

/// An established session as reported by `iscsiadm -m session`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SessionRecord {
    pub sid: u32,
    pub portal: String,
    pub iqn: String,
}

impl SessionRecord {
    /// The listing reports the portal as `ip:port`; requests may carry
    /// the bare ip (iscsiadm defaults the port).
    pub fn serves(&self, portal: &str, iqn: &str) -> bool {
        if self.iqn != iqn {
            return false;
        }
        self.portal == portal
            || self.portal.starts_with(&format!("{}:", portal))
    }
}

pub(crate) struct IscsiAdmin {
    shell: Arc<dyn HostExec>,
    binary: String,
}

static ISCSIADM: Lazy<String> = Lazy::new(|| match env::var("ISCSIADM") {
    Ok(path) => {
        debug!("using environment: ISCSIADM={}", path);
        path
    }
    _ => "iscsiadm".to_string(),
});

impl IscsiAdmin {
    pub fn new(shell: Arc<dyn HostExec>) -> IscsiAdmin {
        IscsiAdmin {
            shell,
            binary: ISCSIADM.clone(),
        }
    }

    fn node_cmd(&self, portal: &str, iqn: &str, suffix: &str) -> String {
        format!(
            "{} -m node -T {} -p {}{}",
            self.binary, iqn, portal, suffix
        )
    }

    /// Ensure a node record exists for the target, creating it when the
    /// database has none.
    pub async fn ensure_node_record(
        &self,
        portal: &str,
        iqn: &str,
    ) -> Result<(), DeviceError> {
        let command = self.node_cmd(portal, iqn, "");
        let out = self.shell.exec(&command).await?.require_code(
            &command,
            &[ERR_NO_OBJS_FOUND, ERR_NO_RECORDS],
        )?;
        if out.success() {
            return Ok(());
        }
        let create =
            self.node_cmd(portal, iqn, " --interface default --op new");
        self.shell
            .exec(&create)
            .await?
            .require_success(&create)
            .map(drop)
    }

    async fn update_node_attr(
        &self,
        portal: &str,
        iqn: &str,
        key: &str,
        value: &str,
        redact_value: bool,
    ) -> Result<CmdOutput, DeviceError> {
        let suffix = format!(" --op update -n {} -v {}", key, value);
        let command = self.node_cmd(portal, iqn, &suffix);
        if redact_value {
            let display = self.node_cmd(
                portal,
                iqn,
                &format!(" --op update -n {} -v ***", key),
            );
            self.shell.exec_redacted(&command, &display).await
        } else {
            self.shell.exec(&command).await
        }
    }

    /// Put the session into manual scan mode so newly mapped LUNs only
    /// appear on our targeted scans. Old initiators reject the key;
    /// returns false then and the session stays in auto-scan.
    pub async fn set_manual_scan(
        &self,
        portal: &str,
        iqn: &str,
    ) -> Result<bool, DeviceError> {
        let out = self
            .update_node_attr(
                portal,
                iqn,
                "node.session.scan",
                "manual",
                false,
            )
            .await?;
        Ok(out.success())
    }

    /// Apply CHAP credentials to the node record. The secret never
    /// reaches the logs.
    pub async fn apply_chap(
        &self,
        portal: &str,
        iqn: &str,
        method: &str,
        user: &str,
        password: &str,
    ) -> Result<(), DeviceError> {
        self.update_node_attr(
            portal,
            iqn,
            "node.session.auth.authmethod",
            method,
            false,
        )
        .await?
        .require_success("iscsiadm --op update authmethod")?;
        self.update_node_attr(
            portal,
            iqn,
            "node.session.auth.username",
            user,
            false,
        )
        .await?
        .require_success("iscsiadm --op update username")?;
        self.update_node_attr(
            portal,
            iqn,
            "node.session.auth.password",
            password,
            true,
        )
        .await?
        .require_success("iscsiadm --op update password")?;
        Ok(())
    }

    /// List established sessions. No sessions at all is not an error.
    pub async fn sessions(&self) -> Result<Vec<SessionRecord>, DeviceError> {
        let command = format!("{} -m session", self.binary);
        let out = self
            .shell
            .exec(&command)
            .await?
            .require_code(&command, &[ERR_NO_OBJS_FOUND])?;
        Ok(parse_sessions(&out.output))
    }

    pub async fn login(
        &self,
        portal: &str,
        iqn: &str,
    ) -> Result<(), DeviceError> {
        let command = self.node_cmd(portal, iqn, " --login");
        self.shell
            .exec(&command)
            .await?
            .require_code(&command, &[ERR_SESS_EXISTS])
            .map(drop)
    }

    /// Flip the record's startup mode (`automatic` while attached,
    /// `manual` before logout so a reboot does not resurrect it).
    pub async fn set_startup(
        &self,
        portal: &str,
        iqn: &str,
        mode: &str,
    ) -> Result<(), DeviceError> {
        self.update_node_attr(portal, iqn, "node.startup", mode, false)
            .await?
            .require_success("iscsiadm --op update node.startup")
            .map(drop)
    }

    pub async fn logout(
        &self,
        portal: &str,
        iqn: &str,
    ) -> Result<(), DeviceError> {
        let command = self.node_cmd(portal, iqn, " --logout");
        self.shell
            .exec(&command)
            .await?
            .require_code(&command, &[ERR_NO_OBJS_FOUND, ERR_NO_RECORDS])
            .map(drop)
    }

    pub async fn delete_record(
        &self,
        portal: &str,
        iqn: &str,
    ) -> Result<(), DeviceError> {
        let command = self.node_cmd(portal, iqn, " --op delete");
        self.shell
            .exec(&command)
            .await?
            .require_code(&command, &[ERR_NO_OBJS_FOUND, ERR_NO_RECORDS])
            .map(drop)
    }
}

/// Parse `iscsiadm -m session` output, e.g.
/// `tcp: [3] 10.0.0.1:3260,1 iqn.2006-08.com.example:lun1 (non-flash)`.
fn parse_sessions(output: &str) -> Vec<SessionRecord> {
    static PATTERN: Lazy<Regex> = Lazy::new(|| {
        Regex::new(
            r"(?m)^tcp: \[(?P<sid>\d+)\] (?P<portal>\S+?),\S+ (?P<iqn>\S+)",
        )
        .unwrap()
    });

    PATTERN
        .captures_iter(output)
        .filter_map(|captures| {
            Some(SessionRecord {
                sid: captures.name("sid")?.as_str().parse().ok()?,
                portal: captures.name("portal")?.as_str().to_string(),
                iqn: captures.name("iqn")?.as_str().to_string(),
            })
        })
        .collect()
}
