//! Mapping between a LUN identifier and a kernel block device. SCSI LUNs
//! are identified by a 32-hex-digit WWN, NVMe namespaces by a GUID/NGUID;
//! both are treated as opaque case-insensitive tokens matched against the
//! udev-maintained `/dev/disk/by-id` aliases and the sysfs `wwid`
//! attributes.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use crate::error::DeviceError;

/// A normalized LUN identifier. Normalization (trim + lowercase) happens
/// exactly once, here; all later comparisons are on the normalized form.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LunId(String);

impl LunId {
    pub fn new(raw: &str) -> LunId {
        LunId(raw.trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Match against a raw identity string read from sysfs or udev. The
    /// kernel prefixes identities with a type tag (`naa.`, `eui.`,
    /// `t10.`, `0x`), so containment of the normalized token is the
    /// comparison.
    pub fn matches(&self, raw: &str) -> bool {
        raw.trim().to_lowercase().contains(&self.0)
    }

    /// Match against a device-mapper uuid (`mpath-3<wwn>`); the first six
    /// bytes are the multipath prefix and do not take part.
    pub fn matches_dm_uuid(&self, raw: &str) -> bool {
        let trimmed = raw.trim();
        if trimmed.len() <= 6 {
            return false;
        }
        self.matches(&trimmed[6 ..])
    }
}

impl std::fmt::Display for LunId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compute the WWID the multipath daemon expects: a type code derived
/// from the identity prefix (`t10.` 1, `eui.` 2, `naa.` 3, anything else
/// 8) prepended to the remainder.
pub(crate) fn typed_wwid(raw: &str) -> String {
    let raw = raw.trim();
    for (prefix, code) in [("t10.", "1"), ("eui.", "2"), ("naa.", "3")] {
        if let Some(rest) = raw.strip_prefix(prefix) {
            return format!("{}{}", code, rest);
        }
    }
    format!("8{}", raw)
}

/// Resolves identifiers to device names through `/dev/disk/by-id` and
/// reads device identity out of sysfs. The roots are fields so tests can
/// point the resolver at a scratch tree.
#[derive(Clone, Debug)]
pub struct DeviceResolver {
    dev: PathBuf,
    by_id: PathBuf,
    sys_block: PathBuf,
}

impl Default for DeviceResolver {
    fn default() -> Self {
        DeviceResolver {
            dev: PathBuf::from("/dev"),
            by_id: PathBuf::from("/dev/disk/by-id"),
            sys_block: PathBuf::from("/sys/block"),
        }
    }
}

impl DeviceResolver {
    pub fn with_roots(dev: &Path, by_id: &Path, sys_block: &Path) -> Self {
        DeviceResolver {
            dev: dev.to_path_buf(),
            by_id: by_id.to_path_buf(),
            sys_block: sys_block.to_path_buf(),
        }
    }

    /// Find the device currently presenting the identifier. Preference
    /// order: an assembled `dm-*` first, then any unclaimed `nvme*`, then
    /// any unclaimed `sd*`. `exclude` carries devices already consumed by
    /// earlier workers of the same attach.
    pub fn get_device(
        &self,
        exclude: &HashSet<String>,
        id: &LunId,
    ) -> Option<String> {
        let mut nvme: Option<String> = None;
        let mut scsi: Option<String> = None;

        let entries = fs::read_dir(&self.by_id).ok()?;
        for entry in entries.flatten() {
            let alias = entry.file_name().to_string_lossy().to_string();
            if !id.matches(&alias) {
                continue;
            }
            let target = match fs::read_link(entry.path()) {
                Ok(target) => target,
                Err(_) => continue,
            };
            let name = match target.file_name() {
                Some(name) => name.to_string_lossy().to_string(),
                None => continue,
            };
            // the alias may outlive the device it pointed at
            if !self.exists(&name) {
                continue;
            }
            if name.starts_with("dm-") {
                return Some(name);
            } else if name.starts_with("nvme") && !exclude.contains(&name) {
                nvme.get_or_insert(name);
            } else if name.starts_with("sd") && !exclude.contains(&name) {
                scsi.get_or_insert(name);
            }
        }
        nvme.or(scsi)
    }

    /// Whether `/dev/<name>` exists right now.
    pub fn exists(&self, name: &str) -> bool {
        self.dev.join(name).exists()
    }

    pub fn dev_path(&self, name: &str) -> String {
        self.dev.join(name).display().to_string()
    }

    /// Read the identity of a plain block device. SCSI devices publish it
    /// at `device/wwid`, NVMe namespaces at `wwid`; either may be absent
    /// on older kernels so both are consulted.
    pub fn device_identity(
        &self,
        name: &str,
    ) -> Result<String, DeviceError> {
        let dir = self.sys_block.join(name);
        let primary = if name.starts_with("nvme") {
            "wwid"
        } else {
            "device/wwid"
        };
        match sysfs::read_trimmed(&dir, primary) {
            Ok(value) if !value.is_empty() => Ok(value),
            _ => {
                let fallback = if primary == "wwid" {
                    "device/wwid"
                } else {
                    "wwid"
                };
                sysfs::read_trimmed(&dir, fallback).map_err(|_| {
                    DeviceError::new(&format!(
                        "no wwid published for device {}",
                        name
                    ))
                })
            }
        }
    }

    /// Read the uuid of an assembled device-mapper device.
    pub fn dm_identity(&self, dm: &str) -> Result<String, DeviceError> {
        Ok(sysfs::read_trimmed(&self.sys_block.join(dm), "dm/uuid")?)
    }

    /// List the member (slave) devices of a dm map.
    pub fn dm_slaves(&self, dm: &str) -> Vec<String> {
        sysfs::list_names(&self.sys_block.join(dm).join("slaves"))
            .unwrap_or_default()
    }

    /// Scan `/sys/block` for a device publishing the identifier. Used by
    /// the NVMe transports right after a controller rescan, before udev
    /// has produced by-id aliases for the new namespace.
    pub fn find_by_sysfs_wwid(
        &self,
        exclude: &HashSet<String>,
        id: &LunId,
    ) -> Option<String> {
        let names = sysfs::list_names(&self.sys_block).ok()?;
        for name in names {
            if !name.starts_with("nvme") && !name.starts_with("sd") {
                continue;
            }
            if exclude.contains(&name) || !self.exists(&name) {
                continue;
            }
            if let Ok(identity) = self.device_identity(&name) {
                if id.matches(&identity) {
                    return Some(name);
                }
            }
        }
        None
    }

    /// Fallback lookup through the udev database for transports whose
    /// by-id aliases lag behind the kernel (FC after a fabric scan).
    pub fn lookup_by_wwn(&self, id: &LunId) -> Option<String> {
        let mut enumerator = udev::Enumerator::new().ok()?;
        enumerator.match_subsystem("block").ok()?;
        enumerator.match_property("DEVTYPE", "disk").ok()?;
        for device in enumerator.scan_devices().ok()? {
            let wwn = match device.property_value("ID_WWN") {
                Some(value) => value.to_string_lossy().to_string(),
                None => continue,
            };
            if !id.matches(&wwn) {
                continue;
            }
            if let Some(devname) = device.property_value("DEVNAME") {
                let devname = devname.to_string_lossy();
                if let Some(name) = devname.rsplit('/').next() {
                    if self.exists(name) {
                        return Some(name.to_string());
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    const WWN: &str = "6a00b08b000f1a2b0000000000000001";

    struct Tree {
        _root: tempfile::TempDir,
        dev: PathBuf,
        by_id: PathBuf,
        sys: PathBuf,
    }

    fn tree() -> Tree {
        let root = tempfile::tempdir().unwrap();
        let dev = root.path().join("dev");
        let by_id = dev.join("disk/by-id");
        let sys = root.path().join("sys/block");
        fs::create_dir_all(&by_id).unwrap();
        fs::create_dir_all(&sys).unwrap();
        Tree {
            _root: root,
            dev,
            by_id,
            sys,
        }
    }

    fn add_device(t: &Tree, alias: &str, name: &str) {
        fs::write(t.dev.join(name), "").unwrap();
        symlink(format!("../../{}", name), t.by_id.join(alias)).unwrap();
    }

    fn resolver(t: &Tree) -> DeviceResolver {
        DeviceResolver::with_roots(&t.dev, &t.by_id, &t.sys)
    }

    #[test]
    fn prefers_dm_over_path_devices() {
        let t = tree();
        add_device(&t, &format!("scsi-3{}", WWN), "sdb");
        add_device(&t, &format!("dm-uuid-mpath-3{}", WWN), "dm-3");
        let id = LunId::new(WWN);
        assert_eq!(
            resolver(&t).get_device(&HashSet::new(), &id),
            Some("dm-3".to_string())
        );
    }

    #[test]
    fn prefers_nvme_over_scsi_and_honours_exclusions() {
        let t = tree();
        add_device(&t, &format!("scsi-3{}", WWN), "sdb");
        add_device(&t, &format!("nvme-eui.{}", WWN), "nvme0n1");
        let id = LunId::new(WWN);
        let r = resolver(&t);
        assert_eq!(
            r.get_device(&HashSet::new(), &id),
            Some("nvme0n1".to_string())
        );

        let mut exclude = HashSet::new();
        exclude.insert("nvme0n1".to_string());
        assert_eq!(r.get_device(&exclude, &id), Some("sdb".to_string()));
    }

    #[test]
    fn ignores_aliases_whose_device_is_gone() {
        let t = tree();
        // alias present, device node already removed
        symlink("../../sdz", t.by_id.join(format!("scsi-3{}", WWN)))
            .unwrap();
        let id = LunId::new(WWN);
        assert_eq!(resolver(&t).get_device(&HashSet::new(), &id), None);
    }

    #[test]
    fn matching_is_case_insensitive() {
        let id = LunId::new(&WWN.to_uppercase());
        assert!(id.matches(&format!("naa.{}", WWN)));
        assert!(id.matches_dm_uuid(&format!("mpath-3{}", WWN)));
        assert!(!id.matches_dm_uuid("mpath-3deadbeef"));
    }

    #[test]
    fn reads_device_identity_with_fallback() {
        let t = tree();
        let sd = t.sys.join("sdb/device");
        fs::create_dir_all(&sd).unwrap();
        fs::write(sd.join("wwid"), format!("naa.{}\n", WWN)).unwrap();
        let nvme = t.sys.join("nvme0n1");
        fs::create_dir_all(&nvme).unwrap();
        fs::write(nvme.join("wwid"), format!("eui.{}\n", WWN)).unwrap();

        let r = resolver(&t);
        assert_eq!(r.device_identity("sdb").unwrap(), format!("naa.{}", WWN));
        assert_eq!(
            r.device_identity("nvme0n1").unwrap(),
            format!("eui.{}", WWN)
        );
        assert!(r.device_identity("sdq").is_err());
    }

    #[test]
    fn wwid_type_codes() {
        assert_eq!(typed_wwid("naa.600a"), "3600a");
        assert_eq!(typed_wwid("eui.0025"), "20025");
        assert_eq!(typed_wwid("t10.ATA_x"), "1ATA_x");
        assert_eq!(typed_wwid("0x600a"), "80x600a");
    }
}
