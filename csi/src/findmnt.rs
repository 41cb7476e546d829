//! Locating mounts with the findmnt utility.

use std::{collections::HashMap, sync::Arc};

use serde_json::Value;
use tracing::{error, warn};

use crate::{error::DeviceError, shell::HostExec};

/// Keys of interest we expect to find in the JSON output generated
/// by findmnt.
const TARGET_KEY: &str = "target";
const SOURCE_KEY: &str = "source";
const FSTYPE_KEY: &str = "fstype";

#[derive(Debug)]
pub struct DeviceMount {
    pub mount_path: String,
    pub fstype: String,
}

#[derive(Debug)]
struct Filter<'a> {
    key: &'a str,
    value: &'a str,
}

/// Convert a json value of a key-value pair to a string, adjusted if
/// required on the key.
///
/// The source field returned from findmnt can differ for the same
/// source on different systems, for example
///   dev[/nvme0n1], udev[/nvme0n1], tmpfs[/nvme0n1], devtmpfs[/nvme0n1]
/// this function converts those values to the expected /dev/nvme0n1
fn key_adjusted_value(key: &str, value: &Value) -> String {
    static RE_UDEVPATH: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| {
            regex::Regex::new(r"(?x).*\[(?P<device>/.*)\]").unwrap()
        });

    // value.to_string() would return a string delimited with quotes
    let strvalue: String = match value {
        Value::String(str) => str.to_string(),
        _ => value.to_string(),
    };
    if key == SOURCE_KEY {
        if let Some(caps) = RE_UDEVPATH.captures(&strvalue) {
            return format!("/dev{}", &caps["device"]);
        };
    }
    strvalue
}

const KEYS: &[&str] = &[TARGET_KEY, SOURCE_KEY, FSTYPE_KEY];

/// Reduce a json map entry to a hashmap of the source, target and
/// fstype key-value pairs only.
fn jsonmap_to_hashmap(
    json_map: &serde_json::Map<String, Value>,
) -> HashMap<String, String> {
    let mut hmap: HashMap<String, String> = HashMap::new();
    for (key, value) in json_map {
        if KEYS.contains(&key.as_str()) {
            hmap.insert(key.clone(), key_adjusted_value(key, value));
        }
    }
    hmap
}

/// Recurse over the de-serialised JSON, collecting entries whose
/// key-value pair matches the filter. The search is deliberately
/// generic (and hence slower) to be robust to findmnt layout changes.
fn filter_findmnt(
    json_val: &Value,
    filter: &Filter,
    results: &mut Vec<HashMap<String, String>>,
) {
    match json_val {
        Value::Array(json_array) => {
            for jsonvalue in json_array {
                filter_findmnt(jsonvalue, filter, results);
            }
        }
        Value::Object(json_map) => {
            if let Some(value) = json_map.get(filter.key) {
                if filter.value == value
                    || filter.value == key_adjusted_value(filter.key, value)
                {
                    results.push(jsonmap_to_hashmap(json_map));
                }
            }
            for (_, jsonvalue) in json_map {
                if jsonvalue.is_array() {
                    filter_findmnt(jsonvalue, filter, results);
                }
            }
        }
        jvalue => {
            warn!("unexpected json type {}", jvalue);
        }
    };
}

const FIND_MNT: &str = "findmnt -J -o SOURCE,TARGET,FSTYPE";

async fn findmnt(
    shell: &Arc<dyn HostExec>,
    params: Filter<'_>,
) -> Result<Vec<HashMap<String, String>>, DeviceError> {
    let out = shell.exec(FIND_MNT).await?.require_success(FIND_MNT)?;
    let json: Value = serde_json::from_str(&out.output)?;
    let mut results: Vec<HashMap<String, String>> = Vec::new();
    filter_findmnt(&json, &params, &mut results);
    Ok(results)
}

/// Find the device mounted at a directory or block special file, if any.
pub(crate) async fn get_devicepath(
    shell: &Arc<dyn HostExec>,
    mount_path: &str,
) -> Result<Option<String>, DeviceError> {
    let sources = findmnt(
        shell,
        Filter {
            key: TARGET_KEY,
            value: mount_path,
        },
    )
    .await?;
    match sources.len() {
        0 => Ok(None),
        1 => match sources[0].get(SOURCE_KEY) {
            Some(devicepath) => Ok(Some(devicepath.to_string())),
            None => Err(DeviceError::new("missing source field")),
        },
        _ => {
            // should be impossible ...
            warn!(
                "multiple sources mounted on target {:?}->{}",
                sources, mount_path
            );
            Err(DeviceError::new(&format!(
                "multiple devices mounted at {}",
                mount_path
            )))
        }
    }
}

/// Find the mount paths of a block device, if any.
pub(crate) async fn get_mountpaths(
    shell: &Arc<dyn HostExec>,
    device_path: &str,
) -> Result<Vec<DeviceMount>, DeviceError> {
    let results = findmnt(
        shell,
        Filter {
            key: SOURCE_KEY,
            value: device_path,
        },
    )
    .await?;
    let mut mountpaths: Vec<DeviceMount> = Vec::new();
    for entry in results {
        if let Some(mountpath) = entry.get(TARGET_KEY) {
            if let Some(fstype) = entry.get(FSTYPE_KEY) {
                mountpaths.push(DeviceMount {
                    mount_path: mountpath.to_string(),
                    fstype: fstype.to_string(),
                })
            } else {
                error!("missing fstype for {}", mountpath);
                mountpaths.push(DeviceMount {
                    mount_path: mountpath.to_string(),
                    fstype: "unspecified".to_string(),
                })
            }
        } else {
            warn!("missing target field {:?}", entry);
        }
    }
    Ok(mountpaths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{shell::CmdOutput, testsupport::FakeShell};

    const LISTING: &str = r#"{
      "filesystems": [
        { "source": "/dev/sda1", "target": "/", "fstype": "ext4",
          "children": [
            { "source": "udev[/dm-3]", "target": "/var/lib/data",
              "fstype": "ext4" }
          ]
        }
      ]
    }"#;

    fn shell() -> Arc<FakeShell> {
        let shell = FakeShell::new();
        shell.on("findmnt", CmdOutput::ok(LISTING));
        shell
    }

    #[tokio::test]
    async fn resolves_device_for_mount_path() {
        let shell = shell();
        let exec: Arc<dyn HostExec> = shell;
        let device = get_devicepath(&exec, "/var/lib/data").await.unwrap();
        // udev[/dm-3] is adjusted to the expected /dev form
        assert_eq!(device, Some("/dev/dm-3".to_string()));
    }

    #[tokio::test]
    async fn resolves_mounts_for_device() {
        let exec: Arc<dyn HostExec> = shell();
        let mounts = get_mountpaths(&exec, "/dev/dm-3").await.unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].mount_path, "/var/lib/data");
        assert_eq!(mounts[0].fstype, "ext4");
    }

    #[tokio::test]
    async fn absent_mounts_are_not_errors() {
        let exec: Arc<dyn HostExec> = shell();
        assert!(get_devicepath(&exec, "/not/mounted")
            .await
            .unwrap()
            .is_none());
        assert!(get_mountpaths(&exec, "/dev/sdq")
            .await
            .unwrap()
            .is_empty());
    }
}
