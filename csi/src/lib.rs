//! Node-side attacher for SAN volumes. Turns an abstract "connect this
//! LUN" into a local block device path by logging in to the storage
//! portals in parallel, scanning the kernel for the presented devices,
//! assembling a multipath device over the per-portal paths and
//! verifying its identity against the LUN identifier; plus the inverse
//! teardown, the array-side attach bridge and the node device
//! lifecycle.

pub mod attach;
pub mod client;
pub mod config;
pub mod dev;
pub mod error;
pub mod findmnt;
pub mod node;
pub mod shell;
pub mod taskflow;

#[cfg(test)]
pub(crate) mod testsupport;

pub use attach::{AttachOps, AttachRequest, AttachResult, Attacher};
pub use dev::{
    get_connector, register_all_connectors, register_connector,
    ConnectRequest, Connector, LunId, Transport,
};
pub use error::DeviceError;
pub use shell::{HostExec, HostShell};
