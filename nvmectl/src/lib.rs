//! Kernel-side view of NVMe-over-Fabrics state. Connection setup itself
//! goes through the host `nvme` CLI; this crate only observes and prods
//! what the kernel already has (controller state, rescans, teardown).

pub mod error;
pub mod subsystem;

pub use error::NvmeError;
pub use subsystem::{
    controller_for_nqn, controller_name, controllers, controllers_at,
    Controller,
};
