//! Global configuration parameters. Populated once at plugin startup from
//! the caller's parameter map; components snapshot the values they need
//! into per-call parameter structs.

use std::{collections::HashMap, time::Duration};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};

/// Parameter key for the number of extra device rescans per worker.
pub const DEVICE_SCAN_ATTEMPTS_NAME: &str = "device-scan-attempts";
/// Parameter key for the assembly grace window, in seconds.
pub const GRACE_WINDOW_SECS_NAME: &str = "assembly-grace-window-secs";

#[derive(Clone, Debug)]
pub struct Config {
    /// Wall-clock limit for a single host command.
    pub shell_timeout: Duration,
    /// Connect outer loop: retries on the not-found sentinel.
    pub connect_retries: u32,
    pub connect_retry_interval: Duration,
    /// Disconnect outer loop.
    pub disconnect_retries: u32,
    pub disconnect_retry_interval: Duration,
    /// Inner disconnect loop: polls until the id no longer resolves.
    pub disconnect_resolve_attempts: u32,
    pub disconnect_resolve_interval: Duration,
    /// Extra kernel rescans a worker may issue after the first.
    pub device_scan_attempts: u32,
    /// Worker poll interval between resolver checks.
    pub worker_poll_interval: Duration,
    /// Assembler loop interval.
    pub assembler_interval: Duration,
    /// Window past the last worker stop in which the multipath daemon may
    /// still publish the assembled map.
    pub grace_window: Duration,
    /// iSCSI session poll after login is issued.
    pub login_poll_attempts: u32,
    pub login_poll_interval: Duration,
    /// Single-path mode device poll.
    pub single_path_attempts: u32,
    pub single_path_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            shell_timeout: Duration::from_secs(30),
            connect_retries: 3,
            connect_retry_interval: Duration::from_secs(3),
            disconnect_retries: 3,
            disconnect_retry_interval: Duration::from_secs(2),
            disconnect_resolve_attempts: 10,
            disconnect_resolve_interval: Duration::from_secs(2),
            device_scan_attempts: 3,
            worker_poll_interval: Duration::from_secs(1),
            assembler_interval: Duration::from_secs(1),
            grace_window: Duration::from_secs(15),
            login_poll_attempts: 60,
            login_poll_interval: Duration::from_secs(2),
            single_path_attempts: 15,
            single_path_interval: Duration::from_secs(2),
        }
    }
}

impl TryFrom<&HashMap<String, String>> for Config {
    type Error = String;

    fn try_from(params: &HashMap<String, String>) -> Result<Self, String> {
        let mut config = Config::default();
        if let Some(value) = params.get(DEVICE_SCAN_ATTEMPTS_NAME) {
            config.device_scan_attempts =
                value.parse::<u32>().map_err(|error| {
                    format!(
                        "invalid value for {}: {}",
                        DEVICE_SCAN_ATTEMPTS_NAME, error
                    )
                })?;
        }
        if let Some(value) = params.get(GRACE_WINDOW_SECS_NAME) {
            let secs = value.parse::<u64>().map_err(|error| {
                format!(
                    "invalid value for {}: {}",
                    GRACE_WINDOW_SECS_NAME, error
                )
            })?;
            config.grace_window = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

/// Get a mutex guard over the global `Config`.
pub fn config<'a>() -> MutexGuard<'a, Config> {
    static CONFIG: Lazy<Mutex<Config>> =
        Lazy::new(|| Mutex::new(Config::default()));
    CONFIG.lock()
}
