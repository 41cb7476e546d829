//! Parallel path establishment: one worker per portal logging in and
//! scanning for its block device, and the assembler loop that decides
//! when enough paths exist, registers the WWID with the multipath
//! daemon and waits for the assembled `dm-*` to materialize.

use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{resolver::typed_wwid, DeviceStack, LunId};
use crate::{config, error::DeviceError};

/// Tunables of one assembly, snapshotted from the global config so a
/// test can shrink every interval.
#[derive(Clone, Debug)]
pub(crate) struct AssemblyParams {
    pub expected_id: LunId,
    pub use_multipath: bool,
    pub scan_attempts: u32,
    pub worker_poll_interval: Duration,
    pub assembler_interval: Duration,
    pub grace_window: Duration,
    pub single_path_attempts: u32,
    pub single_path_interval: Duration,
}

impl AssemblyParams {
    pub fn from_config(expected_id: LunId, use_multipath: bool) -> Self {
        let cfg = config::config();
        AssemblyParams {
            expected_id,
            use_multipath,
            scan_attempts: cfg.device_scan_attempts,
            worker_poll_interval: cfg.worker_poll_interval,
            assembler_interval: cfg.assembler_interval,
            grace_window: cfg.grace_window,
            single_path_attempts: cfg.single_path_attempts,
            single_path_interval: cfg.single_path_interval,
        }
    }
}

/// State shared between the workers of one connect call and the
/// assembler consuming their results. Counters are incremented at most
/// once per worker; `stop` is written only by the assembler.
pub(crate) struct SharedPathState {
    found: Mutex<Vec<String>>,
    just_added: Mutex<VecDeque<String>>,
    claimed: Mutex<HashSet<String>>,
    num_login: AtomicU32,
    failed_login: AtomicU32,
    stopped: AtomicU32,
    stop: AtomicBool,
}

impl SharedPathState {
    pub fn new() -> Arc<SharedPathState> {
        Arc::new(SharedPathState {
            found: Mutex::new(Vec::new()),
            just_added: Mutex::new(VecDeque::new()),
            claimed: Mutex::new(HashSet::new()),
            num_login: AtomicU32::new(0),
            failed_login: AtomicU32::new(0),
            stopped: AtomicU32::new(0),
            stop: AtomicBool::new(false),
        })
    }

    /// Claim a device for the calling worker and publish it. Returns
    /// false when a sibling already claimed the same kernel device.
    pub fn record_device(&self, name: &str) -> bool {
        if !self.claimed.lock().insert(name.to_string()) {
            return false;
        }
        self.found.lock().push(name.to_string());
        self.just_added.lock().push_back(name.to_string());
        true
    }

    pub fn found_devices(&self) -> Vec<String> {
        self.found.lock().clone()
    }

    pub fn drain_just_added(&self) -> Vec<String> {
        self.just_added.lock().drain(..).collect()
    }

    pub fn claimed_devices(&self) -> HashSet<String> {
        self.claimed.lock().clone()
    }

    pub fn login_ok(&self) {
        self.num_login.fetch_add(1, Ordering::AcqRel);
    }

    pub fn login_failed(&self) {
        self.failed_login.fetch_add(1, Ordering::AcqRel);
    }

    pub fn logins(&self) -> u32 {
        self.num_login.load(Ordering::Acquire)
    }

    pub fn failed_logins(&self) -> u32 {
        self.failed_login.load(Ordering::Acquire)
    }

    /// Release ordering: a worker's appends to the device lists happen
    /// before its stop increment becomes visible.
    fn worker_stopped(&self) {
        self.stopped.fetch_add(1, Ordering::Release);
    }

    pub fn stopped(&self) -> u32 {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Increments `stopped` when dropped, so the count is maintained on
/// every exit path of a worker including an unwind.
struct StopGuard(Arc<SharedPathState>);

impl Drop for StopGuard {
    fn drop(&mut self) {
        self.0.worker_stopped();
    }
}

/// The per-portal primitives a transport provides to the shared worker.
#[async_trait]
pub(crate) trait PortalOps: Send + Sync {
    /// Portal description for logs.
    fn label(&self) -> String;

    /// Establish the session (discover + login) for this portal.
    async fn ensure_session(&self) -> Result<(), DeviceError>;

    /// Kick the kernel to scan for newly presented devices.
    async fn rescan(&self) -> Result<(), DeviceError>;

    /// Look for this portal's block device, skipping devices already
    /// claimed by sibling workers.
    async fn find_device(
        &self,
        state: &SharedPathState,
    ) -> Result<Option<String>, DeviceError>;
}

#[derive(Clone, Debug)]
struct WorkerParams {
    scan_attempts: u32,
    poll_interval: Duration,
}

/// One attach worker: session, scan, publish, settle. Extra rescans are
/// spaced (k+2)^2 poll intervals apart; after the rescan budget is spent
/// the worker waits one more window and gives up.
async fn run_worker(
    ops: Arc<dyn PortalOps>,
    state: Arc<SharedPathState>,
    params: WorkerParams,
) {
    let _settle = StopGuard(state.clone());

    if let Err(error) = ops.ensure_session().await {
        warn!("session for {} failed: {}", ops.label(), error);
        state.login_failed();
        return;
    }

    if let Err(error) = ops.rescan().await {
        warn!("initial rescan for {} failed: {}", ops.label(), error);
    }

    let mut rescans: u32 = 0;
    let mut ticks: u64 = 0;
    let mut next_rescan: u64 = 4;
    loop {
        if state.should_stop() {
            debug!("{} cancelled by assembler", ops.label());
            break;
        }
        match ops.find_device(&state).await {
            Ok(Some(device)) => {
                if state.record_device(&device) {
                    info!("{} found device {}", ops.label(), device);
                    break;
                }
                // a sibling claimed it first, keep looking
            }
            Ok(None) => {}
            Err(error) => {
                debug!("{} device lookup failed: {}", ops.label(), error)
            }
        }
        if ticks >= next_rescan {
            if rescans >= params.scan_attempts {
                debug!("{} rescan budget exhausted", ops.label());
                break;
            }
            rescans += 1;
            if let Err(error) = ops.rescan().await {
                warn!("rescan {} for {} failed: {}", rescans, ops.label(), error);
            }
            let spacing = (u64::from(rescans) + 2) * (u64::from(rescans) + 2);
            next_rescan += spacing;
        }
        tokio::time::sleep(params.poll_interval).await;
        ticks += 1;
    }

    state.login_ok();
}

/// Launch one worker per portal and drive the assembly to a terminal
/// outcome. On return the workers have been cancelled and joined.
pub(crate) async fn establish(
    stack: &DeviceStack,
    params: &AssemblyParams,
    portals: Vec<Arc<dyn PortalOps>>,
) -> Result<String, DeviceError> {
    let state = SharedPathState::new();
    let workers = portals.len() as u32;
    let worker_params = WorkerParams {
        scan_attempts: params.scan_attempts,
        poll_interval: params.worker_poll_interval,
    };

    let handles: Vec<JoinHandle<()>> = portals
        .into_iter()
        .map(|ops| {
            tokio::spawn(run_worker(
                ops,
                state.clone(),
                worker_params.clone(),
            ))
        })
        .collect();

    let outcome = if params.use_multipath {
        assemble_multipath(stack, params, &state, workers).await
    } else {
        wait_single_path(stack, params, &state).await
    };

    state.request_stop();
    for handle in handles {
        if let Err(error) = handle.await {
            if error.is_panic() {
                error!("attach worker panicked: {}", error);
            }
        }
    }
    outcome
}

async fn assemble_multipath(
    stack: &DeviceStack,
    params: &AssemblyParams,
    state: &SharedPathState,
    workers: u32,
) -> Result<String, DeviceError> {
    let mut wwid: Option<String> = None;
    let mut dm: Option<String> = None;
    let mut wwid_added = false;
    let mut multipath_down = false;
    let mut last_try: Option<tokio::time::Instant> = None;

    loop {
        let devices = state.found_devices();
        let stopped = state.stopped();
        let settled = state.logins() + state.failed_logins();

        if stopped == workers && devices.is_empty() {
            return Err(DeviceError::VolumeNotFound);
        }

        if wwid.is_none() {
            if let Some(first) = devices.first() {
                match stack.resolver.device_identity(first) {
                    Ok(raw) => {
                        let typed = typed_wwid(&raw);
                        debug!("lun wwid resolved to {}", typed);
                        wwid = Some(typed);
                    }
                    Err(error) => {
                        debug!("wwid of {} not readable yet: {}", first, error)
                    }
                }
            }
        }

        if dm.is_none() && !devices.is_empty() {
            dm = stack.multipath.find_assembled_dm(&devices);
        }

        if dm.is_none() && !multipath_down {
            if let Some(wwid_value) = &wwid {
                if !wwid_added {
                    match stack.multipath.add_wwid(wwid_value).await {
                        Ok(()) => wwid_added = true,
                        Err(DeviceError::MultipathUnavailable {
                            reason,
                        }) => {
                            warn!(
                                "multipath unavailable ({}), \
                                 falling back to a single path",
                                reason
                            );
                            multipath_down = true;
                        }
                        Err(error) => {
                            warn!("add wwid {} failed: {}", wwid_value, error)
                        }
                    }
                }
                if wwid_added {
                    for device in state.drain_just_added() {
                        let path = stack.resolver.dev_path(&device);
                        match stack.multipath.add_path(&path).await {
                            Err(DeviceError::MultipathUnavailable {
                                reason,
                            }) => {
                                warn!(
                                    "multipath unavailable ({}), \
                                     falling back to a single path",
                                    reason
                                );
                                multipath_down = true;
                            }
                            Err(error) => {
                                warn!("add path {} failed: {}", path, error)
                            }
                            Ok(()) => {}
                        }
                        if dm.is_none() {
                            dm = stack
                                .multipath
                                .find_assembled_dm(&state.found_devices());
                        }
                    }
                }
            }
        }

        // success: an assembled map exists and every worker has settled
        if dm.is_some() && (settled == workers || stopped == workers) {
            break;
        }
        // no map will ever appear without the daemon
        if multipath_down && stopped == workers && !devices.is_empty() {
            break;
        }
        // grace window: give the daemon room to coalesce paths after the
        // last worker stops, without blocking forever when no map comes
        if stopped == workers && dm.is_none() {
            match last_try {
                None => {
                    last_try = Some(
                        tokio::time::Instant::now() + params.grace_window,
                    );
                }
                Some(deadline)
                    if tokio::time::Instant::now() >= deadline =>
                {
                    debug!("grace window elapsed with no multipath map");
                    break;
                }
                _ => {}
            }
        }
        tokio::time::sleep(params.assembler_interval).await;
    }

    if let Some(dm_name) = dm {
        stack
            .verify_multipath_device(&dm_name, &params.expected_id)
            .await?;
        return Ok(stack.resolver.dev_path(&dm_name));
    }

    match state.found_devices().first() {
        Some(first) => {
            warn!(
                "no multipath map assembled, returning single path {}",
                first
            );
            stack.verify_single_device(first, &params.expected_id).await?;
            Ok(stack.resolver.dev_path(first))
        }
        None => Err(DeviceError::VolumeNotFound),
    }
}

/// Single-path mode: one worker was launched; poll its published device
/// and verify identity before handing it out.
async fn wait_single_path(
    stack: &DeviceStack,
    params: &AssemblyParams,
    state: &SharedPathState,
) -> Result<String, DeviceError> {
    for _ in 0 .. params.single_path_attempts {
        if let Some(first) = state.found_devices().first() {
            stack.verify_single_device(first, &params.expected_id).await?;
            return Ok(stack.resolver.dev_path(first));
        }
        if state.stopped() >= 1 {
            // the worker settled without publishing anything
            break;
        }
        tokio::time::sleep(params.single_path_interval).await;
    }
    Err(DeviceError::VolumeNotFound)
}
