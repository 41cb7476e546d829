//! Test doubles shared by the unit tests: a scripted host shell and an
//! in-memory storage array.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    client::{
        AluaSettings, ArrayClient, ArrayHost, ClientResult, Initiator,
        InitiatorKind, Lun, ProductFamily, TargetPortal,
    },
    error::DeviceError,
    shell::{CmdOutput, HostExec},
};

/// Route tracing output through the test harness so a failing test
/// shows what the machinery was doing. Safe to call repeatedly.
pub(crate) fn trace_init() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

type Responder = Box<dyn Fn(&str) -> Option<CmdOutput> + Send + Sync>;

/// A shell whose answers are scripted by the test. Rules are tried in
/// registration order; the first one matching the command wins. Commands
/// with no matching rule succeed with empty output, so tests only script
/// the invocations they care about.
pub(crate) struct FakeShell {
    rules: Mutex<Vec<Responder>>,
    calls: Mutex<Vec<String>>,
}

impl FakeShell {
    pub fn new() -> Arc<FakeShell> {
        Arc::new(FakeShell {
            rules: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Answer every command containing `pattern` with `out`.
    pub fn on(&self, pattern: &str, out: CmdOutput) {
        let pattern = pattern.to_string();
        self.rules.lock().push(Box::new(move |command| {
            command.contains(&pattern).then(|| out.clone())
        }));
    }

    /// Install an arbitrary responder, for rules with side effects
    /// (e.g. a "login" that materializes a device node).
    pub fn on_fn<F>(&self, responder: F)
    where
        F: Fn(&str) -> Option<CmdOutput> + Send + Sync + 'static,
    {
        self.rules.lock().push(Box::new(responder));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count_calls(&self, pattern: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.contains(pattern))
            .count()
    }
}

#[async_trait]
impl HostExec for FakeShell {
    async fn exec(&self, command: &str) -> Result<CmdOutput, DeviceError> {
        self.calls.lock().push(command.to_string());
        for rule in self.rules.lock().iter() {
            if let Some(out) = rule(command) {
                return Ok(out);
            }
        }
        Ok(CmdOutput::ok(""))
    }

    async fn exec_redacted(
        &self,
        command: &str,
        display: &str,
    ) -> Result<CmdOutput, DeviceError> {
        // record the redacted form: secrets must not reach transcripts
        self.calls.lock().push(display.to_string());
        for rule in self.rules.lock().iter() {
            if let Some(out) = rule(command) {
                return Ok(out);
            }
        }
        Ok(CmdOutput::ok(""))
    }
}

#[derive(Default)]
struct ArrayState {
    luns: HashMap<String, Lun>,
    hosts: HashMap<String, ArrayHost>,
    host_alua: HashMap<String, AluaSettings>,
    hostgroups: HashMap<String, String>,
    hostgroup_members: HashMap<String, Vec<String>>,
    lungroups: HashMap<String, String>,
    lungroup_members: HashMap<String, Vec<String>>,
    mappings: HashMap<String, String>,
    mapping_hostgroups: HashMap<String, Vec<String>>,
    mapping_lungroups: HashMap<String, Vec<String>>,
    initiators: HashMap<(InitiatorKind, String), Initiator>,
    iscsi_portals: Vec<TargetPortal>,
    roce_portals: Vec<String>,
    next_id: u32,
}

/// An in-memory array: enough object-model semantics for the attach
/// logic, plus a call transcript for idempotency assertions.
pub(crate) struct FakeArray {
    family: ProductFamily,
    state: Mutex<ArrayState>,
    calls: Mutex<Vec<String>>,
}

impl FakeArray {
    pub fn new(family: ProductFamily) -> Arc<FakeArray> {
        Arc::new(FakeArray {
            family,
            state: Mutex::new(ArrayState::default()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    pub fn count_calls(&self, pattern: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.contains(pattern))
            .count()
    }

    fn fresh_id(state: &mut ArrayState, prefix: &str) -> String {
        state.next_id += 1;
        format!("{}{}", prefix, state.next_id)
    }

    pub fn seed_lun(&self, name: &str, wwn: &str, nguid: &str) {
        let mut state = self.state.lock();
        let id = Self::fresh_id(&mut state, "L");
        state.luns.insert(
            name.to_string(),
            Lun {
                id,
                name: name.to_string(),
                wwn: wwn.to_string(),
                nguid: nguid.to_string(),
                capacity_bytes: 1 << 30,
            },
        );
    }

    pub fn seed_initiator(
        &self,
        kind: InitiatorKind,
        id: &str,
        parent_host: Option<&str>,
    ) {
        let mut state = self.state.lock();
        state.initiators.insert(
            (kind, id.to_string()),
            Initiator {
                id: id.to_string(),
                kind,
                is_free: parent_host.is_none(),
                parent_host: parent_host.map(str::to_string),
                alua: None,
            },
        );
    }

    pub fn seed_iscsi_portal(&self, portal: &str, iqn: &str) {
        self.state.lock().iscsi_portals.push(TargetPortal {
            portal: portal.to_string(),
            iqn: iqn.to_string(),
        });
    }

    pub fn seed_roce_portal(&self, portal: &str) {
        self.state.lock().roce_portals.push(portal.to_string());
    }

    pub fn lun_in_lungroup(&self, lungroup_name: &str, lun_name: &str) -> bool {
        let state = self.state.lock();
        let Some(lun) = state.luns.get(lun_name) else {
            return false;
        };
        let Some(group_id) = state.lungroups.get(lungroup_name) else {
            return false;
        };
        state
            .lungroup_members
            .get(group_id)
            .map(|members| members.contains(&lun.id))
            .unwrap_or(false)
    }

    pub fn has_host(&self, name: &str) -> bool {
        self.state.lock().hosts.contains_key(name)
    }
}

#[async_trait]
impl ArrayClient for FakeArray {
    fn product_family(&self) -> ProductFamily {
        self.family
    }

    async fn login(&self) -> ClientResult<()> {
        self.record("login".to_string());
        Ok(())
    }

    async fn logout(&self) -> ClientResult<()> {
        self.record("logout".to_string());
        Ok(())
    }

    async fn get_lun_by_name(&self, name: &str) -> ClientResult<Option<Lun>> {
        Ok(self.state.lock().luns.get(name).cloned())
    }

    async fn get_host_by_name(
        &self,
        name: &str,
    ) -> ClientResult<Option<ArrayHost>> {
        Ok(self.state.lock().hosts.get(name).cloned())
    }

    async fn create_host(&self, name: &str) -> ClientResult<ArrayHost> {
        self.record(format!("create_host {}", name));
        let mut state = self.state.lock();
        if state.hosts.contains_key(name) {
            return Err(DeviceError::Array {
                reason: "host already exists".to_string(),
            });
        }
        let host = ArrayHost {
            id: Self::fresh_id(&mut state, "H"),
            name: name.to_string(),
        };
        state.hosts.insert(name.to_string(), host.clone());
        Ok(host)
    }

    async fn get_host_alua(
        &self,
        host_id: &str,
    ) -> ClientResult<Option<AluaSettings>> {
        Ok(self.state.lock().host_alua.get(host_id).copied())
    }

    async fn update_host_alua(
        &self,
        host_id: &str,
        alua: &AluaSettings,
    ) -> ClientResult<()> {
        self.record(format!("update_host_alua {}", host_id));
        self.state
            .lock()
            .host_alua
            .insert(host_id.to_string(), *alua);
        Ok(())
    }

    async fn get_hostgroup_by_name(
        &self,
        name: &str,
    ) -> ClientResult<Option<String>> {
        Ok(self.state.lock().hostgroups.get(name).cloned())
    }

    async fn create_hostgroup(&self, name: &str) -> ClientResult<String> {
        self.record(format!("create_hostgroup {}", name));
        let mut state = self.state.lock();
        let id = Self::fresh_id(&mut state, "HG");
        state.hostgroups.insert(name.to_string(), id.clone());
        Ok(id)
    }

    async fn hosts_in_hostgroup(
        &self,
        group_id: &str,
    ) -> ClientResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .hostgroup_members
            .get(group_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn add_host_to_hostgroup(
        &self,
        group_id: &str,
        host_id: &str,
    ) -> ClientResult<()> {
        self.record(format!(
            "add_host_to_hostgroup {} {}",
            group_id, host_id
        ));
        self.state
            .lock()
            .hostgroup_members
            .entry(group_id.to_string())
            .or_default()
            .push(host_id.to_string());
        Ok(())
    }

    async fn get_lungroup_by_name(
        &self,
        name: &str,
    ) -> ClientResult<Option<String>> {
        Ok(self.state.lock().lungroups.get(name).cloned())
    }

    async fn create_lungroup(&self, name: &str) -> ClientResult<String> {
        self.record(format!("create_lungroup {}", name));
        let mut state = self.state.lock();
        let id = Self::fresh_id(&mut state, "LG");
        state.lungroups.insert(name.to_string(), id.clone());
        Ok(id)
    }

    async fn luns_in_lungroup(
        &self,
        group_id: &str,
    ) -> ClientResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .lungroup_members
            .get(group_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn add_lun_to_lungroup(
        &self,
        group_id: &str,
        lun_id: &str,
    ) -> ClientResult<()> {
        self.record(format!("add_lun_to_lungroup {} {}", group_id, lun_id));
        self.state
            .lock()
            .lungroup_members
            .entry(group_id.to_string())
            .or_default()
            .push(lun_id.to_string());
        Ok(())
    }

    async fn remove_lun_from_lungroup(
        &self,
        group_id: &str,
        lun_id: &str,
    ) -> ClientResult<()> {
        self.record(format!(
            "remove_lun_from_lungroup {} {}",
            group_id, lun_id
        ));
        if let Some(members) =
            self.state.lock().lungroup_members.get_mut(group_id)
        {
            members.retain(|member| member != lun_id);
        }
        Ok(())
    }

    async fn get_mapping_by_name(
        &self,
        name: &str,
    ) -> ClientResult<Option<String>> {
        Ok(self.state.lock().mappings.get(name).cloned())
    }

    async fn create_mapping(&self, name: &str) -> ClientResult<String> {
        self.record(format!("create_mapping {}", name));
        let mut state = self.state.lock();
        let id = Self::fresh_id(&mut state, "M");
        state.mappings.insert(name.to_string(), id.clone());
        Ok(id)
    }

    async fn hostgroups_in_mapping(
        &self,
        mapping_id: &str,
    ) -> ClientResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .mapping_hostgroups
            .get(mapping_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn lungroups_in_mapping(
        &self,
        mapping_id: &str,
    ) -> ClientResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .mapping_lungroups
            .get(mapping_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn associate_hostgroup(
        &self,
        mapping_id: &str,
        group_id: &str,
    ) -> ClientResult<()> {
        self.record(format!(
            "associate_hostgroup {} {}",
            mapping_id, group_id
        ));
        self.state
            .lock()
            .mapping_hostgroups
            .entry(mapping_id.to_string())
            .or_default()
            .push(group_id.to_string());
        Ok(())
    }

    async fn associate_lungroup(
        &self,
        mapping_id: &str,
        group_id: &str,
    ) -> ClientResult<()> {
        self.record(format!(
            "associate_lungroup {} {}",
            mapping_id, group_id
        ));
        self.state
            .lock()
            .mapping_lungroups
            .entry(mapping_id.to_string())
            .or_default()
            .push(group_id.to_string());
        Ok(())
    }

    async fn get_initiator(
        &self,
        kind: InitiatorKind,
        id: &str,
    ) -> ClientResult<Option<Initiator>> {
        Ok(self
            .state
            .lock()
            .initiators
            .get(&(kind, id.to_string()))
            .cloned())
    }

    async fn add_initiator(
        &self,
        kind: InitiatorKind,
        id: &str,
    ) -> ClientResult<Initiator> {
        self.record(format!("add_initiator {} {}", kind, id));
        let initiator = Initiator {
            id: id.to_string(),
            kind,
            is_free: true,
            parent_host: None,
            alua: None,
        };
        self.state
            .lock()
            .initiators
            .insert((kind, id.to_string()), initiator.clone());
        Ok(initiator)
    }

    async fn attach_initiator_to_host(
        &self,
        kind: InitiatorKind,
        id: &str,
        host_id: &str,
    ) -> ClientResult<()> {
        self.record(format!(
            "attach_initiator_to_host {} {} {}",
            kind, id, host_id
        ));
        let mut state = self.state.lock();
        let Some(initiator) =
            state.initiators.get_mut(&(kind, id.to_string()))
        else {
            return Err(DeviceError::Array {
                reason: format!("initiator {} not found", id),
            });
        };
        initiator.is_free = false;
        initiator.parent_host = Some(host_id.to_string());
        Ok(())
    }

    async fn update_initiator_alua(
        &self,
        kind: InitiatorKind,
        id: &str,
        alua: &AluaSettings,
    ) -> ClientResult<()> {
        self.record(format!("update_initiator_alua {} {}", kind, id));
        let mut state = self.state.lock();
        if let Some(initiator) =
            state.initiators.get_mut(&(kind, id.to_string()))
        {
            initiator.alua = Some(*alua);
        }
        Ok(())
    }

    async fn host_lun_id(
        &self,
        _host_id: &str,
        _lun_id: &str,
    ) -> ClientResult<String> {
        Ok("1".to_string())
    }

    async fn iscsi_portals(&self) -> ClientResult<Vec<TargetPortal>> {
        Ok(self.state.lock().iscsi_portals.clone())
    }

    async fn roce_portals(&self) -> ClientResult<Vec<String>> {
        Ok(self.state.lock().roce_portals.clone())
    }
}
