use crate::types::{CreateMachineOpts, Machine, SshKey};
use crate::CloudApi;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Per-method call counters, for assertions on interaction counts.
#[derive(Debug, Default, Clone)]
pub struct CallCounts {
    pub create: u32,
    pub get: u32,
    pub list: u32,
    pub delete: u32,
    pub start: u32,
    pub stop: u32,
    pub reboot: u32,
    pub list_keys: u32,
}

struct PendingMachine {
    machine: Machine,
    visible_after_lists: u32,
}

#[derive(Default)]
struct MockState {
    machines: Vec<Machine>,
    // First `create_failures` create calls error out.
    create_failures: u32,
    // A failed create may still have happened server-side: the machine then
    // shows up in listings once the countdown reaches zero.
    create_succeeds_server_side: bool,
    server_side_visible_after_lists: u32,
    pending: Option<PendingMachine>,
    // Scripted states handed out by successive get_machine calls.
    get_states: VecDeque<String>,
    get_failures: u32,
    keys_error: Option<String>,
    start_error: Option<String>,
    stop_error: Option<String>,
    reboot_error: Option<String>,
    delete_error: Option<String>,
    counts: CallCounts,
}

/// In-memory CloudAPI double with scripted failures and call counters.
#[derive(Default)]
pub struct MockCloudApi {
    state: Mutex<MockState>,
}

impl MockCloudApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn machine(id: &str, name: &str, state: &str) -> Machine {
        Machine {
            id: id.to_string(),
            name: name.to_string(),
            state: state.to_string(),
            ips: vec!["165.225.138.10".to_string()],
            primary_ip: Some("165.225.138.10".to_string()),
            image: None,
            package: None,
            memory: None,
            disk: None,
            created: None,
            updated: None,
        }
    }

    pub fn with_machine(self, machine: Machine) -> Self {
        self.state.lock().unwrap().machines.push(machine);
        self
    }

    /// Fail the next `n` create calls.
    pub fn fail_creates(self, n: u32) -> Self {
        self.state.lock().unwrap().create_failures = n;
        self
    }

    /// Failed creates still happen server-side; the machine becomes visible
    /// to listings on the `after_lists`-th list call following the failure.
    pub fn create_succeeds_server_side(self, after_lists: u32) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.create_succeeds_server_side = true;
            state.server_side_visible_after_lists = after_lists;
        }
        self
    }

    /// Successive get_machine calls report these states in order; once the
    /// script runs out, the machine's stored state is reported.
    pub fn script_get_states<I, S>(self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.lock().unwrap().get_states = states.into_iter().map(Into::into).collect();
        self
    }

    /// Fail the next `n` get_machine calls with a transport-style error.
    pub fn fail_gets(self, n: u32) -> Self {
        self.state.lock().unwrap().get_failures = n;
        self
    }

    pub fn fail_list_keys(self, message: &str) -> Self {
        self.state.lock().unwrap().keys_error = Some(message.to_string());
        self
    }

    pub fn fail_start(self, message: &str) -> Self {
        self.state.lock().unwrap().start_error = Some(message.to_string());
        self
    }

    pub fn fail_stop(self, message: &str) -> Self {
        self.state.lock().unwrap().stop_error = Some(message.to_string());
        self
    }

    pub fn fail_reboot(self, message: &str) -> Self {
        self.state.lock().unwrap().reboot_error = Some(message.to_string());
        self
    }

    pub fn fail_delete(self, message: &str) -> Self {
        self.state.lock().unwrap().delete_error = Some(message.to_string());
        self
    }

    pub fn counts(&self) -> CallCounts {
        self.state.lock().unwrap().counts.clone()
    }

    pub fn machines(&self) -> Vec<Machine> {
        self.state.lock().unwrap().machines.clone()
    }
}

#[async_trait]
impl CloudApi for MockCloudApi {
    async fn create_machine(&self, opts: &CreateMachineOpts) -> Result<Machine> {
        let mut state = self.state.lock().unwrap();
        state.counts.create += 1;
        let machine = Machine {
            id: format!("mock-{}", uuid::Uuid::new_v4()),
            name: opts.name.clone(),
            state: "provisioning".to_string(),
            ips: vec![],
            primary_ip: None,
            image: Some(opts.image.clone()),
            package: Some(opts.package.clone()),
            memory: None,
            disk: None,
            created: None,
            updated: None,
        };
        if state.create_failures > 0 {
            state.create_failures -= 1;
            let visible_after_lists = state.server_side_visible_after_lists;
            if state.create_succeeds_server_side && state.pending.is_none() {
                state.pending = Some(PendingMachine {
                    machine,
                    visible_after_lists,
                });
            }
            return Err(anyhow!("request timed out delivering the response"));
        }
        state.machines.push(machine.clone());
        Ok(machine)
    }

    async fn get_machine(&self, id: &str) -> Result<Option<Machine>> {
        let mut state = self.state.lock().unwrap();
        state.counts.get += 1;
        if state.get_failures > 0 {
            state.get_failures -= 1;
            return Err(anyhow!("transient CloudAPI error"));
        }
        let scripted = state.get_states.pop_front();
        let Some(machine) = state.machines.iter_mut().find(|m| m.id == id) else {
            return Ok(None);
        };
        if let Some(next_state) = scripted {
            machine.state = next_state;
        }
        Ok(Some(machine.clone()))
    }

    async fn list_machines(&self, name: Option<&str>) -> Result<Vec<Machine>> {
        let mut state = self.state.lock().unwrap();
        state.counts.list += 1;
        let reveal = match state.pending.as_mut() {
            Some(pending) => {
                pending.visible_after_lists = pending.visible_after_lists.saturating_sub(1);
                pending.visible_after_lists == 0
            }
            None => false,
        };
        if reveal {
            if let Some(pending) = state.pending.take() {
                state.machines.push(pending.machine);
            }
        }
        Ok(state
            .machines
            .iter()
            .filter(|m| name.map_or(true, |n| m.name == n))
            .cloned()
            .collect())
    }

    async fn delete_machine(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.counts.delete += 1;
        if let Some(message) = &state.delete_error {
            return Err(anyhow!("{}", message));
        }
        let before = state.machines.len();
        state.machines.retain(|m| m.id != id);
        if state.machines.len() == before {
            return Err(anyhow!("machine {} not found", id));
        }
        Ok(())
    }

    async fn start_machine(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.counts.start += 1;
        if let Some(message) = &state.start_error {
            return Err(anyhow!("{}", message));
        }
        if let Some(machine) = state.machines.iter_mut().find(|m| m.id == id) {
            machine.state = "running".to_string();
        }
        Ok(())
    }

    async fn stop_machine(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.counts.stop += 1;
        if let Some(message) = &state.stop_error {
            return Err(anyhow!("{}", message));
        }
        if let Some(machine) = state.machines.iter_mut().find(|m| m.id == id) {
            machine.state = "stopped".to_string();
        }
        Ok(())
    }

    async fn reboot_machine(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.counts.reboot += 1;
        if let Some(message) = &state.reboot_error {
            return Err(anyhow!("{}", message));
        }
        if let Some(machine) = state.machines.iter_mut().find(|m| m.id == id) {
            machine.state = "running".to_string();
        }
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<SshKey>> {
        let mut state = self.state.lock().unwrap();
        state.counts.list_keys += 1;
        if let Some(message) = &state.keys_error {
            return Err(anyhow!("{}", message));
        }
        Ok(vec![SshKey {
            name: "mock".to_string(),
            fingerprint: None,
            key: None,
        }])
    }
}
