use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;
use triton_providers::cloudapi::CloudApiClient;
use triton_providers::types::{CreateMachineOpts, Machine};
use triton_providers::CloudApi;

use crate::config::DriverConfig;
use crate::reconcile;

pub const DRIVER_NAME: &str = "triton";

/// Port the Docker daemon listens on, for `url()`.
const DOCKER_PORT: u16 = 2376;

/// The small state vocabulary the lifecycle surface reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    None,
    Starting,
    Running,
    Stopped,
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriverState::None => "None",
            DriverState::Starting => "Starting",
            DriverState::Running => "Running",
            DriverState::Stopped => "Stopped",
        };
        f.write_str(s)
    }
}

/// What a machine lookup actually told us, before it is folded into a
/// `DriverState`: definitely there, definitely gone, or unreachable.
pub enum MachineStatus {
    Found(Machine),
    NotFound,
    Unreachable(anyhow::Error),
}

/// Map a provider-native state string onto the driver vocabulary. Total:
/// unknown states collapse to `None`.
pub fn driver_state(provider_state: &str) -> DriverState {
    match provider_state {
        "provisioning" => DriverState::Starting,
        "running" => DriverState::Running,
        "stopping" | "stopped" => DriverState::Stopped,
        "failed" => DriverState::None,
        _ => DriverState::None,
    }
}

/// Lifecycle driver for a single machine on Triton.
///
/// Only `config` and `machine_id` survive serialization; the API handle is
/// rebuilt lazily, once per process, on first use.
#[derive(Serialize, Deserialize)]
pub struct TritonDriver {
    pub config: DriverConfig,
    #[serde(default)]
    pub machine_id: Option<String>,

    #[serde(skip)]
    injected: Option<Arc<dyn CloudApi>>,
    #[serde(skip)]
    api: OnceCell<Arc<dyn CloudApi>>,
}

impl std::fmt::Debug for TritonDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TritonDriver")
            .field("config", &self.config)
            .field("machine_id", &self.machine_id)
            .finish_non_exhaustive()
    }
}

impl TritonDriver {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            machine_id: None,
            injected: None,
            api: OnceCell::new(),
        }
    }

    /// Build a driver over an injected API capability instead of the real
    /// CloudAPI client (tests, alternative hosts).
    pub fn with_api(config: DriverConfig, api: Arc<dyn CloudApi>) -> Self {
        Self {
            config,
            machine_id: None,
            injected: Some(api),
            api: OnceCell::new(),
        }
    }

    /// The shared API handle, built on first use and memoized for the life
    /// of the process. Construction reads and parses the private key;
    /// failures there are configuration errors and surface immediately. The
    /// follow-up `list_keys` validation soft-fails: an auth problem is
    /// logged and the handle is returned anyway, so real calls surface it.
    async fn api(&self) -> Result<Arc<dyn CloudApi>> {
        self.api
            .get_or_try_init(|| async {
                let api: Arc<dyn CloudApi> = match &self.injected {
                    Some(api) => api.clone(),
                    None => {
                        let key_pem = tokio::fs::read(&self.config.key_path).await.with_context(
                            || format!("failed reading private key {}", self.config.key_path),
                        )?;
                        Arc::new(CloudApiClient::new(
                            &self.config.endpoint,
                            &self.config.account,
                            &self.config.key_id,
                            &key_pem,
                        )?)
                    }
                };
                if let Err(e) = api.list_keys().await {
                    eprintln!(
                        "❌ [driver] credential validation against {} failed: {}",
                        self.config.endpoint, e
                    );
                }
                Ok::<_, anyhow::Error>(api)
            })
            .await
            .map(Arc::clone)
    }

    fn require_machine_id(&self) -> Result<&str> {
        self.machine_id
            .as_deref()
            .ok_or_else(|| anyhow!("machine '{}' has not been created", self.config.machine_name))
    }

    pub fn pre_create_check(&self) -> Result<()> {
        self.config.validate()
    }

    /// Provision the machine: submit the create request (reconciling an
    /// ambiguous failure through the listing filter), wait until it runs,
    /// record the machine id, and drop a copy of the account key where SSH
    /// tooling expects it.
    pub async fn create(&mut self) -> Result<()> {
        let api = self.api().await?;
        let opts = CreateMachineOpts {
            name: self.config.machine_name.clone(),
            package: self.config.package.clone(),
            image: self.config.image.clone(),
            networks: vec![self.config.network.clone()],
            firewall_enabled: false,
        };
        let policy = self.config.retry_policy();

        let machine = reconcile::resolve_create(api.as_ref(), &opts, &policy).await?;
        let machine = reconcile::await_running(api.as_ref(), machine, &policy).await?;

        // Recorded exactly once; later lifecycle calls never touch it.
        if self.machine_id.is_none() {
            self.machine_id = Some(machine.id.clone());
        }
        tracing::info!(machine = %machine.id, name = %machine.name, "machine is running");

        self.write_ssh_key().await
    }

    /// Copy the account private key into the machine directory, readable by
    /// the owner only. No retry; a failure here aborts create.
    async fn write_ssh_key(&self) -> Result<()> {
        let key = tokio::fs::read(&self.config.key_path)
            .await
            .with_context(|| format!("failed reading private key {}", self.config.key_path))?;
        let path = self.config.ssh_key_path();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &key)
            .await
            .with_context(|| format!("failed writing SSH key {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o400);
            tokio::fs::set_permissions(&path, perms).await?;
        }
        Ok(())
    }

    /// Probe the machine without collapsing the answer.
    pub async fn status(&self) -> MachineStatus {
        let Some(id) = self.machine_id.as_deref() else {
            return MachineStatus::NotFound;
        };
        let api = match self.api().await {
            Ok(api) => api,
            Err(e) => return MachineStatus::Unreachable(e),
        };
        match api.get_machine(id).await {
            Ok(Some(machine)) => MachineStatus::Found(machine),
            Ok(None) => MachineStatus::NotFound,
            Err(e) => MachineStatus::Unreachable(e),
        }
    }

    /// Driver state per the mapping table. Lookup failures are absorbed:
    /// "can't find it" means "not running", never a hard fault.
    pub async fn state(&self) -> DriverState {
        match self.status().await {
            MachineStatus::Found(machine) => {
                tracing::debug!(machine = %machine.id, state = %machine.state, "machine state");
                driver_state(&machine.state)
            }
            MachineStatus::NotFound => DriverState::None,
            MachineStatus::Unreachable(e) => {
                tracing::info!(
                    machine = ?self.machine_id,
                    "failed fetching machine (is it dead?): {}",
                    e
                );
                DriverState::None
            }
        }
    }

    /// Idempotent delete: a machine that is already gone (or unreachable)
    /// counts as removed.
    pub async fn remove(&self) -> Result<()> {
        if self.state().await == DriverState::None {
            return Ok(());
        }
        let id = self.require_machine_id()?;
        self.api().await?.delete_machine(id).await
    }

    pub async fn start(&self) -> Result<()> {
        let id = self.require_machine_id()?;
        if let Err(e) = self.api().await?.start_machine(id).await {
            return Err(anyhow!("failed starting machine {}: {}", id, e));
        }
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let id = self.require_machine_id()?;
        if let Err(e) = self.api().await?.stop_machine(id).await {
            return Err(anyhow!("failed stopping machine {}: {}", id, e));
        }
        Ok(())
    }

    pub async fn restart(&self) -> Result<()> {
        let id = self.require_machine_id()?;
        if let Err(e) = self.api().await?.reboot_machine(id).await {
            return Err(anyhow!("failed restarting machine {}: {}", id, e));
        }
        Ok(())
    }

    /// No forceful path exists on CloudAPI; kill is stop.
    pub async fn kill(&self) -> Result<()> {
        self.stop().await
    }

    /// First listed address of the machine.
    pub async fn ip(&self) -> Result<String> {
        let id = self.require_machine_id()?;
        let machine = self
            .api()
            .await?
            .get_machine(id)
            .await?
            .ok_or_else(|| anyhow!("machine {} not found", id))?;
        machine
            .ips
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("machine {} has no IP addresses yet", id))
    }

    pub async fn ssh_hostname(&self) -> Result<String> {
        self.ip().await
    }

    pub fn ssh_username(&self) -> &str {
        &self.config.ssh_user
    }

    pub fn ssh_port(&self) -> u16 {
        self.config.ssh_port
    }

    pub async fn url(&self) -> Result<String> {
        let ip = self.ip().await?;
        Ok(format!("tcp://{}:{}", ip, DOCKER_PORT))
    }

    pub fn driver_name(&self) -> &'static str {
        DRIVER_NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_mapping_is_total() {
        assert_eq!(driver_state("provisioning"), DriverState::Starting);
        assert_eq!(driver_state("running"), DriverState::Running);
        assert_eq!(driver_state("stopping"), DriverState::Stopped);
        assert_eq!(driver_state("stopped"), DriverState::Stopped);
        assert_eq!(driver_state("failed"), DriverState::None);
        assert_eq!(driver_state("unknown"), DriverState::None);
        assert_eq!(driver_state(""), DriverState::None);
    }

    #[test]
    fn driver_state_displays_its_name() {
        assert_eq!(DriverState::Running.to_string(), "Running");
        assert_eq!(DriverState::None.to_string(), "None");
    }
}
