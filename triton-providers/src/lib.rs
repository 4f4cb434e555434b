use anyhow::Result;
use async_trait::async_trait;

use types::{CreateMachineOpts, Machine, SshKey};

/// Machine CRUD surface of Triton CloudAPI.
///
/// `get_machine` keeps "definitely gone" and "temporarily unreachable"
/// apart: `Ok(None)` is a definitive 404/410 from the API, `Err` is a
/// transport or server failure. Callers decide how much of that
/// distinction to surface.
#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn create_machine(&self, opts: &CreateMachineOpts) -> Result<Machine>;
    async fn get_machine(&self, id: &str) -> Result<Option<Machine>>;

    /// List machines in the account, optionally filtered by exact name.
    async fn list_machines(&self, name: Option<&str>) -> Result<Vec<Machine>>;

    async fn delete_machine(&self, id: &str) -> Result<()>;
    async fn start_machine(&self, id: &str) -> Result<()>;
    async fn stop_machine(&self, id: &str) -> Result<()>;
    async fn reboot_machine(&self, id: &str) -> Result<()>;

    /// Cheap authenticated call used to validate credentials after client
    /// construction. Failures here are advisory; real calls surface them.
    async fn list_keys(&self) -> Result<Vec<SshKey>>;
}

pub mod types {
    use serde::{Deserialize, Serialize};

    /// A machine as CloudAPI reports it. Field names follow the wire
    /// format (`primaryIp` is camelCase on the wire); anything the API may
    /// omit defaults to empty.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Machine {
        pub id: String,
        pub name: String,
        #[serde(default)]
        pub state: String,
        #[serde(default)]
        pub ips: Vec<String>,
        #[serde(default, rename = "primaryIp")]
        pub primary_ip: Option<String>,
        #[serde(default)]
        pub image: Option<String>,
        #[serde(default)]
        pub package: Option<String>,
        #[serde(default)]
        pub memory: Option<u64>,
        #[serde(default)]
        pub disk: Option<u64>,
        #[serde(default)]
        pub created: Option<String>,
        #[serde(default)]
        pub updated: Option<String>,
    }

    /// Body of `POST /:account/machines`.
    #[derive(Debug, Clone, Serialize)]
    pub struct CreateMachineOpts {
        pub name: String,
        pub package: String,
        pub image: String,
        pub networks: Vec<String>,
        pub firewall_enabled: bool,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct SshKey {
        pub name: String,
        #[serde(default)]
        pub fingerprint: Option<String>,
        #[serde(default)]
        pub key: Option<String>,
    }
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "cloudapi")]
pub mod cloudapi;
