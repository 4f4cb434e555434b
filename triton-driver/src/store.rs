use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::driver::TritonDriver;

/// `<store>/machines/<name>/config.json`: the persisted driver record
/// (configuration plus machine id), read back on every host invocation.
pub fn config_path(store_path: &str, machine_name: &str) -> PathBuf {
    Path::new(store_path)
        .join("machines")
        .join(machine_name)
        .join("config.json")
}

pub async fn save(driver: &TritonDriver) -> Result<()> {
    let path = config_path(&driver.config.store_path, &driver.config.machine_name);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(driver)?;
    tokio::fs::write(&path, json)
        .await
        .with_context(|| format!("failed writing machine record {}", path.display()))
}

pub async fn load(store_path: &str, machine_name: &str) -> Result<TritonDriver> {
    let path = config_path(store_path, machine_name);
    let bytes = tokio::fs::read(&path).await.with_context(|| {
        format!(
            "no record for machine '{}' at {} (create it first)",
            machine_name,
            path.display()
        )
    })?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("machine record {} is corrupt", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;

    #[tokio::test]
    async fn save_then_load_round_trips_config_and_machine_id() {
        let store = tempfile::tempdir().unwrap();
        let config = DriverConfig {
            account: "ops".to_string(),
            key_path: "/tmp/id_rsa".to_string(),
            key_id: "ba:co:n".to_string(),
            endpoint: "https://cloudapi.example.com".to_string(),
            package: "k4-general-kvm-3.75G".to_string(),
            image: "698a8146".to_string(),
            network: "f7ed95d3".to_string(),
            ssh_user: "ubuntu".to_string(),
            ssh_port: 22,
            machine_name: "dev0".to_string(),
            store_path: store.path().to_str().unwrap().to_string(),
            poll_interval_secs: None,
            max_create_rounds: None,
            max_poll_errors: None,
        };
        let mut driver = TritonDriver::new(config);
        driver.machine_id = Some("m-123".to_string());
        save(&driver).await.unwrap();

        let loaded = load(store.path().to_str().unwrap(), "dev0").await.unwrap();
        assert_eq!(loaded.machine_id.as_deref(), Some("m-123"));
        assert_eq!(loaded.config.account, "ops");
        assert_eq!(loaded.config.machine_name, "dev0");
    }

    #[tokio::test]
    async fn load_explains_a_missing_record() {
        let store = tempfile::tempdir().unwrap();
        let err = load(store.path().to_str().unwrap(), "ghost")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }
}
