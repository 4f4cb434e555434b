use anyhow::{anyhow, Result};
use std::time::Duration;
use tokio::time::sleep;
use triton_providers::types::{CreateMachineOpts, Machine};
use triton_providers::CloudApi;

/// Bounds for the create/poll loops. The defaults reproduce the historical
/// behavior: retry and poll forever on a fixed 5-second interval. Setting
/// `max_create_rounds` / `max_poll_errors` turns the indefinite loops into
/// errors instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Listing attempts per reconciliation-by-listing pass.
    pub list_attempts: u32,
    /// Fixed delay between listing attempts and between state polls.
    pub poll_interval: Duration,
    /// Give up after this many full create+confirm rounds. `None` retries
    /// forever.
    pub max_create_rounds: Option<u32>,
    /// Give up waiting for "running" after this many consecutive poll
    /// errors. `None` absorbs them forever.
    pub max_poll_errors: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            list_attempts: 12,
            poll_interval: Duration::from_secs(5),
            max_create_rounds: None,
            max_poll_errors: None,
        }
    }
}

/// Outcome of one reconciliation-by-listing pass.
enum Confirm {
    Found(Machine),
    Exhausted,
}

/// Turn a creation intent into a confirmed machine, tolerating ambiguous
/// create failures.
///
/// A create call that errors may still have created the machine server-side
/// (the request landed, the response didn't). So on error we poll a
/// list-by-name filter for a while; only when that comes up empty do we
/// submit a fresh create request and start over.
pub async fn resolve_create(
    api: &dyn CloudApi,
    opts: &CreateMachineOpts,
    policy: &RetryPolicy,
) -> Result<Machine> {
    let mut round = 0u32;
    loop {
        round += 1;
        match api.create_machine(opts).await {
            Ok(machine) => return Ok(machine),
            Err(e) => {
                eprintln!(
                    "⚠️ [reconcile] create request for '{}' failed: {}; checking whether it was created server-side",
                    opts.name, e
                );
                if let Confirm::Found(machine) = confirm_by_listing(api, &opts.name, policy).await {
                    eprintln!(
                        "✅ [reconcile] adopted machine {} ('{}') left behind by the failed request",
                        machine.id, machine.name
                    );
                    return Ok(machine);
                }
            }
        }
        if let Some(max) = policy.max_create_rounds {
            if round >= max {
                return Err(anyhow!(
                    "machine '{}' still absent after {} create rounds",
                    opts.name,
                    round
                ));
            }
        }
        eprintln!(
            "🔁 [reconcile] launching another create request for '{}' (round {})",
            opts.name,
            round + 1
        );
    }
}

/// Poll the account's machine listing for an exact name match.
async fn confirm_by_listing(api: &dyn CloudApi, name: &str, policy: &RetryPolicy) -> Confirm {
    for attempt in 1..=policy.list_attempts {
        match api.list_machines(Some(name)).await {
            Ok(machines) => {
                if let Some(machine) = machines.into_iter().find(|m| m.name == name) {
                    return Confirm::Found(machine);
                }
            }
            Err(e) => {
                // Listing errors count as "not found yet" and burn an attempt.
                eprintln!(
                    "⚠️ [reconcile] list attempt {}/{} for '{}' failed: {}",
                    attempt, policy.list_attempts, name, e
                );
            }
        }
        sleep(policy.poll_interval).await;
    }
    Confirm::Exhausted
}

/// Poll until the machine reports the "running" state and return that
/// snapshot. Transient poll errors and brief 404s right after create are
/// both treated as "not running yet".
pub async fn await_running(
    api: &dyn CloudApi,
    machine: Machine,
    policy: &RetryPolicy,
) -> Result<Machine> {
    let id = machine.id.clone();
    let mut errors = 0u32;
    loop {
        match api.get_machine(&id).await {
            Ok(Some(m)) if m.state == "running" => return Ok(m),
            Ok(Some(m)) => {
                if m.state == "failed" {
                    eprintln!(
                        "⚠️ [reconcile] machine {} reports the failed state; continuing to poll",
                        id
                    );
                } else {
                    tracing::debug!(machine = %id, state = %m.state, "not running yet");
                }
            }
            Ok(None) => {
                tracing::debug!(machine = %id, "machine not visible yet");
            }
            Err(e) => {
                errors += 1;
                eprintln!(
                    "⚠️ [reconcile] polling machine {} failed ({} so far): {}",
                    id, errors, e
                );
                if let Some(max) = policy.max_poll_errors {
                    if errors >= max {
                        return Err(anyhow!(
                            "gave up waiting for machine {} after {} poll errors",
                            id,
                            errors
                        ));
                    }
                }
            }
        }
        sleep(policy.poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use triton_providers::mock::MockCloudApi;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            poll_interval: Duration::from_millis(1),
            ..RetryPolicy::default()
        }
    }

    fn opts() -> CreateMachineOpts {
        CreateMachineOpts {
            name: "dev0".to_string(),
            package: "k4-general-kvm-3.75G".to_string(),
            image: "698a8146".to_string(),
            networks: vec!["f7ed95d3".to_string()],
            firewall_enabled: false,
        }
    }

    #[tokio::test]
    async fn create_success_needs_no_reconciliation() {
        let api = MockCloudApi::new();
        let machine = resolve_create(&api, &opts(), &fast_policy()).await.unwrap();
        assert_eq!(machine.name, "dev0");
        let counts = api.counts();
        assert_eq!(counts.create, 1);
        assert_eq!(counts.list, 0);
    }

    #[tokio::test]
    async fn failed_create_adopts_machine_found_by_listing() {
        // Create errors, but the machine was created server-side and shows
        // up on the second listing poll.
        let api = MockCloudApi::new()
            .fail_creates(1)
            .create_succeeds_server_side(2);
        let machine = resolve_create(&api, &opts(), &fast_policy()).await.unwrap();
        assert_eq!(machine.name, "dev0");
        let counts = api.counts();
        assert_eq!(counts.create, 1);
        assert_eq!(counts.list, 2);
    }

    #[tokio::test]
    async fn exhausted_listing_triggers_a_fresh_create() {
        // Two failed creates with nothing visible server-side, then success.
        let api = MockCloudApi::new().fail_creates(2);
        let policy = RetryPolicy {
            list_attempts: 1,
            ..fast_policy()
        };
        let machine = resolve_create(&api, &opts(), &policy).await.unwrap();
        assert_eq!(machine.name, "dev0");
        let counts = api.counts();
        assert_eq!(counts.create, 3);
        assert_eq!(counts.list, 2);
    }

    #[tokio::test]
    async fn bounded_create_rounds_surface_an_error() {
        let api = MockCloudApi::new().fail_creates(u32::MAX);
        let policy = RetryPolicy {
            list_attempts: 1,
            max_create_rounds: Some(2),
            ..fast_policy()
        };
        let err = resolve_create(&api, &opts(), &policy).await.unwrap_err();
        assert!(err.to_string().contains("2 create rounds"));
        assert_eq!(api.counts().create, 2);
    }

    #[tokio::test]
    async fn await_running_returns_the_running_snapshot() {
        let api = MockCloudApi::new()
            .with_machine(MockCloudApi::machine("m-1", "dev0", "provisioning"))
            .script_get_states(["provisioning", "provisioning", "running"]);
        let machine = MockCloudApi::machine("m-1", "dev0", "provisioning");
        let machine = await_running(&api, machine, &fast_policy()).await.unwrap();
        assert_eq!(machine.state, "running");
        assert_eq!(api.counts().get, 3);
    }

    #[tokio::test]
    async fn await_running_absorbs_transient_errors() {
        let api = MockCloudApi::new()
            .with_machine(MockCloudApi::machine("m-1", "dev0", "provisioning"))
            .fail_gets(2)
            .script_get_states(["running"]);
        let machine = MockCloudApi::machine("m-1", "dev0", "provisioning");
        let machine = await_running(&api, machine, &fast_policy()).await.unwrap();
        assert_eq!(machine.state, "running");
        assert_eq!(api.counts().get, 3);
    }

    #[tokio::test]
    async fn bounded_poll_errors_surface_an_error() {
        let api = MockCloudApi::new().fail_gets(u32::MAX);
        let policy = RetryPolicy {
            max_poll_errors: Some(3),
            ..fast_policy()
        };
        let machine = MockCloudApi::machine("m-1", "dev0", "provisioning");
        let err = await_running(&api, machine, &policy).await.unwrap_err();
        assert!(err.to_string().contains("3 poll errors"));
        assert_eq!(api.counts().get, 3);
    }
}
