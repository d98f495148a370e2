//! Agent configuration: which events and node conditions trigger a drain,
//! plus runtime knobs. Values come from `/etc/mechanic/mechanic.yaml` layered
//! under `MECHANIC_`-prefixed environment variables, and are re-checked
//! periodically so edits take effect on subsequent reconcile passes.
use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use snafu::{ResultExt, Snafu};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::constants;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/mechanic/mechanic.yaml";
pub const ENV_PREFIX: &str = "MECHANIC";
pub const NODE_NAME_ENV_VAR: &str = "MECHANIC_NODE_NAME";

const RELOAD_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const MIN_POLLING_INTERVAL_SECONDS: u64 = 1;

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    #[snafu(display("Unable to read configuration sources: {source}"))]
    ReadSources { source: config::ConfigError },

    #[snafu(display("Unable to deserialize configuration: {source}"))]
    Deserialize { source: config::ConfigError },
}

/// Which VM scheduled events should trigger a node drain.
///
/// `freeze` governs regular freezes; `live_migration` governs
/// memory-preserving live migrations. The two are distinct policies even
/// though both arrive as `Freeze` events on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScheduledEventDrainConditions {
    pub freeze: bool,
    pub reboot: bool,
    pub redeploy: bool,
    pub preempt: bool,
    pub terminate: bool,
    pub live_migration: bool,
}

impl Default for ScheduledEventDrainConditions {
    fn default() -> Self {
        ScheduledEventDrainConditions {
            freeze: false,
            reboot: false,
            redeploy: true,
            preempt: true,
            terminate: true,
            live_migration: true,
        }
    }
}

impl ScheduledEventDrainConditions {
    /// The node condition types that would trigger a drain under this policy.
    pub fn drainable_condition_types(&self) -> Vec<&'static str> {
        let mut types = Vec::new();

        // Both freeze policies map onto the same condition type; the
        // freeze-vs-live-migration split is resolved against the metadata
        // service, not the node condition.
        if self.freeze || self.live_migration {
            types.push(constants::FREEZE_SCHEDULED);
        }
        if self.reboot {
            types.push(constants::REBOOT_SCHEDULED);
        }
        if self.redeploy {
            types.push(constants::REDEPLOY_SCHEDULED);
        }
        if self.preempt {
            types.push(constants::PREEMPT_SCHEDULED);
        }
        if self.terminate {
            types.push(constants::TERMINATE_SCHEDULED);
        }

        types
    }
}

/// Additional host-health node conditions that should trigger a drain, and
/// the polling interval used when the node problem detector is bypassed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OptionalDrainConditions {
    pub kubelet_problem: bool,
    pub kernel_deadlock: bool,
    pub frequent_kubelet_restarts: bool,
    pub frequent_containerd_restarts: bool,
    pub fs_corrupt: bool,
    /// Polling-mode interval in seconds. Enforced minimum of 1.
    pub polling_interval: u64,
}

impl Default for OptionalDrainConditions {
    fn default() -> Self {
        OptionalDrainConditions {
            kubelet_problem: false,
            kernel_deadlock: false,
            frequent_kubelet_restarts: false,
            frequent_containerd_restarts: false,
            fs_corrupt: false,
            polling_interval: 30,
        }
    }
}

impl OptionalDrainConditions {
    pub fn drainable_condition_types(&self) -> Vec<&'static str> {
        let mut types = Vec::new();

        if self.kubelet_problem {
            types.push(constants::KUBELET_PROBLEM);
        }
        if self.kernel_deadlock {
            types.push(constants::KERNEL_DEADLOCK);
        }
        if self.frequent_kubelet_restarts {
            types.push(constants::FREQUENT_KUBELET_RESTART);
        }
        if self.frequent_containerd_restarts {
            types.push(constants::FREQUENT_CONTAINERD_RESTART);
        }
        if self.fs_corrupt {
            types.push(constants::FILE_SYSTEM_CORRUPTION_PROBLEM);
        }

        types
    }
}

/// The full agent configuration, one immutable snapshot per reconcile pass.
// The snake_case aliases accept the keys produced by the environment source,
// which lowercases MECHANIC_NODE_NAME into `node_name` and so on.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MechanicConfig {
    #[serde(alias = "scheduled_events")]
    pub scheduled_events: ScheduledEventDrainConditions,
    #[serde(alias = "optional_conditions")]
    pub optional_conditions: OptionalDrainConditions,
    #[serde(alias = "runtime_env")]
    pub runtime_env: String,
    #[serde(alias = "enable_tracing")]
    pub enable_tracing: bool,
    #[serde(alias = "bypass_node_problem_detector")]
    pub bypass_node_problem_detector: bool,
    #[serde(alias = "node_name")]
    pub node_name: String,
}

impl Default for MechanicConfig {
    fn default() -> Self {
        MechanicConfig {
            scheduled_events: ScheduledEventDrainConditions::default(),
            optional_conditions: OptionalDrainConditions::default(),
            runtime_env: "prod".to_string(),
            enable_tracing: true,
            bypass_node_problem_detector: false,
            node_name: String::new(),
        }
    }
}

impl MechanicConfig {
    /// Read configuration from the given file (optional) layered under
    /// `MECHANIC_*` environment variables. The polling interval is floored at
    /// one second.
    pub fn load(path: &Path) -> Result<MechanicConfig> {
        let sources = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .context(ReadSourcesSnafu)?;

        let mut config: MechanicConfig = sources.try_deserialize().context(DeserializeSnafu)?;

        if config.optional_conditions.polling_interval < MIN_POLLING_INTERVAL_SECONDS {
            warn!(
                provided_interval_seconds = config.optional_conditions.polling_interval,
                "polling interval is below the minimum, resetting to 1 second"
            );
            config.optional_conditions.polling_interval = MIN_POLLING_INTERVAL_SECONDS;
        }

        debug!(?config, "configuration loaded");
        Ok(config)
    }

    /// The enumerated defaults, with the node name still taken from the
    /// environment so a malformed config file cannot cost us our identity.
    pub fn fallback_defaults() -> MechanicConfig {
        MechanicConfig {
            node_name: env::var(NODE_NAME_ENV_VAR).unwrap_or_default(),
            ..MechanicConfig::default()
        }
    }
}

/// Shared handle to the live configuration. Reconcile passes take a snapshot
/// at entry; the reload task replaces the value in place.
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<MechanicConfig>>,
}

impl SharedConfig {
    pub fn new(config: MechanicConfig) -> Self {
        SharedConfig {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    pub fn snapshot(&self) -> MechanicConfig {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn replace(&self, config: MechanicConfig) {
        match self.inner.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }
}

/// Spawn the hot-reload task: every ten seconds, hash the config file and the
/// `MECHANIC_*` environment; on change, re-read configuration so the next
/// reconcile pass sees the new values. A failed re-read keeps the previous
/// configuration.
pub fn spawn_reload_task(shared: SharedConfig, path: PathBuf) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut previous = fingerprint(&path);
        let mut ticker = tokio::time::interval(RELOAD_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let current = fingerprint(&path);
            if current == previous {
                continue;
            }
            previous = current;

            match MechanicConfig::load(&path) {
                Ok(config) => {
                    info!(
                        runtime_env = %config.runtime_env,
                        node = %config.node_name,
                        "configuration change detected, reloaded"
                    );
                    shared.replace(config);
                }
                Err(err) => {
                    warn!(error = %err, "failed to reload configuration, keeping previous values");
                }
            }
        }
    })
}

/// A stable hash of the config file contents and the current `MECHANIC_*`
/// environment variables.
fn fingerprint(path: &Path) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(std::fs::read(path).unwrap_or_default());

    let mut envs: Vec<String> = env::vars()
        .filter(|(key, _)| key.starts_with(ENV_PREFIX))
        .map(|(key, value)| format!("{key}={value}"))
        .collect();
    envs.sort();
    for entry in &envs {
        hasher.update(b"|");
        hasher.update(entry.as_bytes());
    }

    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let config = MechanicConfig::default();

        assert!(!config.scheduled_events.freeze);
        assert!(!config.scheduled_events.reboot);
        assert!(config.scheduled_events.redeploy);
        assert!(config.scheduled_events.preempt);
        assert!(config.scheduled_events.terminate);
        assert!(config.scheduled_events.live_migration);

        let optional = &config.optional_conditions;
        assert!(!optional.kubelet_problem);
        assert!(!optional.kernel_deadlock);
        assert!(!optional.frequent_kubelet_restarts);
        assert!(!optional.frequent_containerd_restarts);
        assert!(!optional.fs_corrupt);
        assert_eq!(optional.polling_interval, 30);

        assert_eq!(config.runtime_env, "prod");
        assert!(config.enable_tracing);
        assert!(!config.bypass_node_problem_detector);
    }

    #[test]
    fn default_drainable_condition_types() {
        let config = MechanicConfig::default();

        // live_migration alone is enough to enable the freeze condition type.
        let types = config.scheduled_events.drainable_condition_types();
        assert_eq!(
            types,
            vec![
                constants::FREEZE_SCHEDULED,
                constants::REDEPLOY_SCHEDULED,
                constants::PREEMPT_SCHEDULED,
                constants::TERMINATE_SCHEDULED,
            ]
        );

        assert!(config
            .optional_conditions
            .drainable_condition_types()
            .is_empty());
    }

    #[test]
    fn optional_condition_types_follow_flags() {
        let optional = OptionalDrainConditions {
            kernel_deadlock: true,
            fs_corrupt: true,
            ..OptionalDrainConditions::default()
        };

        assert_eq!(
            optional.drainable_condition_types(),
            vec![
                constants::KERNEL_DEADLOCK,
                constants::FILE_SYSTEM_CORRUPTION_PROBLEM
            ]
        );
    }

    #[test]
    fn polling_interval_floor_applies() {
        let dir = std::env::temp_dir().join("mechanic-config-floor-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("mechanic.yaml");
        std::fs::write(&path, "optionalConditions:\n  pollingInterval: 0\n").unwrap();

        let config = MechanicConfig::load(&path).unwrap();
        assert_eq!(config.optional_conditions.polling_interval, 1);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = std::env::temp_dir().join("mechanic-config-file-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("mechanic.yaml");
        std::fs::write(
            &path,
            concat!(
                "scheduledEvents:\n",
                "  freeze: true\n",
                "  liveMigration: false\n",
                "optionalConditions:\n",
                "  kernelDeadlock: true\n",
                "runtimeEnv: dev\n",
                "bypassNodeProblemDetector: true\n",
            ),
        )
        .unwrap();

        let config = MechanicConfig::load(&path).unwrap();
        assert!(config.scheduled_events.freeze);
        assert!(!config.scheduled_events.live_migration);
        // untouched keys keep their defaults
        assert!(config.scheduled_events.terminate);
        assert!(config.optional_conditions.kernel_deadlock);
        assert_eq!(config.runtime_env, "dev");
        assert!(config.bypass_node_problem_detector);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let path = Path::new("/definitely/not/a/mechanic.yaml");
        let config = MechanicConfig::load(path).unwrap();
        assert_eq!(config.scheduled_events, MechanicConfig::default().scheduled_events);
    }

    #[test]
    fn fingerprint_changes_with_env() {
        let path = Path::new("/definitely/not/a/mechanic.yaml");
        let before = fingerprint(path);
        env::set_var("MECHANIC_FINGERPRINT_PROBE", "1");
        let after = fingerprint(path);
        env::remove_var("MECHANIC_FINGERPRINT_PROBE");

        assert_ne!(before, after);
        assert_eq!(fingerprint(path), before);
    }
}
