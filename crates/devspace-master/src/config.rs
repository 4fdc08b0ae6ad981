// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for devspace-master.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::activity::{ActivityConfig, IdleCheckerConfig};
use crate::cluster::{ClusterConfig, PartitionPolicy};
use crate::infrastructure::{DockerSettings, KubernetesSettings};
use crate::runtimes::RuntimesConfig;

/// Infrastructure names accepted in `DEVSPACE_INFRASTRUCTURE`.
pub const KNOWN_INFRASTRUCTURES: &[&str] = &["docker", "kubernetes", "openshift", "noop"];

/// Master configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// This node's id in the cluster.
    pub node_id: String,
    /// Infrastructures to register, in registration order.
    pub infrastructures: Vec<String>,
    /// Activity tracking settings.
    pub activity: ActivityConfig,
    /// Idle checker settings.
    pub idle_checker: IdleCheckerConfig,
    /// Lifecycle settings.
    pub runtimes: RuntimesConfig,
    /// Bounded wait for a workspace lock.
    pub lock_timeout: Duration,
    /// Local engine settings.
    pub docker: DockerSettings,
    /// Kubernetes and OpenShift settings.
    pub kubernetes: KubernetesSettings,
    /// Group membership; `None` runs a single node.
    ///
    /// A `RequireQuorum` policy with `expected_members == 0` takes the member count of the
    /// discovery file.
    pub cluster: Option<ClusterConfig>,
    /// SQLite URL of the shared stores; `None` keeps them in memory.
    pub database_url: Option<String>,
    /// Workspaces seeded into the in-memory repository.
    pub workspaces_file: Option<PathBuf>,
    /// Local engine CLI.
    pub docker_binary: String,
    /// Cluster CLI; `kubectl` for Kubernetes and `oc` for OpenShift when unset.
    pub kubectl_binary: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns the value of a variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let node_id = var("DEVSPACE_NODE_ID").unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let infrastructures: Vec<String> = var("DEVSPACE_INFRASTRUCTURE")
            .unwrap_or_else(|| "docker".to_string())
            .split(',')
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        if let Some(unknown) = infrastructures
            .iter()
            .find(|name| !KNOWN_INFRASTRUCTURES.contains(&name.as_str()))
        {
            return Err(ConfigError::Invalid(
                "DEVSPACE_INFRASTRUCTURE",
                format!("unknown infrastructure '{unknown}'"),
            ));
        }
        if infrastructures.is_empty() {
            return Err(ConfigError::Invalid(
                "DEVSPACE_INFRASTRUCTURE",
                "no infrastructure listed".to_string(),
            ));
        }

        let activity = ActivityConfig {
            min_report_interval: secs(&var, "DEVSPACE_ACTIVITY_MIN_REPORT_SECS", 60)?,
            default_idle_timeout: secs(&var, "DEVSPACE_IDLE_TIMEOUT_SECS", 1800)?,
        };
        let idle_checker = IdleCheckerConfig {
            check_interval: secs(&var, "DEVSPACE_ACTIVITY_CHECK_INTERVAL_SECS", 60)?,
            run_timeout: secs(&var, "DEVSPACE_RUN_TIMEOUT_SECS", 0)?,
            ..IdleCheckerConfig::default()
        };
        if idle_checker.check_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "DEVSPACE_ACTIVITY_CHECK_INTERVAL_SECS",
                "must be positive".to_string(),
            ));
        }
        let runtimes = RuntimesConfig {
            start_timeout: secs(&var, "DEVSPACE_START_TIMEOUT_SECS", 300)?,
        };
        let lock_timeout = secs(&var, "DEVSPACE_LOCK_TIMEOUT_SECS", 30)?;

        let default_memory_limit: i64 =
            parse(&var, "DEVSPACE_DEFAULT_MEMORY_LIMIT")?.unwrap_or(1024 * 1024 * 1024);
        if default_memory_limit <= 0 {
            return Err(ConfigError::Invalid(
                "DEVSPACE_DEFAULT_MEMORY_LIMIT",
                "must be positive".to_string(),
            ));
        }
        let memory_swap_multiplier: f64 =
            parse(&var, "DEVSPACE_MEMORY_SWAP_MULTIPLIER")?.unwrap_or(1.0);
        if !memory_swap_multiplier.is_finite() || memory_swap_multiplier < 0.0 {
            return Err(ConfigError::Invalid(
                "DEVSPACE_MEMORY_SWAP_MULTIPLIER",
                "must be a non-negative number".to_string(),
            ));
        }
        let docker = DockerSettings {
            default_memory_limit,
            memory_swap_multiplier,
            pids_limit: parse(&var, "DEVSPACE_PIDS_LIMIT")?.unwrap_or(-1),
            cgroup_parent: var("DEVSPACE_CGROUP_PARENT"),
            excluded_volumes: var("DEVSPACE_SNAPSHOT_EXCLUDED_VOLUMES")
                .map(|v| list(&v))
                .unwrap_or_default(),
            ..DockerSettings::default()
        };
        let kubernetes = KubernetesSettings {
            default_memory_limit,
            ..KubernetesSettings::default()
        };

        let cluster = match var("DEVSPACE_CLUSTER_GROUP") {
            None => None,
            Some(group_name) => {
                let discovery_file = var("DEVSPACE_CLUSTER_CONFIG")
                    .map(PathBuf::from)
                    .ok_or(ConfigError::MissingEnvVar("DEVSPACE_CLUSTER_CONFIG"))?;
                let policy = match var("DEVSPACE_CLUSTER_PARTITION_POLICY").as_deref() {
                    None | Some("fail-open") => PartitionPolicy::FailOpen,
                    Some("require-quorum") => PartitionPolicy::RequireQuorum {
                        expected_members: 0,
                    },
                    Some(other) => {
                        return Err(ConfigError::Invalid(
                            "DEVSPACE_CLUSTER_PARTITION_POLICY",
                            format!("expected 'fail-open' or 'require-quorum', got '{other}'"),
                        ));
                    }
                };
                Some(ClusterConfig {
                    group_name,
                    discovery_file,
                    policy,
                })
            }
        };

        let database_url = var("DEVSPACE_DATABASE_URL");
        if cluster.is_some() {
            match database_url.as_deref() {
                None => return Err(ConfigError::MissingEnvVar("DEVSPACE_DATABASE_URL")),
                Some(url) if url.contains(":memory:") => {
                    return Err(ConfigError::Invalid(
                        "DEVSPACE_DATABASE_URL",
                        "a cluster needs a database shared by all nodes".to_string(),
                    ));
                }
                Some(_) => {}
            }
        }

        Ok(Self {
            node_id,
            infrastructures,
            activity,
            idle_checker,
            runtimes,
            lock_timeout,
            docker,
            kubernetes,
            cluster,
            database_url,
            workspaces_file: var("DEVSPACE_WORKSPACES_FILE").map(PathBuf::from),
            docker_binary: var("DEVSPACE_DOCKER_BINARY").unwrap_or_else(|| "docker".to_string()),
            kubectl_binary: var("DEVSPACE_KUBECTL_BINARY"),
        })
    }
}

fn parse<T, F>(var: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    var(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| ConfigError::Invalid(name, format!("'{raw}': {e}")))
        })
        .transpose()
}

fn secs<F>(var: &F, name: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(Duration::from_secs(parse(var, name)?.unwrap_or(default)))
}

fn list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable has an unusable value.
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert!(uuid::Uuid::parse_str(&config.node_id).is_ok());
        assert_eq!(config.infrastructures, vec!["docker"]);
        assert_eq!(config.activity.default_idle_timeout, Duration::from_secs(1800));
        assert_eq!(config.activity.min_report_interval, Duration::from_secs(60));
        assert_eq!(config.idle_checker.run_timeout, Duration::ZERO);
        assert_eq!(config.lock_timeout, Duration::from_secs(30));
        assert_eq!(config.runtimes.start_timeout, Duration::from_secs(300));
        assert_eq!(config.docker.pids_limit, -1);
        assert!(config.cluster.is_none());
        assert!(config.database_url.is_none());
        assert_eq!(config.docker_binary, "docker");
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("DEVSPACE_NODE_ID", "master-1"),
            ("DEVSPACE_INFRASTRUCTURE", "noop, Kubernetes"),
            ("DEVSPACE_IDLE_TIMEOUT_SECS", "0"),
            ("DEVSPACE_RUN_TIMEOUT_SECS", "3600"),
            ("DEVSPACE_DEFAULT_MEMORY_LIMIT", "536870912"),
            ("DEVSPACE_SNAPSHOT_EXCLUDED_VOLUMES", "/tmp, /cache"),
            ("DEVSPACE_CLUSTER_GROUP", "masters"),
            ("DEVSPACE_CLUSTER_CONFIG", "/etc/devspace/cluster.json"),
            ("DEVSPACE_CLUSTER_PARTITION_POLICY", "require-quorum"),
            ("DEVSPACE_DATABASE_URL", "sqlite:///var/lib/devspace/devspace.db"),
        ])
        .unwrap();
        assert_eq!(config.node_id, "master-1");
        assert_eq!(config.infrastructures, vec!["noop", "kubernetes"]);
        assert!(config.activity.default_idle_timeout.is_zero());
        assert_eq!(config.idle_checker.run_timeout, Duration::from_secs(3600));
        assert_eq!(config.docker.default_memory_limit, 536870912);
        assert_eq!(config.kubernetes.default_memory_limit, 536870912);
        assert_eq!(config.docker.excluded_volumes, vec!["/tmp", "/cache"]);
        let cluster = config.cluster.unwrap();
        assert_eq!(cluster.group_name, "masters");
        assert_eq!(
            cluster.policy,
            PartitionPolicy::RequireQuorum { expected_members: 0 }
        );
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            load(&[("DEVSPACE_LOCK_TIMEOUT_SECS", "soon")]),
            Err(ConfigError::Invalid("DEVSPACE_LOCK_TIMEOUT_SECS", _))
        ));
        assert!(matches!(
            load(&[("DEVSPACE_INFRASTRUCTURE", "docker,podman")]),
            Err(ConfigError::Invalid("DEVSPACE_INFRASTRUCTURE", _))
        ));
        assert!(matches!(
            load(&[("DEVSPACE_MEMORY_SWAP_MULTIPLIER", "-1")]),
            Err(ConfigError::Invalid("DEVSPACE_MEMORY_SWAP_MULTIPLIER", _))
        ));
        assert!(matches!(
            load(&[("DEVSPACE_CLUSTER_GROUP", "masters")]),
            Err(ConfigError::MissingEnvVar("DEVSPACE_CLUSTER_CONFIG"))
        ));
        assert!(matches!(
            load(&[
                ("DEVSPACE_CLUSTER_GROUP", "masters"),
                ("DEVSPACE_CLUSTER_CONFIG", "c.json"),
                ("DEVSPACE_CLUSTER_PARTITION_POLICY", "majority"),
            ]),
            Err(ConfigError::Invalid("DEVSPACE_CLUSTER_PARTITION_POLICY", _))
        ));
    }

    #[test]
    fn test_cluster_requires_shared_database() {
        let cluster = [
            ("DEVSPACE_CLUSTER_GROUP", "masters"),
            ("DEVSPACE_CLUSTER_CONFIG", "c.json"),
        ];
        assert!(matches!(
            load(&cluster),
            Err(ConfigError::MissingEnvVar("DEVSPACE_DATABASE_URL"))
        ));
        let in_memory = [cluster[0], cluster[1], ("DEVSPACE_DATABASE_URL", "sqlite::memory:")];
        assert!(matches!(
            load(&in_memory),
            Err(ConfigError::Invalid("DEVSPACE_DATABASE_URL", _))
        ));
        let shared = [cluster[0], cluster[1], ("DEVSPACE_DATABASE_URL", "sqlite://devspace.db")];
        assert!(load(&shared).unwrap().cluster.is_some());

        // A single node may keep its state in memory.
        assert!(load(&[("DEVSPACE_DATABASE_URL", "sqlite::memory:")]).is_ok());
    }
}
