//! Configuration schema v1alpha1 (spec.md §6). Loaded with the `config`
//! crate layered over `base.yaml` + an environment overlay, the same
//! pattern the teacher's `qarax::configuration::get_configuration` uses.

use std::collections::HashMap;
use std::path::Path;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

pub const API_VERSION: &str = "v1alpha1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControllerMode {
    Standalone,
    Kubernetes,
    StandaloneExternalMetrics,
    KubernetesExternalMetrics,
}

impl Default for ControllerMode {
    fn default() -> Self {
        ControllerMode::Standalone
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabasesSettings {
    pub collection_interval: u64,
    pub max_host_connection_threads: usize,
    pub host_connection_queue_size: usize,
    pub host_connection_timeout: u64,
    pub state: StateSettings,
    pub timeseries: TimeseriesSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StateSettings {
    Sqlite { connection: Option<String> },
    Mysql { connection: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TimeseriesSettings {
    Memory { trailing: u64 },
    Csv { trailing: u64, dbfile: String },
    Influxdb { trailing: u64, connection: String },
}

impl TimeseriesSettings {
    pub fn trailing_secs(&self) -> u64 {
        match self {
            TimeseriesSettings::Memory { trailing }
            | TimeseriesSettings::Csv { trailing, .. }
            | TimeseriesSettings::Influxdb { trailing, .. } => *trailing,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CertificatesSettings {
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformSettings {
    pub domain: Option<String>,
    #[serde(skip_serializing)]
    pub token: Option<SecretString>,
    #[serde(default)]
    pub certificates: CertificatesSettings,
    pub actions_queue_max_size: usize,
}

impl PlatformSettings {
    /// spec.md §4.5: a missing or empty token puts the controller into
    /// standalone mode.
    pub fn standalone(&self) -> bool {
        match &self.token {
            None => true,
            Some(token) => token.expose_secret().is_empty(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationSettings {
    pub interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesSettings {
    pub cpu_cores: Option<u32>,
    pub memory_bytes: Option<u64>,
    pub storage_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    pub name: String,
    pub address: String,
    pub protocol: crate::model::host::Transport,
    pub port: u16,
    pub hypervisor: crate::model::host::HypervisorKind,
    pub user: Option<String>,
    #[serde(default, skip_serializing)]
    pub ssh_key: Option<SecretString>,
    pub timeout: Option<u64>,
    pub resources: Option<ResourcesSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupConfig {
    pub image: String,
    pub domain_name: String,
    pub image_migration_type: Option<String>,
    pub cloud_init: Option<String>,
    pub hosts: Vec<String>,
    pub replacement: crate::model::asg::Replacement,
    pub networking: crate::model::asg::NetworkSpec,
    pub scaling: GroupScalingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupScalingConfig {
    pub min: u32,
    pub max: u32,
    pub desired: u32,
    pub increment: u32,
    pub cooldown: u64,
    pub method: crate::model::asg::ScalingMethod,
    pub target_utilization: crate::model::asg::UtilizationTargets,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoscaleSettings {
    pub hosts: Vec<HostConfig>,
    pub groups: HashMap<String, GroupConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthcheckSettings {
    pub host: String,
    pub port: u16,
}

impl Default for HealthcheckSettings {
    fn default() -> Self {
        HealthcheckSettings { host: "0.0.0.0".into(), port: 8080 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSettings {
    pub mode: ControllerMode,
    pub databases: DatabasesSettings,
    pub platform: PlatformSettings,
    pub reconciliation: ReconciliationSettings,
    pub autoscale: AutoscaleSettings,
    #[serde(default)]
    pub healthcheck: HealthcheckSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub api_version: String,
    pub controller: ControllerSettings,
}

impl Settings {
    /// Validate and normalize boundary properties (spec.md §8):
    /// `collectionInterval == 0` is rejected; `hostConnectionQueueSize <
    /// maxHostConnectionThreads` is silently clamped up.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.api_version != API_VERSION {
            return Err(ConfigError::UnknownVersion(self.api_version));
        }

        let db = &mut self.controller.databases;
        if db.collection_interval == 0 {
            return Err(ConfigError::InvalidValue {
                field: "controller.databases.collectionInterval".into(),
                detail: "must be greater than 0".into(),
            });
        }
        if db.max_host_connection_threads == 0 {
            return Err(ConfigError::InvalidValue {
                field: "controller.databases.maxHostConnectionThreads".into(),
                detail: "must be greater than 0".into(),
            });
        }
        if db.host_connection_queue_size < db.max_host_connection_threads {
            db.host_connection_queue_size = db.max_host_connection_threads;
        }
        if self.controller.reconciliation.interval == 0 {
            return Err(ConfigError::InvalidValue {
                field: "controller.reconciliation.interval".into(),
                detail: "must be greater than 0".into(),
            });
        }

        for (name, group) in &self.controller.autoscale.groups {
            if group.scaling.min > group.scaling.max {
                return Err(ConfigError::InvalidValue {
                    field: format!("controller.autoscale.groups.{name}.scaling"),
                    detail: "min must be <= max".into(),
                });
            }
        }

        Ok(self)
    }

    /// The page size the MetricsCollector uses:
    /// `max(1, maxHostConnectionThreads, hostConnectionQueueSize)` (spec.md §4.2).
    pub fn collection_page_size(&self) -> usize {
        let db = &self.controller.databases;
        1.max(db.max_host_connection_threads).max(db.host_connection_queue_size)
    }
}

fn expand_str(input: &str) -> String {
    if !input.contains('$') {
        return input.to_string();
    }
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' {
            let mut name = String::new();
            while let Some(&next) = chars.peek() {
                if next.is_alphanumeric() || next == '_' {
                    name.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            if name.is_empty() {
                out.push('$');
            } else {
                out.push_str(&std::env::var(&name).unwrap_or_default());
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Load config from `path`, expanding `$VAR` references against the process
/// environment exactly once (spec.md §6), then layering it through the
/// `config` crate the same way `qarax::configuration::get_configuration`
/// layers `base.yaml`/`{environment}.yaml`, and validating.
pub fn load(path: &Path) -> Result<Settings, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Load(config::ConfigError::Message(e.to_string())))?;
    let expanded = expand_str(&raw);

    let built = config::Config::builder()
        .add_source(config::File::from_str(&expanded, config::FileFormat::Yaml))
        .build()?;
    let settings: Settings = built.try_deserialize()?;
    settings.validate()
}

/// Render `settings` back to YAML with secrets masked, i.e. the
/// `configRender` side of the `configParse(configRender(c)) == c` round-trip
/// property (spec.md §8) — secrets are intentionally excluded from the
/// round-trip since they must never be re-read from disk (spec.md §6).
pub fn render(settings: &Settings) -> Result<String, ConfigError> {
    Ok(serde_yaml::to_string(settings)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
apiVersion: v1alpha1
controller:
  mode: standalone
  databases:
    collectionInterval: 30
    maxHostConnectionThreads: 4
    hostConnectionQueueSize: 2
    hostConnectionTimeout: 5
    state:
      type: sqlite
      connection: null
    timeseries:
      type: memory
      trailing: 600
  platform:
    domain: null
    token: null
    certificates:
      path: null
    actionsQueueMaxSize: 100
  reconciliation:
    interval: 15
  autoscale:
    hosts: []
    groups: {}
  healthcheck:
    host: 0.0.0.0
    port: 8080
"#
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn queue_size_clamps_up_to_thread_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, minimal_yaml());
        let settings = load(&path).unwrap();
        assert_eq!(settings.controller.databases.host_connection_queue_size, 4);
    }

    #[test]
    fn zero_collection_interval_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = minimal_yaml().replace("collectionInterval: 30", "collectionInterval: 0");
        let path = write_config(&dir, &yaml);
        assert!(load(&path).is_err());
    }

    #[test]
    fn env_var_expansion() {
        std::env::set_var("PREMISCALE_TEST_HOST", "10.9.9.9");
        let expanded = expand_str("$PREMISCALE_TEST_HOST");
        assert_eq!(expanded, "10.9.9.9");
        std::env::remove_var("PREMISCALE_TEST_HOST");
    }

    #[test]
    fn env_var_expansion_inside_loaded_config() {
        std::env::set_var("PREMISCALE_TEST_TOKEN", "s3cr3t");
        let dir = tempfile::tempdir().unwrap();
        let yaml = minimal_yaml().replace("token: null", "token: \"$PREMISCALE_TEST_TOKEN\"");
        let path = write_config(&dir, &yaml);
        let settings = load(&path).unwrap();
        assert!(!settings.controller.platform.standalone());
        std::env::remove_var("PREMISCALE_TEST_TOKEN");
    }

    #[test]
    fn config_round_trips_through_render() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, minimal_yaml());
        let settings = load(&path).unwrap();
        let rendered = render(&settings).unwrap();
        let reparsed: Settings = serde_yaml::from_str(&rendered).unwrap();
        let reparsed = reparsed.validate().unwrap();
        assert_eq!(reparsed.api_version, settings.api_version);
        assert_eq!(
            reparsed.controller.databases.collection_interval,
            settings.controller.databases.collection_interval
        );
    }
}
