//! Orchestrator Configuration
//!
//! Every section has working defaults; a YAML file may override any subset.

use crate::domain::model::ControllerKind;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Coordinator Configuration
// =============================================================================

/// Timing of cluster-wide convergence waits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Delay between convergence polls
    pub poll_interval_ms: u64,
    /// Overall convergence deadline
    pub deadline_ms: u64,
}

impl CoordinatorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            deadline_ms: 120_000,
        }
    }
}

// =============================================================================
// Layout Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Differencing-disk data file suffixes (`<base>-<ext>.vmdk`)
    pub linked_extensions: Vec<String>,
    /// Folder names skipped by the recursive disk search
    pub search_exclusions: Vec<String>,
    pub search_max_depth: usize,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            linked_extensions: vec!["delta".to_string(), "sesparse".to_string()],
            search_exclusions: vec![
                ".snapshot".to_string(),
                ".sdd.sf".to_string(),
                ".vSphere-HA".to_string(),
                ".dvsData".to_string(),
                ".lck".to_string(),
            ],
            search_max_depth: 3,
        }
    }
}

// =============================================================================
// Pipeline Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Version written into `.ova.meta` manifests
    pub meta_version: String,
    /// Name of the properties file written next to templates
    pub properties_file: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            meta_version: "1.0".to_string(),
            properties_file: "template.properties".to_string(),
        }
    }
}

// =============================================================================
// Orchestrator Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Hypervisor management endpoint sessions are opened against
    pub endpoint: String,
    /// Prefix of disposable helper VM names
    pub helper_vm_prefix: String,
    /// Snapshot on a template VM that linked clones reference
    pub template_base_snapshot: String,
    /// Bus used when attaching disks
    pub default_controller: ControllerKind,
    pub coordinator: CoordinatorConfig,
    pub layout: LayoutConfig,
    pub pipeline: PipelineConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            endpoint: "vcenter.local".to_string(),
            helper_vm_prefix: "helper-".to_string(),
            template_base_snapshot: "cloud.template.base".to_string(),
            default_controller: ControllerKind::Scsi,
            coordinator: CoordinatorConfig::default(),
            layout: LayoutConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.coordinator.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.coordinator.deadline(), Duration::from_secs(120));
        assert!(config.layout.linked_extensions.contains(&"delta".to_string()));
    }

    #[test]
    fn test_partial_yaml_overrides() {
        let yaml = r#"
endpoint: vc01.example.com
coordinator:
  deadline_ms: 3000
layout:
  linked_extensions: [delta]
"#;
        let config = OrchestratorConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.endpoint, "vc01.example.com");
        assert_eq!(config.coordinator.deadline_ms, 3000);
        assert_eq!(config.coordinator.poll_interval_ms, 5000);
        assert_eq!(config.layout.linked_extensions, vec!["delta"]);
        assert_eq!(config.template_base_snapshot, "cloud.template.base");
    }
}
