use error::*;
use result::Result;
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;

/// Everything one deployment attempt needs, assembled by the embedding
/// layer. Immutable for the duration of the attempt.
#[derive(Debug, Clone)]
pub struct DeploymentConfig {
    /// Path to the cluster configuration file. Also the input to workload
    /// identity derivation, so two attempts against the same file converge
    /// on the same workload.
    pub cluster_config: PathBuf,
    /// Explicit target namespace. `None` defers to the cluster
    /// configuration's current context and ultimately to `default`.
    pub namespace: Option<String>,
    pub hardware: Hardware,
    pub git: GitIdentity,
    pub environments: Vec<CondaEnvironment>,
}

#[derive(Debug, Clone)]
pub struct Hardware {
    pub cpu: String,
    pub memory: String,
    /// GPU selector; `"none"` requests no GPU.
    pub gpu: String,
    pub gpu_count: u32,
    pub volumes: Vec<PvcMount>,
}

#[derive(Debug, Clone)]
pub struct PvcMount {
    pub claim: String,
    /// User-supplied path; sanitized before it reaches a manifest.
    pub mount_path: String,
}

#[derive(Debug, Clone, Default)]
pub struct GitIdentity {
    pub user: Option<String>,
    pub email: Option<String>,
    pub private_key: Option<Vec<u8>>,
    pub public_key: Option<Vec<u8>>,
    /// Caller-supplied known-hosts blob. Nothing is shipped built-in.
    pub known_hosts: Option<Vec<u8>>,
    pub enable_ssh: bool,
}

/// An opaque conda environment definition. The `spec` travels through the
/// core untouched and reaches the container as part of a JSON array in the
/// `CONDA_ENVIRONMENTS` variable.
#[derive(Debug, Clone, Serialize)]
pub struct CondaEnvironment {
    pub name: String,
    pub spec: serde_yaml::Value,
}

/// The canonical quantities actually placed on the container, derived once
/// per attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedResources {
    pub cpu: String,
    pub memory: String,
    pub gpu: Option<GpuRequest>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GpuRequest {
    pub resource_key: String,
    pub count: u32,
}

#[derive(Error, JkError, Fault, Debug)]
pub enum ConfigError {
    #[fault(FaultKind::ConfigInvalid)]
    #[error("the {field} field must not be empty")]
    MissingField { field: &'static str },
    #[fault(FaultKind::ConfigInvalid)]
    #[error("a GPU count of {count} was requested together with the 'none' GPU selector")]
    GpuCountWithoutGpu { count: u32 },
    #[fault(FaultKind::ConfigInvalid)]
    #[error("GPU selector '{selector}' needs a count of at least one")]
    GpuWithoutCount { selector: String },
    #[fault(FaultKind::ConfigInvalid)]
    #[error("environment name '{name}' is used more than once")]
    DuplicateEnvironment { name: String },
    #[fault(FaultKind::ConfigInvalid)]
    #[error("volume claim '{claim}' has an empty mount path")]
    EmptyMountPath { claim: String },
}

impl Hardware {
    /// Canonicalizes the quantities and enforces the GPU coherence rules.
    /// This is the only place user-entered resource strings are interpreted;
    /// failure here means no cluster request was ever made.
    pub fn normalize(&self) -> Result<NormalizedResources> {
        if self.cpu.trim().is_empty() {
            return Err(ConfigError::MissingField { field: "cpu" }.into());
        }
        if self.memory.trim().is_empty() {
            return Err(ConfigError::MissingField { field: "memory" }.into());
        }
        let cpu = quantity::cpu(&self.cpu)?;
        let memory = quantity::memory(&self.memory)?;
        let gpu = match quantity::gpu_resource_key(&self.gpu) {
            None => {
                if self.gpu_count != 0 {
                    return Err(ConfigError::GpuCountWithoutGpu {
                        count: self.gpu_count,
                    }
                    .into());
                }
                None
            }
            Some(resource_key) => {
                if self.gpu_count == 0 {
                    return Err(ConfigError::GpuWithoutCount {
                        selector: self.gpu.clone(),
                    }
                    .into());
                }
                Some(GpuRequest {
                    resource_key: resource_key.to_string(),
                    count: self.gpu_count,
                })
            }
        };
        Ok(NormalizedResources { cpu, memory, gpu })
    }
}

impl DeploymentConfig {
    pub fn validate(&self) -> Result<NormalizedResources> {
        let normalized = self.hardware.normalize()?;
        let mut seen = HashSet::new();
        for environment in &self.environments {
            if environment.name.trim().is_empty() {
                return Err(ConfigError::MissingField {
                    field: "environment name",
                }
                .into());
            }
            if !seen.insert(environment.name.as_str()) {
                return Err(ConfigError::DuplicateEnvironment {
                    name: environment.name.clone(),
                }
                .into());
            }
        }
        for volume in &self.hardware.volumes {
            if volume.claim.trim().is_empty() {
                return Err(ConfigError::MissingField { field: "volume claim" }.into());
            }
            if volume.mount_path.trim().is_empty() {
                return Err(ConfigError::EmptyMountPath {
                    claim: volume.claim.clone(),
                }
                .into());
            }
        }
        Ok(normalized)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn minimal() -> DeploymentConfig {
        DeploymentConfig {
            cluster_config: PathBuf::from("/tmp/kubeconfig"),
            namespace: Some("lab".to_string()),
            hardware: Hardware {
                cpu: "2".to_string(),
                memory: "4Gb".to_string(),
                gpu: "none".to_string(),
                gpu_count: 0,
                volumes: Vec::new(),
            },
            git: GitIdentity {
                user: Some("Alice".to_string()),
                email: Some("a@b.c".to_string()),
                ..GitIdentity::default()
            },
            environments: Vec::new(),
        }
    }

    #[test]
    fn minimal_config_normalizes() {
        let normalized = minimal().validate().unwrap();
        assert_eq!(normalized.cpu, "2");
        assert_eq!(normalized.memory, "4Gi");
        assert!(normalized.gpu.is_none());
    }

    #[test]
    fn bad_memory_fails_before_any_cluster_work() {
        let mut config = minimal();
        config.hardware.memory = "12XB".to_string();
        let err = config.validate().unwrap_err();
        assert_eq!(err.fault(), FaultKind::ConfigInvalid);
    }

    #[test]
    fn gpu_rules() {
        let mut config = minimal();
        config.hardware.gpu = "a100".to_string();
        config.hardware.gpu_count = 0;
        assert_eq!(
            config.validate().unwrap_err().fault(),
            FaultKind::ConfigInvalid
        );

        config.hardware.gpu = "none".to_string();
        config.hardware.gpu_count = 2;
        assert_eq!(
            config.validate().unwrap_err().fault(),
            FaultKind::ConfigInvalid
        );

        config.hardware.gpu = "a100".to_string();
        config.hardware.gpu_count = 2;
        let normalized = config.validate().unwrap();
        assert_eq!(
            normalized.gpu,
            Some(GpuRequest {
                resource_key: "nvidia.com/a100".to_string(),
                count: 2
            })
        );
    }

    #[test]
    fn duplicate_environment_names_are_rejected() {
        let mut config = minimal();
        config.environments = vec![
            CondaEnvironment {
                name: "torch".to_string(),
                spec: serde_yaml::from_str("channels: [conda-forge]").unwrap(),
            },
            CondaEnvironment {
                name: "torch".to_string(),
                spec: serde_yaml::from_str("channels: [defaults]").unwrap(),
            },
        ];
        assert_eq!(
            config.validate().unwrap_err().fault(),
            FaultKind::ConfigInvalid
        );
    }

    #[test]
    fn empty_mount_path_is_rejected() {
        let mut config = minimal();
        config.hardware.volumes = vec![PvcMount {
            claim: "data".to_string(),
            mount_path: "  ".to_string(),
        }];
        assert_eq!(
            config.validate().unwrap_err().fault(),
            FaultKind::ConfigInvalid
        );
    }
}
