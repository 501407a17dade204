use crate::errors::ApiError;
use error::*;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Secret};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use log::{debug, warn};
use result::Result;
use std::convert::TryFrom;
use std::path::Path;
use term_colors::*;

/// A connected cluster: one client plus the namespace every namespaced
/// operation targets. Rebuilt on each connection validation, cheap to clone
/// handles out of.
pub struct Cluster {
    client: Client,
    namespace: String,
}

#[derive(Error, JkError, Fault, Debug)]
#[fault(FaultKind::ConfigInvalid)]
#[error("could not read the cluster configuration file at '{path}'")]
pub struct ClusterConfigUnreadable {
    path: String,
    #[source]
    source: kube::config::KubeconfigError,
}

#[derive(Error, JkError, Fault, Debug)]
#[fault(FaultKind::ConnectAuth)]
#[error("the cluster configuration at '{path}' could not be loaded into a usable client")]
pub struct ClusterConfigRejected {
    path: String,
    #[source]
    source: kube::config::KubeconfigError,
}

impl Cluster {
    /// Builds a client from the given cluster configuration file and resolves
    /// the target namespace: an explicit caller-supplied namespace always
    /// wins, otherwise the configuration's current-context namespace is
    /// used, otherwise we fall back to `default` with a warning.
    pub async fn connect(cluster_config: &Path, namespace: Option<&str>) -> Result<Cluster> {
        let kubeconfig = Kubeconfig::read_from(cluster_config).map_err(|source| {
            ClusterConfigUnreadable {
                path: cluster_config.display().to_string(),
                source,
            }
        })?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|source| ClusterConfigRejected {
                path: cluster_config.display().to_string(),
                source,
            })?;
        let namespace = resolve_namespace(namespace, &config.default_namespace);
        debug!(
            "cluster client targets namespace {}",
            cyan(namespace.as_str())
        );
        let client = Client::try_from(config)
            .map_err(|err| ApiError::classify("client", "bootstrap", &namespace, err))?;
        Ok(Cluster { client, namespace })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn workloads(&self) -> Api<StatefulSet> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn config_maps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn namespaces(&self) -> Api<Namespace> {
        Api::all(self.client.clone())
    }

    /// The trivial discovery request used to validate a connection: asks the
    /// API server for its version and returns it.
    pub async fn ping(&self) -> Result<String> {
        let info = self
            .client
            .apiserver_version()
            .await
            .map_err(|err| ApiError::classify("cluster", "version", &self.namespace, err))?;
        Ok(format!("{}.{}", info.major, info.minor))
    }
}

fn resolve_namespace(explicit: Option<&str>, context_default: &str) -> String {
    if let Some(ns) = explicit {
        let ns = ns.trim();
        if !ns.is_empty() {
            return ns.to_string();
        }
    }
    if context_default.trim().is_empty() {
        warn!("no namespace configured anywhere, falling back to {}", cyan("default"));
        return "default".to_string();
    }
    if context_default == "default" {
        warn!(
            "the cluster configuration names no namespace, using {}",
            cyan("default")
        );
    }
    context_default.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_namespace_wins() {
        assert_eq!(resolve_namespace(Some("lab"), "research"), "lab");
        assert_eq!(resolve_namespace(Some("  lab  "), "research"), "lab");
    }

    #[test]
    fn context_namespace_is_second() {
        assert_eq!(resolve_namespace(None, "research"), "research");
        assert_eq!(resolve_namespace(Some("   "), "research"), "research");
    }

    #[test]
    fn default_is_last_resort() {
        assert_eq!(resolve_namespace(None, ""), "default");
        assert_eq!(resolve_namespace(None, "default"), "default");
    }
}
