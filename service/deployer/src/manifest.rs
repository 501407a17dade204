//! Pure builders for the cluster objects one deployment owns. Same
//! configuration in, byte-identical objects out; nothing in here talks to a
//! cluster.

use crate::config::{DeploymentConfig, NormalizedResources};
use error::*;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Secret;
use result::Result;
use serde_json::json;

/// The notebook image every workload runs.
pub const JUPYTER_IMAGE: &str = "ghcr.io/jupyter-kube/jupyterlab:latest";

/// The container port JupyterLab listens on.
pub const JUPYTER_PORT: u16 = 8888;

pub const SSH_SECRET_NAME: &str = "jupyter-ssh-key";
pub const GIT_SECRET_NAME: &str = "jupyter-git-config";

const SSH_MOUNT_PATH: &str = "/home/jovyan/.ssh";
// Octal 0600 / 0644 as the decimal values the API expects.
const MODE_PRIVATE: i32 = 384;
const MODE_SHARED: i32 = 420;

#[derive(Error, JkError, Fault, Debug)]
#[fault(FaultKind::Internal)]
#[error(
    "failed to assemble the {kind} manifest for '{name}'. This should not be possible for \
any accepted configuration and is worth reporting as a bug."
)]
pub struct ManifestError {
    kind: &'static str,
    name: String,
    #[source]
    source: serde_json::Error,
}

fn labels(instance: &str) -> serde_json::Value {
    json!({
        "app": k8s::APP_LABEL,
        "component": k8s::COMPONENT_LABEL,
        "instance": instance,
    })
}

fn wants_ssh(config: &DeploymentConfig) -> bool {
    config.git.enable_ssh && config.git.private_key.is_some()
}

/// The SSH key secret, when SSH is enabled and a key was supplied. The
/// private key is the only required item; the public key and a
/// caller-supplied known-hosts blob ride along when present.
pub fn ssh_key_secret(config: &DeploymentConfig, namespace: &str) -> Result<Option<Secret>> {
    let private_key = match (&config.git.private_key, wants_ssh(config)) {
        (Some(key), true) => key,
        _ => return Ok(None),
    };
    let mut data = serde_json::Map::new();
    data.insert("id_rsa".to_string(), json!(base64::encode(private_key)));
    if let Some(public_key) = &config.git.public_key {
        data.insert("id_rsa.pub".to_string(), json!(base64::encode(public_key)));
    }
    if let Some(known_hosts) = &config.git.known_hosts {
        data.insert("known_hosts".to_string(), json!(base64::encode(known_hosts)));
    }
    let secret = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {
            "name": SSH_SECRET_NAME,
            "namespace": namespace,
            "labels": {"app": k8s::APP_LABEL},
        },
        "type": "Opaque",
        "data": data,
    }))
    .map_err(|source| ManifestError {
        kind: "secret",
        name: SSH_SECRET_NAME.to_string(),
        source,
    })?;
    Ok(Some(secret))
}

/// The git identity secret, when both halves of the identity are present.
pub fn git_config_secret(config: &DeploymentConfig, namespace: &str) -> Result<Option<Secret>> {
    let (user, email) = match (&config.git.user, &config.git.email) {
        (Some(user), Some(email)) => (user, email),
        _ => return Ok(None),
    };
    let secret = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {
            "name": GIT_SECRET_NAME,
            "namespace": namespace,
            "labels": {"app": k8s::APP_LABEL},
        },
        "type": "Opaque",
        "stringData": {
            "username": user,
            "email": email,
        },
    }))
    .map_err(|source| ManifestError {
        kind: "secret",
        name: GIT_SECRET_NAME.to_string(),
        source,
    })?;
    Ok(Some(secret))
}

/// Every secret this configuration calls for, in apply order.
pub fn secrets(config: &DeploymentConfig, namespace: &str) -> Result<Vec<Secret>> {
    let mut out = Vec::new();
    if let Some(secret) = ssh_key_secret(config, namespace)? {
        out.push(secret);
    }
    if let Some(secret) = git_config_secret(config, namespace)? {
        out.push(secret);
    }
    Ok(out)
}

/// The single-replica, stable-identity workload hosting the notebook. The
/// pod it produces is `<name>-0`.
pub fn workload(
    config: &DeploymentConfig,
    resources: &NormalizedResources,
    name: &str,
    namespace: &str,
) -> Result<StatefulSet> {
    let mut env = Vec::new();
    if let Some(user) = &config.git.user {
        env.push(json!({"name": "GIT_USER_NAME", "value": user}));
    }
    if let Some(email) = &config.git.email {
        env.push(json!({"name": "GIT_USER_EMAIL", "value": email}));
    }
    if wants_ssh(config) {
        env.push(json!({"name": "SETUP_SSH_KEY", "value": "true"}));
    }
    if !config.environments.is_empty() {
        let blob = serde_json::to_string(&config.environments).map_err(|source| ManifestError {
            kind: "workload",
            name: name.to_string(),
            source,
        })?;
        env.push(json!({"name": "CONDA_ENVIRONMENTS", "value": blob}));
    }

    // The scheduler gets no slack: requests and limits are the same
    // quantities, so the notebook can never be throttled below what the
    // user asked for nor balloon past it.
    let mut requests = serde_json::Map::new();
    requests.insert("cpu".to_string(), json!(resources.cpu));
    requests.insert("memory".to_string(), json!(resources.memory));
    if let Some(gpu) = &resources.gpu {
        requests.insert(gpu.resource_key.clone(), json!(gpu.count.to_string()));
    }

    let mut volume_mounts = Vec::new();
    let mut volumes = Vec::new();
    for (index, volume) in config.hardware.volumes.iter().enumerate() {
        let volume_name = format!("pvc-{}", index);
        volume_mounts.push(json!({
            "name": volume_name,
            "mountPath": names::mount_path(&volume.mount_path),
        }));
        volumes.push(json!({
            "name": volume_name,
            "persistentVolumeClaim": {"claimName": volume.claim},
        }));
    }
    if wants_ssh(config) {
        let mut items = vec![json!({"key": "id_rsa", "path": "id_rsa", "mode": MODE_PRIVATE})];
        if config.git.public_key.is_some() {
            items.push(json!({"key": "id_rsa.pub", "path": "id_rsa.pub", "mode": MODE_SHARED}));
        }
        if config.git.known_hosts.is_some() {
            items.push(json!({"key": "known_hosts", "path": "known_hosts", "mode": MODE_SHARED}));
        }
        volumes.push(json!({
            "name": "ssh-key",
            "secret": {
                "secretName": SSH_SECRET_NAME,
                "defaultMode": MODE_PRIVATE,
                "items": items,
            },
        }));
        volume_mounts.push(json!({
            "name": "ssh-key",
            "mountPath": SSH_MOUNT_PATH,
            "readOnly": true,
        }));
    }

    let instance_labels = labels(name);
    let manifest = json!({
        "apiVersion": "apps/v1",
        "kind": "StatefulSet",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": instance_labels.clone(),
        },
        "spec": {
            "replicas": 1,
            "serviceName": name,
            "selector": {"matchLabels": instance_labels.clone()},
            "template": {
                "metadata": {"labels": instance_labels},
                "spec": {
                    "restartPolicy": "Always",
                    "containers": [{
                        "name": "jupyter",
                        "image": JUPYTER_IMAGE,
                        "imagePullPolicy": "Always",
                        "ports": [{
                            "name": "jupyter",
                            "containerPort": JUPYTER_PORT,
                            "protocol": "TCP",
                        }],
                        "env": env,
                        "resources": {
                            "requests": requests.clone(),
                            "limits": requests,
                        },
                        "volumeMounts": volume_mounts,
                    }],
                    "volumes": volumes,
                },
            },
        },
    });
    serde_json::from_value(manifest).map_err(|source| ManifestError {
        kind: "workload",
        name: name.to_string(),
        source,
    })
    .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::minimal;
    use crate::config::{CondaEnvironment, PvcMount};

    const NAME: &str = "jupyter-kube-0a1b2c3d4e";

    fn build(config: &DeploymentConfig) -> StatefulSet {
        let resources = config.validate().unwrap();
        workload(config, &resources, NAME, "lab").unwrap()
    }

    fn container(workload: &StatefulSet) -> &k8s_openapi::api::core::v1::Container {
        &workload
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
            .containers[0]
    }

    fn env_value(workload: &StatefulSet, key: &str) -> Option<String> {
        container(workload)
            .env
            .as_ref()
            .unwrap()
            .iter()
            .find(|e| e.name == key)
            .and_then(|e| e.value.clone())
    }

    #[test]
    fn builder_is_pure() {
        let config = minimal();
        assert_eq!(build(&config), build(&config));
    }

    #[test]
    fn serialization_round_trip() {
        let built = build(&minimal());
        let value = serde_json::to_value(&built).unwrap();
        let reparsed: StatefulSet = serde_json::from_value(value).unwrap();
        assert_eq!(built, reparsed);
    }

    #[test]
    fn workload_shape() {
        let ws = build(&minimal());
        let spec = ws.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(spec.service_name, NAME);
        let labels = ws.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get("app").unwrap(), "jupyter-kube");
        assert_eq!(labels.get("component").unwrap(), "jupyterlab");
        assert_eq!(labels.get("instance").unwrap(), NAME);
        let c = container(&ws);
        assert_eq!(c.name, "jupyter");
        assert_eq!(c.image.as_deref(), Some(JUPYTER_IMAGE));
        assert_eq!(c.image_pull_policy.as_deref(), Some("Always"));
        let port = &c.ports.as_ref().unwrap()[0];
        assert_eq!(port.container_port, 8888);
        assert_eq!(port.name.as_deref(), Some("jupyter"));
    }

    #[test]
    fn requests_equal_limits() {
        let mut config = minimal();
        config.hardware.gpu = "a40".to_string();
        config.hardware.gpu_count = 1;
        let ws = build(&config);
        let resources = container(&ws).resources.as_ref().unwrap();
        let requests = resources.requests.as_ref().unwrap();
        let limits = resources.limits.as_ref().unwrap();
        assert_eq!(requests, limits);
        assert_eq!(requests.get("cpu").unwrap().0, "2");
        assert_eq!(requests.get("memory").unwrap().0, "4Gi");
        assert_eq!(requests.get("nvidia.com/a40").unwrap().0, "1");
    }

    #[test]
    fn git_env_is_conditional() {
        let ws = build(&minimal());
        assert_eq!(env_value(&ws, "GIT_USER_NAME").as_deref(), Some("Alice"));
        assert_eq!(env_value(&ws, "GIT_USER_EMAIL").as_deref(), Some("a@b.c"));
        assert!(env_value(&ws, "SETUP_SSH_KEY").is_none());
        assert!(env_value(&ws, "CONDA_ENVIRONMENTS").is_none());

        let mut anonymous = minimal();
        anonymous.git.user = None;
        anonymous.git.email = None;
        let ws = build(&anonymous);
        assert!(env_value(&ws, "GIT_USER_NAME").is_none());
        assert!(env_value(&ws, "GIT_USER_EMAIL").is_none());
    }

    #[test]
    fn conda_environments_travel_as_json() {
        let mut config = minimal();
        config.environments = vec![CondaEnvironment {
            name: "torch".to_string(),
            spec: serde_yaml::from_str("channels: [conda-forge]").unwrap(),
        }];
        let ws = build(&config);
        let blob = env_value(&ws, "CONDA_ENVIRONMENTS").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&blob).unwrap();
        assert_eq!(parsed[0]["name"], "torch");
    }

    #[test]
    fn pvc_mounts_are_rewritten_under_main() {
        let mut config = minimal();
        config.hardware.volumes = vec![
            PvcMount {
                claim: "data".to_string(),
                mount_path: "/data".to_string(),
            },
            PvcMount {
                claim: "scratch".to_string(),
                mount_path: "notebooks".to_string(),
            },
        ];
        let ws = build(&config);
        let mounts = container(&ws).volume_mounts.as_ref().unwrap();
        assert_eq!(mounts[0].mount_path, "/home/jovyan/main/data");
        assert_eq!(mounts[1].mount_path, "/home/jovyan/main/notebooks");
        let volumes = ws
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
            .volumes
            .as_ref()
            .unwrap();
        assert_eq!(
            volumes[0]
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .claim_name,
            "data"
        );
    }

    #[test]
    fn ssh_volume_modes() {
        let mut config = minimal();
        config.git.enable_ssh = true;
        config.git.private_key = Some(b"PRIVATE KEY".to_vec());
        config.git.known_hosts = Some(b"github.com ssh-ed25519 AAAA".to_vec());
        let ws = build(&config);
        assert_eq!(env_value(&ws, "SETUP_SSH_KEY").as_deref(), Some("true"));
        let mounts = container(&ws).volume_mounts.as_ref().unwrap();
        let ssh_mount = mounts.iter().find(|m| m.name == "ssh-key").unwrap();
        assert_eq!(ssh_mount.mount_path, "/home/jovyan/.ssh");
        assert_eq!(ssh_mount.read_only, Some(true));
        let volumes = ws
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
            .volumes
            .as_ref()
            .unwrap();
        let secret_volume = volumes
            .iter()
            .find(|v| v.name == "ssh-key")
            .and_then(|v| v.secret.as_ref())
            .unwrap();
        assert_eq!(secret_volume.secret_name.as_deref(), Some(SSH_SECRET_NAME));
        assert_eq!(secret_volume.default_mode, Some(384));
        let items = secret_volume.items.as_ref().unwrap();
        assert_eq!(items[0].key, "id_rsa");
        assert_eq!(items[0].mode, Some(384));
        let hosts = items.iter().find(|i| i.key == "known_hosts").unwrap();
        assert_eq!(hosts.mode, Some(420));
    }

    #[test]
    fn ssh_secret_only_when_enabled_and_present() {
        let config = minimal();
        assert!(ssh_key_secret(&config, "lab").unwrap().is_none());

        let mut enabled_without_key = minimal();
        enabled_without_key.git.enable_ssh = true;
        assert!(ssh_key_secret(&enabled_without_key, "lab").unwrap().is_none());

        let mut complete = minimal();
        complete.git.enable_ssh = true;
        complete.git.private_key = Some(b"PRIVATE KEY".to_vec());
        let secret = ssh_key_secret(&complete, "lab").unwrap().unwrap();
        assert_eq!(secret.metadata.name.as_deref(), Some(SSH_SECRET_NAME));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("lab"));
        assert_eq!(secret.type_.as_deref(), Some("Opaque"));
        let data = secret.data.as_ref().unwrap();
        assert_eq!(data.get("id_rsa").unwrap().0, b"PRIVATE KEY".to_vec());
    }

    #[test]
    fn git_secret_needs_both_halves() {
        let mut config = minimal();
        config.git.email = None;
        assert!(git_config_secret(&config, "lab").unwrap().is_none());

        let complete = minimal();
        let secret = git_config_secret(&complete, "lab").unwrap().unwrap();
        let data = secret.string_data.as_ref().unwrap();
        assert_eq!(data.get("username").unwrap(), "Alice");
        assert_eq!(data.get("email").unwrap(), "a@b.c");
    }
}
