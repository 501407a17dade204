//! A thin terminal harness around the deployment core: reads a YAML
//! deployment file, runs the attempt, and prints the progress stream.
//! Ctrl-C cancels the attempt and waits for the confirmation event.

use deployer::config::{CondaEnvironment, GitIdentity, Hardware, PvcMount};
use deployer::{DeployPhase, DeploymentConfig, DeploymentManager, ProgressEvent};
use error::*;
use log::info;
use result::Result;
use serde::Deserialize;
use std::path::PathBuf;
use tokio::sync::mpsc;

#[derive(Deserialize)]
struct HarnessFile {
    cluster_config: PathBuf,
    namespace: Option<String>,
    cpu: String,
    memory: String,
    #[serde(default = "default_gpu")]
    gpu: String,
    #[serde(default)]
    gpu_count: u32,
    #[serde(default)]
    volumes: Vec<HarnessVolume>,
    git_user: Option<String>,
    git_email: Option<String>,
    #[serde(default)]
    enable_ssh: bool,
    ssh_private_key: Option<PathBuf>,
    ssh_public_key: Option<PathBuf>,
    known_hosts: Option<PathBuf>,
    #[serde(default)]
    environments: Vec<HarnessEnvironment>,
}

fn default_gpu() -> String {
    "none".to_string()
}

#[derive(Deserialize)]
struct HarnessVolume {
    claim: String,
    mount_path: String,
}

#[derive(Deserialize)]
struct HarnessEnvironment {
    name: String,
    spec: serde_yaml::Value,
}

#[derive(Error, JkError, Fault, Debug)]
#[fault(FaultKind::ConfigInvalid)]
#[error("usage: jupyter-kube <deployment.yaml>")]
struct Usage {}

#[derive(Error, JkError, Fault, Debug)]
#[fault(FaultKind::ConfigInvalid)]
#[error("could not read '{path}'")]
struct Unreadable {
    path: String,
    #[source]
    source: std::io::Error,
}

#[derive(Error, JkError, Fault, Debug)]
#[fault(FaultKind::ConfigInvalid)]
#[error("could not parse '{path}'")]
struct Unparseable {
    path: String,
    #[source]
    source: serde_yaml::Error,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    if let Err(err) = run().await {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let path = std::env::args().nth(1).ok_or(Usage {})?;
    let text = std::fs::read_to_string(&path).map_err(|source| Unreadable {
        path: path.clone(),
        source,
    })?;
    let harness: HarnessFile = serde_yaml::from_str(&text).map_err(|source| Unparseable {
        path: path.clone(),
        source,
    })?;
    let config = build_config(harness)?;

    let (tx, mut rx) = mpsc::channel(64);
    let manager = DeploymentManager::new(tx);
    manager.deploy(config).await?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, cancelling the deployment");
                manager.cancel().await;
            }
            event = rx.recv() => match event {
                None => break,
                Some(event) => {
                    render(&event);
                    if matches!(event.phase, DeployPhase::Error | DeployPhase::Cancelled) {
                        break;
                    }
                }
            }
        }
    }
    Ok(())
}

fn render(event: &ProgressEvent) {
    println!(
        "[{:>3}%] {:<22} {}",
        event.progress,
        event.phase.wire_name(),
        event.message
    );
    if let Some(url) = &event.jupyter_url {
        println!("       open {}", url);
    }
}

fn build_config(harness: HarnessFile) -> Result<DeploymentConfig> {
    let read_bytes = |path: &Option<PathBuf>| -> Result<Option<Vec<u8>>> {
        match path {
            None => Ok(None),
            Some(path) => std::fs::read(path).map(Some).map_err(|source| {
                Unreadable {
                    path: path.display().to_string(),
                    source,
                }
                .into()
            }),
        }
    };
    let git = GitIdentity {
        user: harness.git_user,
        email: harness.git_email,
        private_key: read_bytes(&harness.ssh_private_key)?,
        public_key: read_bytes(&harness.ssh_public_key)?,
        known_hosts: read_bytes(&harness.known_hosts)?,
        enable_ssh: harness.enable_ssh,
    };
    Ok(DeploymentConfig {
        cluster_config: harness.cluster_config,
        namespace: harness.namespace,
        hardware: Hardware {
            cpu: harness.cpu,
            memory: harness.memory,
            gpu: harness.gpu,
            gpu_count: harness.gpu_count,
            volumes: harness
                .volumes
                .into_iter()
                .map(|volume| PvcMount {
                    claim: volume.claim,
                    mount_path: volume.mount_path,
                })
                .collect(),
        },
        git,
        environments: harness
            .environments
            .into_iter()
            .map(|environment| CondaEnvironment {
                name: environment.name,
                spec: environment.spec,
            })
            .collect(),
    })
}
