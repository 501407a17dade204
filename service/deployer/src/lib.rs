//! The deployment orchestration core: reconciles a declarative user
//! configuration into a per-user JupyterLab workload on a Kubernetes
//! cluster, drives it to "ready and locally reachable", and keeps a
//! supervised port-forward alive. Progress streams out over a channel to
//! whatever presentation layer embeds this crate.

pub mod cancel;
pub mod config;
pub mod deployment;
pub mod manifest;
pub mod reconcile;

pub use config::{
    CondaEnvironment, DeploymentConfig, GitIdentity, GpuRequest, Hardware, NormalizedResources,
    PvcMount,
};
pub use deployment::forward::{
    ForwardSession, ForwardState, ForwardStatus, ForwardTarget, StartOutcome, DEFAULT_LOCAL_PORT,
    DEFAULT_REMOTE_PORT,
};
pub use deployment::progress::{DeployPhase, ProgressEvent};
pub use reconcile::{Health, ReconcileOutcome};

use deployment::progress::Reporter;
use deployment::Supervisor;
use error::*;
use k8s::{Cluster, PodExt, WorkloadPhase};
use result::Result;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Error, JkError, Fault, Debug)]
#[fault(FaultKind::Conflict)]
#[error("a deployment attempt is already in flight; cancel it or wait for it to finish")]
pub struct AttemptInFlight {}

#[derive(Error, JkError, Fault, Debug)]
#[fault(FaultKind::Internal)]
#[error("no cluster connection is available yet; deploy (or detect namespaces) first")]
pub struct NotConnected {}

/// The reply shape of the direct port-forward operations.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardReply {
    pub ok: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ForwardReply {
    fn failure(message: impl Into<String>) -> ForwardReply {
        ForwardReply {
            ok: false,
            message: message.into(),
            url: None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceDetection {
    pub default_namespace: Option<String>,
    pub available_namespaces: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceCheck {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct Attempt {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// The coordinator the host owns: at most one deployment attempt in flight,
/// at most one port-forward session, one (rebuilt-on-demand) cluster
/// connection. Everything the presentation layer calls goes through here.
pub struct DeploymentManager {
    events: mpsc::Sender<ProgressEvent>,
    forward: Arc<ForwardSession>,
    cluster: Arc<Mutex<Option<Arc<Cluster>>>>,
    attempt: Mutex<Option<Attempt>>,
}

impl DeploymentManager {
    pub fn new(events: mpsc::Sender<ProgressEvent>) -> DeploymentManager {
        DeploymentManager {
            events,
            forward: Arc::new(ForwardSession::new()),
            cluster: Arc::new(Mutex::new(None)),
            attempt: Mutex::new(None),
        }
    }

    /// Fire-and-forget: validation, reconciliation, and supervision run in a
    /// background task, reporting through the event channel. A second call
    /// while an attempt is in flight is rejected without side effects.
    pub async fn deploy(&self, config: DeploymentConfig) -> Result<()> {
        let mut slot = self.attempt.lock().await;
        if let Some(attempt) = slot.as_ref() {
            if !attempt.task.is_finished() {
                return Err(AttemptInFlight {}.into());
            }
        }
        let cancel = CancellationToken::new();
        let supervisor = Supervisor::new(
            config,
            Reporter::new(self.events.clone()),
            cancel.clone(),
            self.forward.clone(),
            self.cluster.clone(),
        );
        let task = tokio::spawn(supervisor.run());
        *slot = Some(Attempt { cancel, task });
        Ok(())
    }

    /// Cancels the in-flight attempt, if any. Idempotent; the attempt
    /// confirms with a terminal `cancelled` event once cleanup is done.
    pub async fn cancel(&self) {
        let slot = self.attempt.lock().await;
        if let Some(attempt) = slot.as_ref() {
            attempt.cancel.cancel();
        }
    }

    /// Stops forwarding and deletes the named workload together with its
    /// secrets and labeled conda-environment configmaps.
    pub async fn cleanup(&self, workload: &str) -> Result<()> {
        let _ = self.forward.stop().await;
        let cluster = self.cluster.lock().await.clone();
        let cluster = cluster.ok_or(NotConnected {})?;
        deployment::teardown(cluster.as_ref(), workload).await;
        Ok(())
    }

    async fn connect(
        &self,
        cluster_config: &Path,
        namespace: Option<&str>,
    ) -> Result<Arc<Cluster>> {
        let cluster = Arc::new(Cluster::connect(cluster_config, namespace).await?);
        *self.cluster.lock().await = Some(cluster.clone());
        Ok(cluster)
    }

    pub async fn list_available_namespaces(&self, cluster_config: &Path) -> Result<Vec<String>> {
        self.connect(cluster_config, None)
            .await?
            .list_namespaces()
            .await
    }

    pub async fn detect_default_namespace(
        &self,
        cluster_config: &Path,
    ) -> Result<NamespaceDetection> {
        let cluster = self.connect(cluster_config, None).await?;
        let available_namespaces = cluster.list_namespaces().await?;
        let default_namespace = Some(cluster.namespace().to_string())
            .filter(|ns| available_namespaces.iter().any(|a| a == ns));
        Ok(NamespaceDetection {
            default_namespace,
            available_namespaces,
        })
    }

    pub async fn validate_namespace(
        &self,
        cluster_config: &Path,
        namespace: &str,
    ) -> NamespaceCheck {
        let outcome = async {
            let cluster = self.connect(cluster_config, Some(namespace)).await?;
            cluster.namespace_exists(namespace).await
        }
        .await;
        match outcome {
            Ok(exists) => NamespaceCheck {
                exists,
                error: None,
            },
            Err(err) => NamespaceCheck {
                exists: false,
                error: Some(format!("{}", err)),
            },
        }
    }

    pub async fn start_port_forward(
        &self,
        pod: &str,
        local_port: u16,
        remote_port: u16,
    ) -> ForwardReply {
        let cluster = match self.cluster.lock().await.clone() {
            Some(cluster) => cluster,
            None => return ForwardReply::failure(format!("{}", NotConnected {})),
        };
        let target = ForwardTarget {
            pod: pod.to_string(),
            local_port,
            remote_port,
        };
        match self.forward.start(cluster.pods(), target).await {
            Ok(outcome) => {
                let message = match &outcome {
                    StartOutcome::Started(_) => "port forward established",
                    StartOutcome::AlreadyServing(_) => {
                        "an existing local listener is already serving the port"
                    }
                };
                ForwardReply {
                    ok: true,
                    message: message.to_string(),
                    url: Some(outcome.url().to_string()),
                }
            }
            Err(err) => ForwardReply::failure(format!("{}", err)),
        }
    }

    pub async fn stop_port_forward(&self) -> ForwardReply {
        match self.forward.stop().await {
            Ok(()) => ForwardReply {
                ok: true,
                message: "port forward stopped".to_string(),
                url: None,
            },
            Err(err) => ForwardReply::failure(format!("{}", err)),
        }
    }

    pub async fn port_forward_status(&self) -> ForwardStatus {
        self.forward.status().await
    }

    /// Fast reconnect: skip secrets and reconciliation entirely. Read the
    /// pod; if it is running and ready, start the tunnel and hand back the
    /// URL.
    pub async fn fast_reconnect_to_pod(&self, pod: &str) -> ForwardReply {
        let cluster = match self.cluster.lock().await.clone() {
            Some(cluster) => cluster,
            None => return ForwardReply::failure(format!("{}", NotConnected {})),
        };
        match cluster.get_pod(pod).await {
            Ok(Some(found)) => {
                let view = found.view();
                if !(view.phase == WorkloadPhase::Running && view.ready) {
                    return ForwardReply::failure(format!(
                        "pod '{}' is not ready (phase {})",
                        pod,
                        view.phase.wire_name()
                    ));
                }
            }
            Ok(None) => return ForwardReply::failure(format!("pod '{}' was not found", pod)),
            Err(err) => return ForwardReply::failure(format!("{}", err)),
        }
        self.start_port_forward(pod, DEFAULT_LOCAL_PORT, DEFAULT_REMOTE_PORT)
            .await
    }
}
