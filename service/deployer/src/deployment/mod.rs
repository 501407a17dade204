//! The lifecycle supervisor: drives one deployment attempt through the
//! state machine from configuration validation to "ready and locally
//! reachable", emitting progress events along the way, and tears everything
//! down on cancellation or failure.

pub mod forward;
pub mod progress;
pub mod watch;

use crate::cancel;
use crate::config::DeploymentConfig;
use crate::manifest;
use crate::reconcile::{Health, ReconcileOutcome, Reconciler};
use error::*;
use forward::{ForwardSession, ForwardTarget, DEFAULT_LOCAL_PORT, DEFAULT_REMOTE_PORT};
use k8s::{Cluster, PodExt, WorkloadPhase};
use log::{debug, error, info, warn};
use progress::{DeployPhase, Reporter};
use result::Result;
use std::sync::Arc;
use std::time::Duration;
use term_colors::*;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use watch::{PodSignal, PodWatcher};

/// Absolute ceiling on the time between entering the pod watch and the pod
/// reporting ready.
const READY_TIMEOUT: Duration = Duration::from_secs(300);

/// Connection validation: attempts and the initial retry delay (doubled per
/// attempt: 1 s, 2 s, 4 s).
const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_RETRY_INITIAL: Duration = Duration::from_secs(1);

#[derive(Error, JkError, Fault, Debug)]
#[fault(FaultKind::ReadyTimeout)]
#[error("pod '{pod}' did not become ready within {timeout_secs} seconds")]
pub struct ReadyTimeoutError {
    pod: String,
    timeout_secs: u64,
}

#[derive(Error, JkError, Fault, Debug)]
#[fault(FaultKind::PodFailed)]
#[error("pod '{pod}' failed: {detail}")]
pub struct PodFailedError {
    pod: String,
    detail: String,
}

#[derive(Error, JkError, Fault, Debug)]
#[fault(FaultKind::PodDeletedExternally)]
#[error("pod '{pod}' was deleted externally; re-run the deployment to recreate it")]
pub struct PodDeletedError {
    pod: String,
}

#[derive(Error, JkError, Fault, Debug)]
#[fault(FaultKind::ConnectTransport)]
#[error("lost the watch over pod '{pod}' and could not re-establish it")]
pub struct WatchLostError {
    pod: String,
}

#[derive(Error, JkError, Fault, Debug)]
#[fault(FaultKind::Internal)]
#[error("workload reports healthy but pod '{pod}' is not ready")]
struct FastPathNotReady {
    pod: String,
}

/// Aborts the pod watch when the owning scope ends, however it ends.
struct WatchGuard {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

/// One deployment attempt. Owns the watch subscription and drives the
/// shared [ForwardSession] for the lifetime of the attempt.
pub(crate) struct Supervisor {
    config: DeploymentConfig,
    reporter: Reporter,
    cancel: CancellationToken,
    forward: Arc<ForwardSession>,
    cluster_slot: Arc<Mutex<Option<Arc<Cluster>>>>,
    workload: String,
    created: bool,
}

impl Supervisor {
    pub(crate) fn new(
        config: DeploymentConfig,
        reporter: Reporter,
        cancel: CancellationToken,
        forward: Arc<ForwardSession>,
        cluster_slot: Arc<Mutex<Option<Arc<Cluster>>>>,
    ) -> Supervisor {
        Supervisor {
            config,
            reporter,
            cancel,
            forward,
            cluster_slot,
            workload: String::new(),
            created: false,
        }
    }

    pub(crate) async fn run(mut self) {
        let err = match self.drive().await {
            Ok(()) => return,
            Err(err) => err,
        };
        if err.fault() == FaultKind::Cancelled {
            info!("deployment attempt cancelled, cleaning up");
            self.cleanup().await;
            self.reporter.cancelled().await;
        } else {
            error!("deployment attempt failed: {}", err);
            let created = self.created;
            self.reporter.error(err).await;
            if created {
                self.cleanup().await;
            }
        }
    }

    async fn drive(&mut self) -> Result<()> {
        self.reporter
            .phase(DeployPhase::Initializing, "Preparing deployment")
            .await;
        let resources = self.config.validate()?;
        let identity = names::workload_identity(&self.config.cluster_config);
        if identity.degraded {
            warn!(
                "could not read the cluster configuration while deriving the workload name; \
{} will not be stable across attempts",
                cyan(identity.name.as_str())
            );
        }
        self.workload = identity.name.clone();

        self.reporter
            .phase(
                DeployPhase::ValidatingConnection,
                "Validating cluster connection",
            )
            .await;
        let cluster = Arc::new(self.connect_with_retries().await?);
        *self.cluster_slot.lock().await = Some(cluster.clone());

        self.reporter
            .phase(
                DeployPhase::CreatingDeployment,
                "Applying secrets and workload",
            )
            .await;
        let secrets = manifest::secrets(&self.config, cluster.namespace())?;
        let workload_manifest =
            manifest::workload(&self.config, &resources, &identity.name, cluster.namespace())?;
        let outcome = {
            let reconciler = Reconciler::new(cluster.as_ref(), &self.cancel);
            reconciler.ensure_secrets(&secrets).await?;
            reconciler.ensure_workload(&workload_manifest).await?
        };
        self.created = matches!(
            outcome,
            ReconcileOutcome::Created | ReconcileOutcome::Replaced
        );

        if outcome == ReconcileOutcome::Reattach(Health::Running) {
            match self.fast_path(&cluster).await {
                Ok(pod_name) => {
                    let (_guard, mut signals) = self.spawn_watch(&cluster, &pod_name);
                    return self.monitor(&pod_name, &mut signals).await;
                }
                Err(err) if err.fault() == FaultKind::Cancelled => return Err(err),
                Err(err) => {
                    warn!(
                        "fast reattach failed ({}), falling back to the full pod watch",
                        err
                    );
                }
            }
        }

        self.reporter
            .phase(
                DeployPhase::WaitingForPod,
                "Waiting for the pod to be scheduled",
            )
            .await;
        let pod_name = watch::resolve_pod_name(cluster.as_ref(), &self.workload).await?;
        let (_guard, mut signals) = self.spawn_watch(&cluster, &pod_name);
        self.observe(&cluster, &pod_name, &mut signals).await?;
        self.access(&cluster, &pod_name).await?;
        self.monitor(&pod_name, &mut signals).await
    }

    /// Load the cluster configuration, build the client, and make one
    /// trivial discovery request, with bounded retries and exponential
    /// backoff. Errors that retrying cannot help surface immediately.
    async fn connect_with_retries(&self) -> Result<Cluster> {
        let mut delay = CONNECT_RETRY_INITIAL;
        let mut last: Option<Box<dyn JkError>> = None;
        for attempt in 1..=CONNECT_ATTEMPTS {
            cancel::checkpoint(&self.cancel)?;
            let err = match Cluster::connect(
                &self.config.cluster_config,
                self.config.namespace.as_deref(),
            )
            .await
            {
                Ok(cluster) => match cluster.ping().await {
                    Ok(version) => {
                        debug!("connected to cluster version {}", version);
                        return Ok(cluster);
                    }
                    Err(err) => err,
                },
                Err(err) => err,
            };
            if matches!(
                err.fault(),
                FaultKind::AuthExecHelperMissing | FaultKind::ConfigInvalid
            ) {
                return Err(err);
            }
            warn!(
                "connection validation attempt {}/{} failed: {}",
                attempt, CONNECT_ATTEMPTS, err
            );
            last = Some(err);
            if attempt < CONNECT_ATTEMPTS {
                cancel::sleep(&self.cancel, delay).await?;
                delay *= 2;
            }
        }
        Err(last.unwrap_or_else(|| {
            StringError::from("connection validation failed without a recorded cause").into()
        }))
    }

    /// The reattach fast path: the workload is already healthy, so skip the
    /// watch and go straight for access. Any failure here falls back to the
    /// full observation path.
    async fn fast_path(&mut self, cluster: &Arc<Cluster>) -> Result<String> {
        let pod_name = watch::resolve_pod_name(cluster.as_ref(), &self.workload).await?;
        let view = match cluster.get_pod(&pod_name).await? {
            Some(pod) => pod.view(),
            None => return Err(FastPathNotReady { pod: pod_name }.into()),
        };
        if !(view.phase == WorkloadPhase::Running && view.ready) {
            return Err(FastPathNotReady { pod: pod_name }.into());
        }
        info!(
            "reattaching to {} pod {}",
            green("ready"),
            cyan(pod_name.as_str())
        );
        self.access(cluster, &pod_name).await?;
        Ok(pod_name)
    }

    fn spawn_watch(
        &self,
        cluster: &Arc<Cluster>,
        pod_name: &str,
    ) -> (WatchGuard, mpsc::Receiver<PodSignal>) {
        let (tx, rx) = mpsc::channel(32);
        let token = self.cancel.child_token();
        let task = PodWatcher::spawn(cluster.pods(), pod_name.to_string(), tx, token.clone());
        (
            WatchGuard {
                cancel: token,
                task,
            },
            rx,
        )
    }

    /// Consume watch signals until the pod is running and ready, the
    /// readiness ceiling is hit, or something terminal happens to the pod.
    async fn observe(
        &mut self,
        cluster: &Arc<Cluster>,
        pod_name: &str,
        signals: &mut mpsc::Receiver<PodSignal>,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + READY_TIMEOUT;
        loop {
            let signal = tokio::select! {
                _ = self.cancel.cancelled() => return Err(cancel::Cancelled {}.into()),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(ReadyTimeoutError {
                        pod: pod_name.to_string(),
                        timeout_secs: READY_TIMEOUT.as_secs(),
                    }
                    .into());
                }
                signal = signals.recv() => signal,
            };
            match signal {
                None | Some(PodSignal::Lost) => {
                    return Err(WatchLostError {
                        pod: pod_name.to_string(),
                    }
                    .into());
                }
                Some(PodSignal::Deleted) => {
                    let _ = self.forward.stop().await;
                    return Err(PodDeletedError {
                        pod: pod_name.to_string(),
                    }
                    .into());
                }
                Some(PodSignal::Update(view)) => match view.phase {
                    WorkloadPhase::Failed => {
                        self.capture_failure_log(cluster, pod_name).await;
                        return Err(PodFailedError {
                            pod: pod_name.to_string(),
                            detail: view
                                .message
                                .unwrap_or_else(|| "no detail reported".to_string()),
                        }
                        .into());
                    }
                    WorkloadPhase::Running if view.ready => {
                        self.reporter
                            .pod(
                                DeployPhase::WaitingForReady,
                                format!("Pod {} is ready", pod_name),
                                pod_name,
                                view.phase,
                            )
                            .await;
                        return Ok(());
                    }
                    WorkloadPhase::Running => {
                        self.reporter
                            .pod(
                                DeployPhase::WaitingForReady,
                                format!(
                                    "Pod {} is running, waiting for containers to become ready",
                                    pod_name
                                ),
                                pod_name,
                                view.phase,
                            )
                            .await;
                    }
                    phase => {
                        self.reporter
                            .pod(
                                DeployPhase::WaitingForPod,
                                format!("Pod {} is {}", pod_name, phase.wire_name()),
                                pod_name,
                                phase,
                            )
                            .await;
                    }
                },
            }
        }
    }

    /// Start the local tunnel and report `ready`. A tunnel that cannot be
    /// established is reported but does not fail the attempt.
    async fn access(&mut self, cluster: &Arc<Cluster>, pod_name: &str) -> Result<()> {
        self.reporter
            .phase(DeployPhase::SettingUpAccess, "Binding the local notebook port")
            .await;
        let target = ForwardTarget {
            pod: pod_name.to_string(),
            local_port: DEFAULT_LOCAL_PORT,
            remote_port: DEFAULT_REMOTE_PORT,
        };
        match self.forward.start(cluster.pods(), target).await {
            Ok(outcome) => {
                let url = outcome.url().to_string();
                self.reporter
                    .ready(
                        "JupyterLab is ready",
                        Some(pod_name.to_string()),
                        Some(url),
                    )
                    .await;
                Ok(())
            }
            Err(err) if !err.fault().is_fatal() => {
                warn!("{}; continuing without a managed tunnel", err);
                self.reporter
                    .ready(
                        format!(
                            "JupyterLab is running, but the local tunnel could not be \
established ({}); forward port 8888 manually",
                            err
                        ),
                        Some(pod_name.to_string()),
                        None,
                    )
                    .await;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// After `ready`: keep consuming watch signals so an externally deleted
    /// or failing pod stops the tunnel promptly. Ends only through
    /// cancellation or a terminal pod event.
    async fn monitor(
        &mut self,
        pod_name: &str,
        signals: &mut mpsc::Receiver<PodSignal>,
    ) -> Result<()> {
        loop {
            let signal = tokio::select! {
                _ = self.cancel.cancelled() => return Err(cancel::Cancelled {}.into()),
                signal = signals.recv() => signal,
            };
            match signal {
                Some(PodSignal::Update(view)) if view.phase == WorkloadPhase::Failed => {
                    let _ = self.forward.stop().await;
                    return Err(PodFailedError {
                        pod: pod_name.to_string(),
                        detail: view
                            .message
                            .unwrap_or_else(|| "no detail reported".to_string()),
                    }
                    .into());
                }
                Some(PodSignal::Update(_)) => {}
                Some(PodSignal::Deleted) => {
                    let _ = self.forward.stop().await;
                    return Err(PodDeletedError {
                        pod: pod_name.to_string(),
                    }
                    .into());
                }
                Some(PodSignal::Lost) | None => {
                    // The session is already serving; losing the watch at
                    // this point is not worth killing the notebook over.
                    warn!(
                        "lost the watch over pod {} after it became ready; the tunnel stays up",
                        cyan(pod_name)
                    );
                    self.cancel.cancelled().await;
                    return Err(cancel::Cancelled {}.into());
                }
            }
        }
    }

    async fn capture_failure_log(&self, cluster: &Arc<Cluster>, pod_name: &str) {
        use k8s::logs::Logs;

        let path = std::env::temp_dir().join(format!("{}.log", pod_name));
        match cluster.pods().capture_into(pod_name, &path).await {
            Ok(()) => info!("captured the failing pod's log to {}", path.display()),
            Err(err) => debug!("could not capture the failing pod's log: {}", err),
        }
    }

    async fn cleanup(&mut self) {
        if let Err(err) = self.forward.stop().await {
            debug!("stopping the tunnel during cleanup failed: {}", err);
        }
        let cluster = { self.cluster_slot.lock().await.clone() };
        let cluster = match cluster {
            Some(cluster) => cluster,
            None => return,
        };
        if self.workload.is_empty() {
            return;
        }
        teardown(cluster.as_ref(), &self.workload).await;
    }
}

/// Deletes everything one workload owns: the workload itself (NotFound is
/// fine), the two secrets, and any conda-environment configmaps labeled for
/// the instance. Per-object failures are logged and skipped.
pub(crate) async fn teardown(cluster: &Cluster, workload: &str) {
    match cluster.delete_workload(workload).await {
        Ok(_) => info!("deleted workload {}", cyan(workload)),
        Err(err) => warn!("could not delete workload {}: {}", cyan(workload), err),
    }
    for secret in [manifest::SSH_SECRET_NAME, manifest::GIT_SECRET_NAME].iter() {
        if let Err(err) = cluster.delete_secret(secret).await {
            warn!("could not delete secret {}: {}", cyan(*secret), err);
        }
    }
    match cluster
        .delete_config_maps_labeled(&k8s::conda_environment_selector(workload))
        .await
    {
        Ok(0) => {}
        Ok(count) => info!("deleted {} conda environment configmap(s)", count),
        Err(err) => warn!("could not clean up conda environment configmaps: {}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn watch_guard_aborts_its_task_on_drop() {
        let token = CancellationToken::new();
        let watched = token.clone();
        let task = tokio::spawn(async move {
            watched.cancelled().await;
        });
        let guard = WatchGuard {
            cancel: token.clone(),
            task,
        };
        assert!(!token.is_cancelled());
        drop(guard);
        assert!(token.is_cancelled());
    }
}
