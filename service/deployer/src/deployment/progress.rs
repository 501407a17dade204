use error::JkError;
use k8s::WorkloadPhase;
use log::debug;
use serde::Serialize;
use tokio::sync::mpsc;

/// The deployment state machine's externally visible phases, in order.
/// Forward-only, except that `error` and `cancelled` can be entered from
/// anywhere, and a failed fast-path reattach legitimately drops back to
/// `waiting-for-pod` (the percentage still never decreases).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployPhase {
    Initializing,
    ValidatingConnection,
    CreatingDeployment,
    WaitingForPod,
    WaitingForReady,
    SettingUpAccess,
    Ready,
    Error,
    Cancelled,
}

impl DeployPhase {
    pub fn wire_name(&self) -> &'static str {
        match self {
            DeployPhase::Initializing => "initializing",
            DeployPhase::ValidatingConnection => "validating-connection",
            DeployPhase::CreatingDeployment => "creating-deployment",
            DeployPhase::WaitingForPod => "waiting-for-pod",
            DeployPhase::WaitingForReady => "waiting-for-ready",
            DeployPhase::SettingUpAccess => "setting-up-access",
            DeployPhase::Ready => "ready",
            DeployPhase::Error => "error",
            DeployPhase::Cancelled => "cancelled",
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            DeployPhase::Initializing => 0,
            DeployPhase::ValidatingConnection => 1,
            DeployPhase::CreatingDeployment => 2,
            DeployPhase::WaitingForPod => 3,
            DeployPhase::WaitingForReady => 4,
            DeployPhase::SettingUpAccess => 5,
            DeployPhase::Ready => 6,
            DeployPhase::Error => 7,
            DeployPhase::Cancelled => 8,
        }
    }

    /// The floor percentage a phase entry raises the progress bar to.
    /// Terminal failure phases carry whatever was reached.
    fn percent(&self) -> Option<u8> {
        match self {
            DeployPhase::Initializing => Some(5),
            DeployPhase::ValidatingConnection => Some(15),
            DeployPhase::CreatingDeployment => Some(30),
            DeployPhase::WaitingForPod => Some(45),
            DeployPhase::WaitingForReady => Some(65),
            DeployPhase::SettingUpAccess => Some(85),
            DeployPhase::Ready => Some(100),
            DeployPhase::Error | DeployPhase::Cancelled => None,
        }
    }
}

impl Serialize for DeployPhase {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.wire_name())
    }
}

/// One element of the outbound event stream.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub phase: DeployPhase,
    pub progress: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_status: Option<WorkloadPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jupyter_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Box<dyn JkError>>,
}

/// Emits progress events in order, keeps the percentage monotone within the
/// attempt, and suppresses events whose `(phase, percent, message)` triple is
/// identical to the previous one so receivers are not spammed by repeated
/// watch updates.
pub struct Reporter {
    tx: mpsc::Sender<ProgressEvent>,
    floor: u8,
    last: Option<(DeployPhase, u8, String)>,
}

impl Reporter {
    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Reporter {
        Reporter {
            tx,
            floor: 0,
            last: None,
        }
    }

    pub async fn phase(&mut self, phase: DeployPhase, message: impl Into<String>) {
        self.emit(phase, message.into(), None, None, None, None).await;
    }

    pub async fn pod(
        &mut self,
        phase: DeployPhase,
        message: impl Into<String>,
        pod_name: impl Into<String>,
        pod_status: WorkloadPhase,
    ) {
        self.emit(
            phase,
            message.into(),
            Some(pod_name.into()),
            Some(pod_status),
            None,
            None,
        )
        .await;
    }

    pub async fn ready(
        &mut self,
        message: impl Into<String>,
        pod_name: Option<String>,
        jupyter_url: Option<String>,
    ) {
        self.emit(DeployPhase::Ready, message.into(), pod_name, None, jupyter_url, None)
            .await;
    }

    pub async fn error(&mut self, err: Box<dyn JkError>) {
        let message = format!("{}", err);
        self.emit(DeployPhase::Error, message, None, None, None, Some(err))
            .await;
    }

    pub async fn cancelled(&mut self) {
        self.emit(
            DeployPhase::Cancelled,
            "Deployment cancelled".to_string(),
            None,
            None,
            None,
            None,
        )
        .await;
    }

    async fn emit(
        &mut self,
        phase: DeployPhase,
        message: String,
        pod_name: Option<String>,
        pod_status: Option<WorkloadPhase>,
        jupyter_url: Option<String>,
        error: Option<Box<dyn JkError>>,
    ) {
        let progress = match phase.percent() {
            Some(percent) => self.floor.max(percent),
            None => self.floor,
        };
        self.floor = progress;
        let triple = (phase, progress, message);
        if self.last.as_ref() == Some(&triple) {
            return;
        }
        let (phase, progress, message) = triple;
        self.last = Some((phase, progress, message.clone()));
        let event = ProgressEvent {
            phase,
            progress,
            message,
            pod_name,
            pod_status,
            jupyter_url,
            error,
        };
        if self.tx.send(event).await.is_err() {
            debug!("progress receiver went away, dropping event");
        }
    }
}
