//! The supervised local tunnel: a TCP listener on the loopback interface
//! whose accepted connections are tunneled through the cluster API to the
//! notebook pod's port. One session per coordinator; the session survives
//! dropped streams through a capped-backoff restart loop that re-verifies
//! the pod before every reconnect.

use error::*;
use k8s::{PodExt, WorkloadPhase};
use k8s_openapi::api::core::v1::Pod;
use kube::error::ErrorResponse;
use kube::Api;
use log::{debug, error, info, trace, warn};
use result::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use term_colors::*;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_LOCAL_PORT: u16 = 8888;
pub const DEFAULT_REMOTE_PORT: u16 = 8888;

const RESTART_INITIAL: Duration = Duration::from_secs(1);
const RESTART_CAP: Duration = Duration::from_secs(30);
const STOP_PATIENCE: Duration = Duration::from_secs(2);
const PROBE_PATIENCE: Duration = Duration::from_millis(500);

/// The (pod, local port, remote port) triple one session serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardTarget {
    pub pod: String,
    pub local_port: u16,
    pub remote_port: u16,
}

impl ForwardTarget {
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.local_port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardState {
    Stopped,
    Starting,
    Running,
    Error,
}

impl ForwardState {
    pub fn wire_name(&self) -> &'static str {
        match self {
            ForwardState::Stopped => "stopped",
            ForwardState::Starting => "starting",
            ForwardState::Running => "running",
            ForwardState::Error => "error",
        }
    }
}

impl Serialize for ForwardState {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.wire_name())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardStatus {
    pub status: ForwardState,
    pub is_active: bool,
    pub restart_count: u32,
    pub auto_restart: bool,
    pub restart_in_progress: bool,
    pub starting: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<ForwardTarget>,
}

#[derive(Error, JkError, Fault, Debug)]
pub enum ForwardError {
    #[fault(FaultKind::PortForwardStart)]
    #[error(
        "local port {port} is taken by something that is not serving; free the port or pick \
another one"
    )]
    PortTaken { port: u16 },
    #[fault(FaultKind::PortForwardStart)]
    #[error("could not bind the local listener on 127.0.0.1:{port}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[fault(FaultKind::PortForwardStart)]
    #[error("could not open the tunnel to pod '{pod}' port {port}")]
    Tunnel {
        pod: String,
        port: u16,
        #[source]
        source: StringError,
    },
    #[fault(FaultKind::PortForwardStart)]
    #[error("a tunnel to pod '{pod}' is already running; stop it before changing pods or ports")]
    Busy { pod: String },
}

/// How a successful start happened.
#[derive(Debug)]
pub enum StartOutcome {
    /// A fresh session owns the local port.
    Started(String),
    /// Something already listens on the requested port and answers; no new
    /// session was created.
    AlreadyServing(String),
}

impl StartOutcome {
    pub fn url(&self) -> &str {
        match self {
            StartOutcome::Started(url) | StartOutcome::AlreadyServing(url) => url,
        }
    }
}

struct Inner {
    state: ForwardState,
    target: Option<ForwardTarget>,
    restart_count: u32,
    auto_restart: bool,
    restart_in_progress: bool,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl Default for Inner {
    fn default() -> Inner {
        Inner {
            state: ForwardState::Stopped,
            target: None,
            restart_count: 0,
            auto_restart: false,
            restart_in_progress: false,
            cancel: None,
            task: None,
        }
    }
}

/// The one port-forward session a coordinator owns.
#[derive(Default)]
pub struct ForwardSession {
    inner: Arc<Mutex<Inner>>,
}

impl ForwardSession {
    pub fn new() -> ForwardSession {
        ForwardSession::default()
    }

    /// Starts forwarding. Idempotent for an identical target while active;
    /// a different target is refused until [stop](ForwardSession::stop).
    pub async fn start(&self, api: Api<Pod>, target: ForwardTarget) -> Result<StartOutcome> {
        {
            let mut inner = self.inner.lock().await;
            match inner.state {
                ForwardState::Running | ForwardState::Starting => {
                    return match &inner.target {
                        Some(active) if *active == target => {
                            debug!("tunnel already serves {}, nothing to do", target.url());
                            Ok(StartOutcome::Started(target.url()))
                        }
                        Some(active) => Err(ForwardError::Busy {
                            pod: active.pod.clone(),
                        }
                        .into()),
                        None => Err(ForwardError::Busy {
                            pod: target.pod.clone(),
                        }
                        .into()),
                    };
                }
                ForwardState::Stopped | ForwardState::Error => {}
            }
            inner.state = ForwardState::Starting;
            inner.target = Some(target.clone());
            inner.restart_count = 0;
            inner.auto_restart = true;
            inner.restart_in_progress = false;
            if let Some(cancel) = inner.cancel.take() {
                cancel.cancel();
            }
            if let Some(task) = inner.task.take() {
                task.abort();
            }
        }

        let listener = match TcpListener::bind(("127.0.0.1", target.local_port)).await {
            Ok(listener) => listener,
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                self.clear().await;
                return if probe_responsive(target.local_port).await {
                    info!(
                        "local port {} is already serving and responsive, leaving it alone",
                        target.local_port
                    );
                    Ok(StartOutcome::AlreadyServing(target.url()))
                } else {
                    Err(ForwardError::PortTaken {
                        port: target.local_port,
                    }
                    .into())
                };
            }
            Err(source) => {
                self.clear().await;
                return Err(ForwardError::Bind {
                    port: target.local_port,
                    source,
                }
                .into());
            }
        };

        // Prove the tunnel can be established before advertising the port.
        if let Err(err) = probe_tunnel(&api, &target).await {
            self.clear().await;
            return Err(err);
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(session_loop(
            api,
            target.clone(),
            listener,
            cancel.clone(),
            self.inner.clone(),
        ));
        {
            let mut inner = self.inner.lock().await;
            inner.state = ForwardState::Running;
            inner.cancel = Some(cancel);
            inner.task = Some(task);
        }
        info!(
            "forwarding {} to pod {} port {}",
            green(target.url().as_str()),
            cyan(target.pod.as_str()),
            target.remote_port
        );
        Ok(StartOutcome::Started(target.url()))
    }

    /// Bounded synchronous stop. Safe to call at any time, any number of
    /// times.
    pub async fn stop(&self) -> Result<()> {
        let (cancel, task) = {
            let mut inner = self.inner.lock().await;
            inner.auto_restart = false;
            (inner.cancel.take(), inner.task.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(mut task) = task {
            if tokio::time::timeout(STOP_PATIENCE, &mut task).await.is_err() {
                warn!("the forward task did not wind down in time, aborting it");
                task.abort();
            }
        }
        let mut inner = self.inner.lock().await;
        inner.state = ForwardState::Stopped;
        inner.target = None;
        inner.restart_in_progress = false;
        Ok(())
    }

    pub async fn status(&self) -> ForwardStatus {
        let inner = self.inner.lock().await;
        ForwardStatus {
            status: inner.state,
            is_active: matches!(inner.state, ForwardState::Running | ForwardState::Starting),
            restart_count: inner.restart_count,
            auto_restart: inner.auto_restart,
            restart_in_progress: inner.restart_in_progress,
            starting: inner.state == ForwardState::Starting,
            config: inner.target.clone(),
        }
    }

    async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = ForwardState::Stopped;
        inner.target = None;
    }
}

async fn probe_responsive(port: u16) -> bool {
    matches!(
        tokio::time::timeout(PROBE_PATIENCE, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

/// Establishes a tunnel and immediately drops it. Used to verify the pod
/// accepts forwards before a session is advertised and before each
/// reconnect.
async fn probe_tunnel(api: &Api<Pod>, target: &ForwardTarget) -> Result<()> {
    let mut forwarder = api
        .portforward(&target.pod, &[target.remote_port])
        .await
        .map_err(|err| ForwardError::Tunnel {
            pod: target.pod.clone(),
            port: target.remote_port,
            source: format!("{}", err).into(),
        })?;
    match forwarder.take_stream(target.remote_port) {
        Some(stream) => {
            drop(stream);
            Ok(())
        }
        None => Err(ForwardError::Tunnel {
            pod: target.pod.clone(),
            port: target.remote_port,
            source: "the cluster returned no stream for the requested port".into(),
        }
        .into()),
    }
}

async fn session_loop(
    api: Api<Pod>,
    target: ForwardTarget,
    listener: TcpListener,
    cancel: CancellationToken,
    inner: Arc<Mutex<Inner>>,
) {
    let (failure_tx, mut failure_rx) = mpsc::channel::<()>(8);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("forward loop for pod {} stopped", cyan(target.pod.as_str()));
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((inbound, peer)) => {
                    trace!("accepted local connection from {}", peer);
                    tokio::spawn(serve_connection(
                        api.clone(),
                        target.clone(),
                        inbound,
                        cancel.child_token(),
                        failure_tx.clone(),
                    ));
                }
                Err(err) => {
                    warn!("local accept failed: {}", err);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                    }
                }
            },
            Some(()) = failure_rx.recv() => {
                let auto_restart = { inner.lock().await.auto_restart };
                if !auto_restart {
                    continue;
                }
                if !recover(&api, &target, &cancel, &inner).await {
                    return;
                }
                // One outage produces one recovery, not one per broken
                // connection.
                while failure_rx.try_recv().is_ok() {}
            }
        }
    }
}

/// One accepted local connection: open a dedicated tunnel and pump bytes
/// both ways until either side closes or the session is cancelled. A tunnel
/// that cannot be established (or dies mid-copy) reports a failure so the
/// session can enter its restart loop.
async fn serve_connection(
    api: Api<Pod>,
    target: ForwardTarget,
    mut inbound: TcpStream,
    cancel: CancellationToken,
    failures: mpsc::Sender<()>,
) {
    let mut forwarder = match api.portforward(&target.pod, &[target.remote_port]).await {
        Ok(forwarder) => forwarder,
        Err(err) => {
            debug!(
                "could not open a tunnel to pod {}: {}",
                cyan(target.pod.as_str()),
                err
            );
            let _ = failures.try_send(());
            return;
        }
    };
    let mut upstream = match forwarder.take_stream(target.remote_port) {
        Some(stream) => stream,
        None => {
            let _ = failures.try_send(());
            return;
        }
    };
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = tokio::io::copy_bidirectional(&mut inbound, &mut upstream) => {
            match result {
                Ok(_) => trace!("local connection to pod {} closed", cyan(target.pod.as_str())),
                Err(err) => {
                    debug!(
                        "tunnel stream to pod {} ended unexpectedly: {}",
                        cyan(target.pod.as_str()),
                        err
                    );
                    let _ = failures.try_send(());
                }
            }
        }
    }
}

/// The restart loop: capped exponential backoff, unlimited attempts until
/// stopped. Every attempt re-verifies the pod with a direct read first and
/// gives up for good when the pod has failed or is gone.
async fn recover(
    api: &Api<Pod>,
    target: &ForwardTarget,
    cancel: &CancellationToken,
    inner: &Arc<Mutex<Inner>>,
) -> bool {
    {
        let mut locked = inner.lock().await;
        locked.state = ForwardState::Error;
        locked.restart_in_progress = true;
    }
    warn!(
        "the tunnel to pod {} dropped, reconnecting",
        cyan(target.pod.as_str())
    );
    let mut delay = RESTART_INITIAL;
    loop {
        {
            let mut locked = inner.lock().await;
            if !locked.auto_restart {
                locked.restart_in_progress = false;
                return false;
            }
            locked.state = ForwardState::Starting;
            locked.restart_count += 1;
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                inner.lock().await.restart_in_progress = false;
                return false;
            }
            _ = tokio::time::sleep(delay) => {}
        }
        match api.get(&target.pod).await {
            Ok(pod) => {
                if pod.view().phase == WorkloadPhase::Failed {
                    error!(
                        "pod {} has failed, ending the tunnel for good",
                        cyan(target.pod.as_str())
                    );
                    give_up(inner).await;
                    return false;
                }
                if !pod.all_containers_ready() {
                    debug!("pod {} is not ready yet", cyan(target.pod.as_str()));
                    delay = next_delay(delay);
                    continue;
                }
            }
            Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => {
                error!(
                    "pod {} is gone, ending the tunnel for good",
                    cyan(target.pod.as_str())
                );
                give_up(inner).await;
                return false;
            }
            Err(err) => {
                warn!(
                    "could not re-verify pod {}: {}",
                    cyan(target.pod.as_str()),
                    err
                );
                delay = next_delay(delay);
                continue;
            }
        }
        match probe_tunnel(api, target).await {
            Ok(()) => {
                let mut locked = inner.lock().await;
                locked.state = ForwardState::Running;
                locked.restart_in_progress = false;
                info!(
                    "tunnel to pod {} re-established",
                    cyan(target.pod.as_str())
                );
                return true;
            }
            Err(err) => {
                debug!("reconnect attempt failed: {}", err);
                delay = next_delay(delay);
            }
        }
    }
}

async fn give_up(inner: &Arc<Mutex<Inner>>) {
    let mut locked = inner.lock().await;
    locked.state = ForwardState::Error;
    locked.auto_restart = false;
    locked.restart_in_progress = false;
}

fn next_delay(delay: Duration) -> Duration {
    RESTART_CAP.min(delay * 2)
}
