use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::StreamExt;
use futures_util::TryStreamExt;
use k8s::watcher;
use k8s::{PodExt, PodView};
use k8s_openapi::api::core::v1::Pod;
use kube::error::ErrorResponse;
use kube::Api;
use log::{debug, error, trace, warn};
use std::time::Duration;
use term_colors::*;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long to wait after a premature stream close before the watch is
/// re-established.
const REWATCH_DELAY: Duration = Duration::from_secs(1);

/// What the watch daemon tells the supervisor.
#[derive(Debug)]
pub enum PodSignal {
    /// The pod changed; here is its projected status.
    Update(PodView),
    /// The pod is gone. Terminal for the attempt.
    Deleted,
    /// The watch could not be kept alive. The supervisor decides whether
    /// that is fatal.
    Lost,
}

/// A PodWatcher is a daemon holding a field-selected watch over one pod,
/// projecting raw events into [PodSignal]s on a channel. It survives
/// transient stream failures with exponential backoff and recovers a
/// prematurely closed stream through a direct read followed by a re-watch.
pub struct PodWatcher {}

impl PodWatcher {
    pub fn spawn(
        api: Api<Pod>,
        pod_name: String,
        signals: mpsc::Sender<PodSignal>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(Self::run(api, pod_name, signals, cancel))
    }

    async fn run(
        api: Api<Pod>,
        pod_name: String,
        signals: mpsc::Sender<PodSignal>,
        cancel: CancellationToken,
    ) {
        let mut backoff = ExponentialBackoff::default();
        'establish: loop {
            if cancel.is_cancelled() {
                return;
            }
            let mut stream = watcher::pod_watch(api.clone(), &pod_name).boxed();
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = stream.try_next() => next,
                };
                let event = match next {
                    Err(err) => match backoff.next_backoff() {
                        Some(delay) => {
                            warn!(
                                "watch over pod {} failed ({}), retrying in {:?}",
                                cyan(pod_name.as_str()),
                                err,
                                delay
                            );
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                _ = tokio::time::sleep(delay) => {}
                            }
                            continue;
                        }
                        None => {
                            error!(
                                "the watch over pod {} kept failing, giving up",
                                cyan(pod_name.as_str())
                            );
                            let _ = signals.send(PodSignal::Lost).await;
                            return;
                        }
                    },
                    Ok(event) => event,
                };
                let event = match event {
                    None => {
                        // The server closed the stream. Take a direct look at
                        // the pod, hand whatever we saw to the supervisor,
                        // then re-establish the watch.
                        debug!(
                            "watch stream over pod {} closed, reading directly",
                            cyan(pod_name.as_str())
                        );
                        match api.get(&pod_name).await {
                            Ok(pod) => {
                                if signals.send(PodSignal::Update(pod.view())).await.is_err() {
                                    return;
                                }
                            }
                            Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => {
                                let _ = signals.send(PodSignal::Deleted).await;
                                return;
                            }
                            Err(err) => warn!(
                                "direct read of pod {} failed: {}",
                                cyan(pod_name.as_str()),
                                err
                            ),
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(REWATCH_DELAY) => {}
                        }
                        continue 'establish;
                    }
                    Some(event) => event,
                };
                backoff.reset();
                match event {
                    watcher::Event::Applied(pod) => {
                        trace!("pod {} changed", cyan(pod_name.as_str()));
                        if signals.send(PodSignal::Update(pod.view())).await.is_err() {
                            return;
                        }
                    }
                    watcher::Event::Restarted(pods) => {
                        // The initial listing (and any relist) arrives as a
                        // restart; project our pod out of it if present.
                        for pod in pods {
                            if pod.metadata.name.as_deref() == Some(pod_name.as_str()) {
                                if signals.send(PodSignal::Update(pod.view())).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    watcher::Event::Deleted(_) => {
                        debug!("pod {} was deleted", cyan(pod_name.as_str()));
                        let _ = signals.send(PodSignal::Deleted).await;
                        return;
                    }
                }
            }
        }
    }
}

/// Picks the pod backing a workload: label-selected lookup first, ordinal
/// name as the fallback when no pod has shown up yet.
pub async fn resolve_pod_name(cluster: &k8s::Cluster, workload: &str) -> result::Result<String> {
    let pods = cluster.pods_for_instance(workload).await?;
    if let Some(name) = pods.first().and_then(|pod| pod.metadata.name.clone()) {
        return Ok(name);
    }
    Ok(names::pod_name(workload))
}
