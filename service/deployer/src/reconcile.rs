//! Idempotent "ensure the workload exists and is healthy" routine.
//!
//! The cluster is driven to a state where exactly one workload with the
//! derived name exists and is either healthy or progressing. Calling this
//! again with the same inputs and an unchanged cluster performs no writes
//! (secrets excepted: a content change is overwritten in place).

use crate::cancel;
use async_trait::async_trait;
use error::*;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use log::{debug, info, warn};
use result::Result;
use std::time::Duration;
use term_colors::*;
use tokio_util::sync::CancellationToken;

/// How long a terminating workload gets to finish deleting before we call
/// it stuck.
const TERMINATING_DRAIN: Duration = Duration::from_secs(3);

/// How long a deleted-for-replacement workload gets to drain before the
/// replacement is created.
const REPLACE_DRAIN: Duration = Duration::from_secs(5);

/// Upper bound on read-classify-act rounds before we stop chasing a cluster
/// that keeps changing underneath us.
const MAX_CONVERGE_ROUNDS: u32 = 5;

/// How healthy an existing workload we reattached to is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// Ready and available; the fast path applies.
    Running,
    /// Present and scaled up but not ready yet; fall through to the watch.
    Starting,
}

/// What `ensure_workload` did to the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Created,
    Reattach(Health),
    /// An unusable workload was deleted and a fresh one created.
    Replaced,
}

#[derive(Error, JkError, Fault, Debug)]
#[fault(FaultKind::StuckTerminating)]
#[error(
    "workload '{name}' has been terminating for longer than expected and is blocking the \
deployment; wait for it to finish deleting (or remove its finalizers) and try again"
)]
pub struct StuckTerminating {
    name: String,
}

#[derive(Error, JkError, Fault, Debug)]
#[fault(FaultKind::Internal)]
#[error("gave up driving workload '{name}' to a usable state after {rounds} rounds")]
pub struct ReconcileDiverged {
    name: String,
    rounds: u32,
}

/// The writes and reads the reconciler needs, as a seam. The production
/// implementation is [k8s::Cluster]; tests substitute a recording mock.
#[async_trait]
pub trait WorkloadStore: Send + Sync {
    async fn get_workload(&self, name: &str) -> Result<Option<StatefulSet>>;
    async fn create_workload(&self, manifest: &StatefulSet) -> Result<()>;
    async fn delete_workload(&self, name: &str) -> Result<()>;
    async fn create_secret(&self, manifest: &Secret) -> Result<()>;
    async fn replace_secret(&self, manifest: &Secret) -> Result<()>;
}

#[async_trait]
impl WorkloadStore for k8s::Cluster {
    async fn get_workload(&self, name: &str) -> Result<Option<StatefulSet>> {
        k8s::Cluster::get_workload(self, name).await
    }

    async fn create_workload(&self, manifest: &StatefulSet) -> Result<()> {
        k8s::Cluster::create_workload(self, manifest).await.map(|_| ())
    }

    async fn delete_workload(&self, name: &str) -> Result<()> {
        k8s::Cluster::delete_workload(self, name).await.map(|_| ())
    }

    async fn create_secret(&self, manifest: &Secret) -> Result<()> {
        k8s::Cluster::create_secret(self, manifest).await.map(|_| ())
    }

    async fn replace_secret(&self, manifest: &Secret) -> Result<()> {
        k8s::Cluster::replace_secret(self, manifest).await.map(|_| ())
    }
}

/// How an existing workload reads, from
/// `(replicas, readyReplicas, availableReplicas, deletionTimestamp)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Condition {
    Terminating,
    Healthy,
    Starting,
    Unusable,
}

fn classify(workload: &StatefulSet) -> Condition {
    if workload.metadata.deletion_timestamp.is_some() {
        return Condition::Terminating;
    }
    let replicas = workload
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(0);
    let (ready, available) = workload
        .status
        .as_ref()
        .map(|status| {
            (
                status.ready_replicas.unwrap_or(0),
                status.available_replicas.unwrap_or(0),
            )
        })
        .unwrap_or((0, 0));
    if ready > 0 && available > 0 {
        Condition::Healthy
    } else if replicas > 0 && ready == 0 {
        Condition::Starting
    } else {
        Condition::Unusable
    }
}

pub struct Reconciler<'a, S: WorkloadStore> {
    store: &'a S,
    cancel: &'a CancellationToken,
}

impl<'a, S: WorkloadStore> Reconciler<'a, S> {
    pub fn new(store: &'a S, cancel: &'a CancellationToken) -> Self {
        Reconciler { store, cancel }
    }

    /// Applies each secret with the idempotent create-then-replace pattern:
    /// a conflict means the secret already exists, in which case its content
    /// is overwritten in place.
    pub async fn ensure_secrets(&self, secrets: &[Secret]) -> Result<()> {
        for secret in secrets {
            cancel::checkpoint(self.cancel)?;
            let name = secret.name_any();
            match self.store.create_secret(secret).await {
                Ok(()) => info!("created secret {}", cyan(name.as_str())),
                Err(err) if err.fault() == FaultKind::Conflict => {
                    debug!("secret {} exists, replacing", cyan(name.as_str()));
                    self.store.replace_secret(secret).await?;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Drives the cluster until the named workload exists and is healthy or
    /// progressing. Safe to call repeatedly with the same inputs.
    pub async fn ensure_workload(&self, manifest: &StatefulSet) -> Result<ReconcileOutcome> {
        let name = manifest.name_any();
        let mut replaced = false;
        for _round in 0..MAX_CONVERGE_ROUNDS {
            cancel::checkpoint(self.cancel)?;
            let existing = match self.store.get_workload(&name).await? {
                Some(workload) => workload,
                None => {
                    match self.store.create_workload(manifest).await {
                        Ok(()) => {
                            info!("created workload {}", cyan(name.as_str()));
                            return Ok(if replaced {
                                ReconcileOutcome::Replaced
                            } else {
                                ReconcileOutcome::Created
                            });
                        }
                        Err(err) if err.fault() == FaultKind::Conflict => {
                            // Lost a create race; re-read and classify
                            // whatever won.
                            debug!("workload {} appeared while creating", cyan(name.as_str()));
                            continue;
                        }
                        Err(err) => return Err(err),
                    }
                }
            };
            match classify(&existing) {
                Condition::Healthy => {
                    info!(
                        "reattaching to {} workload {}",
                        green("healthy"),
                        cyan(name.as_str())
                    );
                    return Ok(ReconcileOutcome::Reattach(Health::Running));
                }
                Condition::Starting => {
                    info!(
                        "reattaching to {} workload {}",
                        yellow("starting"),
                        cyan(name.as_str())
                    );
                    return Ok(ReconcileOutcome::Reattach(Health::Starting));
                }
                Condition::Terminating => {
                    debug!(
                        "workload {} is terminating, giving it {:?} to drain",
                        cyan(name.as_str()),
                        TERMINATING_DRAIN
                    );
                    cancel::sleep(self.cancel, TERMINATING_DRAIN).await?;
                    if self.store.get_workload(&name).await?.is_some() {
                        return Err(StuckTerminating { name }.into());
                    }
                    // Gone now; the next round creates.
                }
                Condition::Unusable => {
                    warn!(
                        "workload {} is {}, replacing it",
                        cyan(name.as_str()),
                        red("unusable")
                    );
                    self.store.delete_workload(&name).await?;
                    cancel::sleep(self.cancel, REPLACE_DRAIN).await?;
                    replaced = true;
                }
            }
        }
        Err(ReconcileDiverged {
            name,
            rounds: MAX_CONVERGE_ROUNDS,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Writes {
        workload_creates: u32,
        workload_deletes: u32,
        secret_creates: u32,
        secret_replaces: u32,
    }

    #[derive(Default)]
    struct MockStore {
        workload: Mutex<Option<StatefulSet>>,
        existing_secrets: Mutex<HashMap<String, Secret>>,
        writes: Mutex<Writes>,
        /// When set, the workload never actually goes away on delete and
        /// never clears its deletion timestamp.
        immortal: bool,
    }

    fn workload_json(status: serde_json::Value, deleting: bool) -> StatefulSet {
        let mut value = serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "StatefulSet",
            "metadata": {"name": "jupyter-kube-0a1b2c3d4e"},
            "spec": {
                "replicas": 1,
                "serviceName": "jupyter-kube-0a1b2c3d4e",
                "selector": {"matchLabels": {"app": "jupyter-kube"}},
                "template": {"metadata": {"labels": {"app": "jupyter-kube"}}}
            },
            "status": status,
        });
        if deleting {
            value["metadata"]["deletionTimestamp"] = serde_json::json!("2026-01-01T00:00:00Z");
        }
        serde_json::from_value(value).unwrap()
    }

    fn manifest() -> StatefulSet {
        workload_json(serde_json::json!({"replicas": 0}), false)
    }

    fn secret(name: &str) -> Secret {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": name},
            "stringData": {"k": "v"},
        }))
        .unwrap()
    }

    #[derive(Error, JkError, Fault, Debug)]
    #[fault(FaultKind::Conflict)]
    #[error("already exists")]
    struct MockConflict {}

    #[async_trait]
    impl WorkloadStore for MockStore {
        async fn get_workload(&self, _name: &str) -> Result<Option<StatefulSet>> {
            Ok(self.workload.lock().unwrap().clone())
        }

        async fn create_workload(&self, manifest: &StatefulSet) -> Result<()> {
            self.writes.lock().unwrap().workload_creates += 1;
            let mut slot = self.workload.lock().unwrap();
            if slot.is_some() {
                return Err(MockConflict {}.into());
            }
            *slot = Some(manifest.clone());
            Ok(())
        }

        async fn delete_workload(&self, _name: &str) -> Result<()> {
            self.writes.lock().unwrap().workload_deletes += 1;
            if !self.immortal {
                *self.workload.lock().unwrap() = None;
            }
            Ok(())
        }

        async fn create_secret(&self, manifest: &Secret) -> Result<()> {
            self.writes.lock().unwrap().secret_creates += 1;
            let name = manifest.name_any();
            let mut secrets = self.existing_secrets.lock().unwrap();
            if secrets.contains_key(&name) {
                return Err(MockConflict {}.into());
            }
            secrets.insert(name, manifest.clone());
            Ok(())
        }

        async fn replace_secret(&self, manifest: &Secret) -> Result<()> {
            self.writes.lock().unwrap().secret_replaces += 1;
            self.existing_secrets
                .lock()
                .unwrap()
                .insert(manifest.name_any(), manifest.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn fresh_cluster_creates() {
        let store = MockStore::default();
        let cancel = CancellationToken::new();
        let outcome = Reconciler::new(&store, &cancel)
            .ensure_workload(&manifest())
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Created);
        assert_eq!(store.writes.lock().unwrap().workload_creates, 1);
    }

    #[tokio::test]
    async fn second_ensure_performs_no_writes() {
        let store = MockStore::default();
        let cancel = CancellationToken::new();
        let reconciler = Reconciler::new(&store, &cancel);
        reconciler.ensure_workload(&manifest()).await.unwrap();
        // The created workload has replicas=1 but no ready replicas yet, so
        // the second call reattaches to it as "starting" without writing.
        *store.workload.lock().unwrap() = Some(workload_json(
            serde_json::json!({"replicas": 1}),
            false,
        ));
        let outcome = reconciler.ensure_workload(&manifest()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Reattach(Health::Starting));
        let writes = store.writes.lock().unwrap();
        assert_eq!(writes.workload_creates, 1);
        assert_eq!(writes.workload_deletes, 0);
    }

    #[tokio::test]
    async fn healthy_workload_is_reattached() {
        let store = MockStore::default();
        *store.workload.lock().unwrap() = Some(workload_json(
            serde_json::json!({"replicas": 1, "readyReplicas": 1, "availableReplicas": 1}),
            false,
        ));
        let cancel = CancellationToken::new();
        let outcome = Reconciler::new(&store, &cancel)
            .ensure_workload(&manifest())
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Reattach(Health::Running));
        let writes = store.writes.lock().unwrap();
        assert_eq!(writes.workload_creates, 0);
        assert_eq!(writes.workload_deletes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_terminating_surfaces_without_creating() {
        let store = MockStore {
            immortal: true,
            ..MockStore::default()
        };
        *store.workload.lock().unwrap() = Some(workload_json(
            serde_json::json!({"replicas": 1, "readyReplicas": 1, "availableReplicas": 1}),
            true,
        ));
        let cancel = CancellationToken::new();
        let err = Reconciler::new(&store, &cancel)
            .ensure_workload(&manifest())
            .await
            .unwrap_err();
        assert_eq!(err.fault(), FaultKind::StuckTerminating);
        assert_eq!(store.writes.lock().unwrap().workload_creates, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unusable_workload_is_replaced() {
        let store = MockStore::default();
        // Scaled to zero: present but neither healthy nor starting.
        *store.workload.lock().unwrap() = Some(workload_json(
            serde_json::json!({"replicas": 0}),
            false,
        ));
        // Force spec.replicas to zero as well so it classifies as unusable.
        if let Some(workload) = store.workload.lock().unwrap().as_mut() {
            workload.spec.as_mut().unwrap().replicas = Some(0);
        }
        let cancel = CancellationToken::new();
        let outcome = Reconciler::new(&store, &cancel)
            .ensure_workload(&manifest())
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Replaced);
        let writes = store.writes.lock().unwrap();
        assert_eq!(writes.workload_deletes, 1);
        assert_eq!(writes.workload_creates, 1);
    }

    #[tokio::test]
    async fn secrets_create_then_replace_on_conflict() {
        let store = MockStore::default();
        let cancel = CancellationToken::new();
        let reconciler = Reconciler::new(&store, &cancel);
        let secrets = vec![secret("jupyter-ssh-key"), secret("jupyter-git-config")];
        reconciler.ensure_secrets(&secrets).await.unwrap();
        {
            let writes = store.writes.lock().unwrap();
            assert_eq!(writes.secret_creates, 2);
            assert_eq!(writes.secret_replaces, 0);
        }
        // Second pass hits the conflict path and overwrites in place.
        reconciler.ensure_secrets(&secrets).await.unwrap();
        let writes = store.writes.lock().unwrap();
        assert_eq!(writes.secret_creates, 4);
        assert_eq!(writes.secret_replaces, 2);
    }

    #[tokio::test]
    async fn cancelled_token_stops_reconciliation() {
        let store = MockStore::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = Reconciler::new(&store, &cancel)
            .ensure_workload(&manifest())
            .await
            .unwrap_err();
        assert_eq!(err.fault(), FaultKind::Cancelled);
        assert_eq!(store.writes.lock().unwrap().workload_creates, 0);
    }

    #[test]
    fn classification_table() {
        let healthy = workload_json(
            serde_json::json!({"replicas": 1, "readyReplicas": 1, "availableReplicas": 1}),
            false,
        );
        assert_eq!(classify(&healthy), Condition::Healthy);

        let starting = workload_json(serde_json::json!({"replicas": 1}), false);
        assert_eq!(classify(&starting), Condition::Starting);

        let deleting = workload_json(
            serde_json::json!({"replicas": 1, "readyReplicas": 1, "availableReplicas": 1}),
            true,
        );
        assert_eq!(classify(&deleting), Condition::Terminating);

        let mut scaled_down = workload_json(serde_json::json!({"replicas": 0}), false);
        scaled_down.spec.as_mut().unwrap().replicas = Some(0);
        assert_eq!(classify(&scaled_down), Condition::Unusable);
    }
}
