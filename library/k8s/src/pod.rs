use k8s_openapi::api::core::v1::Pod;
use serde::Serialize;

/// The cluster-reported lifecycle phase of a pod. `Ready` is deliberately
/// not a phase: it is an orthogonal boolean over the container statuses and
/// lives on [PodView].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl WorkloadPhase {
    pub fn parse(phase: Option<&str>) -> WorkloadPhase {
        match phase {
            Some("Pending") => WorkloadPhase::Pending,
            Some("Running") => WorkloadPhase::Running,
            Some("Succeeded") => WorkloadPhase::Succeeded,
            Some("Failed") => WorkloadPhase::Failed,
            _ => WorkloadPhase::Unknown,
        }
    }

    pub fn wire_name(&self) -> &'static str {
        match self {
            WorkloadPhase::Pending => "Pending",
            WorkloadPhase::Running => "Running",
            WorkloadPhase::Succeeded => "Succeeded",
            WorkloadPhase::Failed => "Failed",
            WorkloadPhase::Unknown => "Unknown",
        }
    }
}

impl Serialize for WorkloadPhase {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.wire_name())
    }
}

/// A pod's status projected into the one shape the rest of the core consumes.
/// Whatever the API server hands back (missing status, missing container
/// statuses, partially populated conditions), downstream code only ever sees
/// this.
#[derive(Debug, Clone, Serialize)]
pub struct PodView {
    pub name: String,
    pub phase: WorkloadPhase,
    /// True only when every container reports ready. A pod with no container
    /// statuses yet is not ready.
    pub ready: bool,
    pub restart_count: i32,
    pub ip: Option<String>,
    pub start_time: Option<String>,
    pub conditions: Vec<String>,
    /// The first terminated container's message (falling back to its
    /// reason). What the supervisor reports when the pod fails.
    pub message: Option<String>,
}

/// PodExt is an extension over the raw API object used to answer the
/// questions the supervisor actually asks.
pub trait PodExt {
    fn view(&self) -> PodView;
    fn all_containers_ready(&self) -> bool;
    fn terminated_message(&self) -> Option<String>;
}

impl PodExt for Pod {
    fn view(&self) -> PodView {
        let status = self.status.as_ref();
        let phase = WorkloadPhase::parse(status.and_then(|s| s.phase.as_deref()));
        let restart_count = status
            .and_then(|s| s.container_statuses.as_ref())
            .map(|statuses| statuses.iter().map(|s| s.restart_count).sum())
            .unwrap_or(0);
        let ip = status.and_then(|s| s.pod_ip.clone());
        let start_time = status
            .and_then(|s| s.start_time.as_ref())
            .map(|t| t.0.to_rfc3339());
        let conditions = status
            .and_then(|s| s.conditions.as_ref())
            .map(|conditions| {
                conditions
                    .iter()
                    .map(|c| format!("{}={}", c.type_, c.status))
                    .collect()
            })
            .unwrap_or_default();
        PodView {
            name: self
                .metadata
                .name
                .clone()
                .unwrap_or_default(),
            phase,
            ready: self.all_containers_ready(),
            restart_count,
            ip,
            start_time,
            conditions,
            message: self.terminated_message(),
        }
    }

    fn all_containers_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref())
            .map(|statuses| !statuses.is_empty() && statuses.iter().all(|s| s.ready))
            .unwrap_or(false)
    }

    fn terminated_message(&self) -> Option<String> {
        let statuses = self
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref())?;
        for status in statuses {
            if let Some(terminated) = status.state.as_ref().and_then(|s| s.terminated.as_ref()) {
                return terminated
                    .message
                    .clone()
                    .or_else(|| terminated.reason.clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(value: serde_json::Value) -> Pod {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn running_and_ready() {
        let p = pod(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "jupyter-kube-0a1b2c3d4e-0"},
            "status": {
                "phase": "Running",
                "podIP": "10.1.2.3",
                "conditions": [{"type": "Ready", "status": "True"}],
                "containerStatuses": [
                    {"name": "jupyter", "ready": true, "restartCount": 2,
                     "image": "img", "imageID": "id"}
                ]
            }
        }));
        let view = p.view();
        assert_eq!(view.phase, WorkloadPhase::Running);
        assert!(view.ready);
        assert_eq!(view.restart_count, 2);
        assert_eq!(view.ip.as_deref(), Some("10.1.2.3"));
        assert_eq!(view.conditions, vec!["Ready=True".to_string()]);
        assert_eq!(view.name, "jupyter-kube-0a1b2c3d4e-0");
    }

    #[test]
    fn no_container_statuses_means_not_ready() {
        let p = pod(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "p"},
            "status": {"phase": "Pending"}
        }));
        let view = p.view();
        assert_eq!(view.phase, WorkloadPhase::Pending);
        assert!(!view.ready);
        assert_eq!(view.restart_count, 0);
    }

    #[test]
    fn one_unready_container_poisons_readiness() {
        let p = pod(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "p"},
            "status": {
                "phase": "Running",
                "containerStatuses": [
                    {"name": "a", "ready": true, "restartCount": 0, "image": "i", "imageID": "d"},
                    {"name": "b", "ready": false, "restartCount": 1, "image": "i", "imageID": "d"}
                ]
            }
        }));
        assert!(!p.view().ready);
        assert_eq!(p.view().restart_count, 1);
    }

    #[test]
    fn terminated_message_prefers_message_over_reason() {
        let p = pod(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "p"},
            "status": {
                "phase": "Failed",
                "containerStatuses": [
                    {"name": "jupyter", "ready": false, "restartCount": 0,
                     "image": "i", "imageID": "d",
                     "state": {"terminated": {"exitCode": 137, "reason": "OOMKilled",
                               "message": "out of memory"}}}
                ]
            }
        }));
        let view = p.view();
        assert_eq!(view.phase, WorkloadPhase::Failed);
        assert_eq!(view.message.as_deref(), Some("out of memory"));
    }

    #[test]
    fn unknown_phase_parses_as_unknown() {
        assert_eq!(WorkloadPhase::parse(None), WorkloadPhase::Unknown);
        assert_eq!(WorkloadPhase::parse(Some("Weird")), WorkloadPhase::Unknown);
    }
}
