pub mod client;
pub mod errors;
pub mod logs;
pub mod ops;
pub mod pod;
pub mod watcher;

pub use client::Cluster;
pub use errors::ApiError;
pub use pod::{PodExt, PodView, WorkloadPhase};

/// Label value identifying every object this tool owns.
pub const APP_LABEL: &str = "jupyter-kube";

/// Label value carried by the workload and its pods on top of [APP_LABEL].
pub const COMPONENT_LABEL: &str = "jupyterlab";

/// Selector matching the pods that belong to one workload instance.
pub fn instance_selector(workload: &str) -> String {
    format!(
        "app={},component={},instance={}",
        APP_LABEL, COMPONENT_LABEL, workload
    )
}

/// Selector matching the conda-environment configmaps attached to one
/// workload instance.
pub fn conda_environment_selector(workload: &str) -> String {
    format!("instance={},type=conda-environment", workload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors() {
        assert_eq!(
            instance_selector("jupyter-kube-0a1b2c3d4e"),
            "app=jupyter-kube,component=jupyterlab,instance=jupyter-kube-0a1b2c3d4e"
        );
        assert_eq!(
            conda_environment_selector("jupyter-kube-0a1b2c3d4e"),
            "instance=jupyter-kube-0a1b2c3d4e,type=conda-environment"
        );
    }
}
