use crate::errors::ApiError;
use async_trait::async_trait;
use error::*;
use k8s_openapi::api::core::v1::Pod;
use kube::api::LogParams;
use kube::Api;
use result::Result;
use std::path::Path;

#[derive(Error, JkError, Fault, Debug)]
#[fault(FaultKind::Internal)]
#[error("could not write the captured log for pod '{pod}' to '{path}'")]
pub struct LogCaptureFailed {
    pod: String,
    path: String,
    #[source]
    source: std::io::Error,
}

/// Diagnostics helper: grab the tail of a pod's log and drop it in a local
/// file. The supervisor does this when a pod fails so the user has something
/// to look at after the workload is torn down.
#[async_trait]
pub trait Logs {
    async fn capture_into<P: AsRef<Path> + Send>(&self, pod: &str, dst: P) -> Result<()>;
}

#[async_trait]
impl Logs for Api<Pod> {
    async fn capture_into<P: AsRef<Path> + Send>(&self, pod: &str, dst: P) -> Result<()> {
        let lp = LogParams {
            tail_lines: Some(500),
            ..Default::default()
        };
        let text = self
            .logs(pod, &lp)
            .await
            .map_err(|err| ApiError::classify("pod log", pod, "", err))?;
        tokio::fs::write(dst.as_ref(), text)
            .await
            .map_err(|source| LogCaptureFailed {
                pod: pod.to_string(),
                path: dst.as_ref().display().to_string(),
                source,
            })?;
        Ok(())
    }
}
