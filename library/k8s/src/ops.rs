use crate::client::Cluster;
use crate::errors::ApiError;
use either::Either;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::error::ErrorResponse;
use kube::ResourceExt;
use log::warn;
use result::Result;
use term_colors::*;

/// Typed operations over the objects this tool owns. Reads normalize a 404
/// into `None`, deletes normalize a 404 into "already gone", and every other
/// failure comes back classified (see [ApiError](crate::errors::ApiError)) so
/// the reconciler can branch on fault kinds alone.
impl Cluster {
    pub async fn get_workload(&self, name: &str) -> Result<Option<StatefulSet>> {
        match self.workloads().get(name).await {
            Ok(workload) => Ok(Some(workload)),
            Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => Ok(None),
            Err(err) => Err(ApiError::classify("workload", name, self.namespace(), err).into()),
        }
    }

    pub async fn create_workload(&self, manifest: &StatefulSet) -> Result<StatefulSet> {
        let name = manifest.name_any();
        Ok(self
            .workloads()
            .create(&PostParams::default(), manifest)
            .await
            .map_err(|err| ApiError::classify("workload", &name, self.namespace(), err))?)
    }

    /// Left means the deletion has started and the object is draining; Right
    /// means the object is already gone (including "was never there").
    pub async fn delete_workload(&self, name: &str) -> Result<Either<StatefulSet, ()>> {
        match self.workloads().delete(name, &DeleteParams::default()).await {
            Ok(Either::Left(workload)) => Ok(Either::Left(workload)),
            Ok(Either::Right(_)) => Ok(Either::Right(())),
            Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => Ok(Either::Right(())),
            Err(err) => Err(ApiError::classify("workload", name, self.namespace(), err).into()),
        }
    }

    pub async fn create_secret(&self, manifest: &Secret) -> Result<Secret> {
        let name = manifest.name_any();
        Ok(self
            .secrets()
            .create(&PostParams::default(), manifest)
            .await
            .map_err(|err| ApiError::classify("secret", &name, self.namespace(), err))?)
    }

    /// Unconditional overwrite. The live object's resourceVersion is copied
    /// onto the manifest first so the API server treats this as an update of
    /// what is there rather than a conflict.
    pub async fn replace_secret(&self, manifest: &Secret) -> Result<Secret> {
        let name = manifest.name_any();
        let api = self.secrets();
        let mut desired = manifest.clone();
        if let Ok(existing) = api.get(&name).await {
            desired.metadata.resource_version = existing.metadata.resource_version.clone();
        }
        Ok(api
            .replace(&name, &PostParams::default(), &desired)
            .await
            .map_err(|err| ApiError::classify("secret", &name, self.namespace(), err))?)
    }

    pub async fn delete_secret(&self, name: &str) -> Result<Either<Secret, ()>> {
        match self.secrets().delete(name, &DeleteParams::default()).await {
            Ok(Either::Left(secret)) => Ok(Either::Left(secret)),
            Ok(Either::Right(_)) => Ok(Either::Right(())),
            Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => Ok(Either::Right(())),
            Err(err) => Err(ApiError::classify("secret", name, self.namespace(), err).into()),
        }
    }

    pub async fn list_namespaces(&self) -> Result<Vec<String>> {
        let list = self
            .namespaces()
            .list(&ListParams::default())
            .await
            .map_err(|err| ApiError::classify("namespace", "*", "", err))?;
        Ok(list.into_iter().map(|ns| ns.name_any()).collect())
    }

    pub async fn namespace_exists(&self, namespace: &str) -> Result<bool> {
        match self.namespaces().get(namespace).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => Ok(false),
            Err(err) => Err(ApiError::classify("namespace", namespace, "", err).into()),
        }
    }

    /// The pods belonging to one workload instance, resolved by label
    /// selector rather than by name so a controller change cannot strand us.
    pub async fn pods_for_instance(&self, workload: &str) -> Result<Vec<Pod>> {
        let selector = crate::instance_selector(workload);
        let list = self
            .pods()
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|err| ApiError::classify("pod", workload, self.namespace(), err))?;
        Ok(list.items)
    }

    pub async fn get_pod(&self, name: &str) -> Result<Option<Pod>> {
        match self.pods().get(name).await {
            Ok(pod) => Ok(Some(pod)),
            Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => Ok(None),
            Err(err) => Err(ApiError::classify("pod", name, self.namespace(), err).into()),
        }
    }

    /// Best-effort deletion of every configmap matching the selector.
    /// Per-object failures are logged and skipped; the count of deletions
    /// actually issued is returned.
    pub async fn delete_config_maps_labeled(&self, selector: &str) -> Result<usize> {
        let api = self.config_maps();
        let list = api
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|err| ApiError::classify("configmap", selector, self.namespace(), err))?;
        let mut deleted = 0;
        for cm in list {
            let name = cm.name_any();
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => deleted += 1,
                Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => {}
                Err(err) => warn!(
                    "leaving configmap {} behind, delete failed: {}",
                    cyan(name.as_str()),
                    err
                ),
            }
        }
        Ok(deleted)
    }
}
