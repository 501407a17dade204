//! Thin wrapper over the list-watch machinery. Consumers get one stream type
//! and one helper for the only watch shape this tool uses: a field-selected
//! watch over a single pod by name.

pub use kube_runtime::watcher::{watcher, Error, Event};

use futures::Stream;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::Api;

pub fn pod_watch(
    api: Api<Pod>,
    pod_name: &str,
) -> impl Stream<Item = std::result::Result<Event<Pod>, Error>> {
    watcher(
        api,
        ListParams::default().fields(&format!("metadata.name={}", pod_name)),
    )
}
