//! Thin custom-resource client.
//!
//! Operator kinds are resolved from group/version/kind/plural at runtime,
//! so adding an operator version is a data change in the resource factory,
//! not a new typed client.

use crate::operator::OperatorResource;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::core::GroupVersionKind;
use serde_json::Value;
use sweep_core::{Error, Result};
use tracing::debug;

/// Namespaced API handle for one custom-resource kind.
#[derive(Clone)]
pub struct CrdClient {
    api: Api<DynamicObject>,
}

impl CrdClient {
    #[must_use]
    pub fn new(client: kube::Client, namespace: &str, resource: &OperatorResource) -> Self {
        let gvk = GroupVersionKind::gvk(&resource.group, &resource.version, &resource.kind);
        let api_resource = ApiResource::from_gvk_with_plural(&gvk, &resource.plural);
        Self { api: Api::namespaced_with(client, namespace, &api_resource) }
    }

    /// Creates one custom resource. Single-shot: a failure propagates to
    /// the caller instead of being retried.
    pub async fn create(&self, manifest: &Value) -> Result<()> {
        let object: DynamicObject = serde_json::from_value(manifest.clone())?;
        let name = object.metadata.name.clone().unwrap_or_default();
        self.api.create(&PostParams::default(), &object).await.map_err(Error::cluster)?;
        debug!(job_name = %name, "custom resource created");
        Ok(())
    }

    /// Lists custom resources matching a label selector.
    pub async fn list(&self, label_selector: &str) -> Result<Vec<DynamicObject>> {
        let params = ListParams::default().labels(label_selector);
        let objects = self.api.list(&params).await.map_err(Error::cluster)?;
        Ok(objects.items)
    }

    /// Deletes every custom resource matching a label selector.
    pub async fn delete_by_labels(&self, label_selector: &str) -> Result<()> {
        let params = ListParams::default().labels(label_selector);
        self.api
            .delete_collection(&DeleteParams::default(), &params)
            .await
            .map_err(Error::cluster)?;
        debug!(selector = label_selector, "custom resources deleted");
        Ok(())
    }
}
