//! Polling translation from operator status to trial status.

use crate::client::CrdClient;
use crate::operator::OperatorAdapter;
use kube::api::DynamicObject;
use std::collections::HashMap;
use std::sync::Arc;
use sweep_core::TrialRegistry;
use tracing::warn;

/// Periodically lists this experiment's custom resources and folds their
/// status into the registry.
pub struct JobInfoCollector {
    registry: TrialRegistry,
    client: CrdClient,
    adapter: Arc<dyn OperatorAdapter>,
    label_selector: String,
}

impl JobInfoCollector {
    #[must_use]
    pub fn new(
        registry: TrialRegistry,
        client: CrdClient,
        adapter: Arc<dyn OperatorAdapter>,
        label_selector: String,
    ) -> Self {
        Self { registry, client, adapter, label_selector }
    }

    /// One refresh pass. A failed list is logged and skipped; the next
    /// tick tries again.
    pub async fn refresh(&self) {
        let open = self.registry.non_terminal_ids().await;
        if open.is_empty() {
            return;
        }
        let objects = match self.client.list(&self.label_selector).await {
            Ok(objects) => objects,
            Err(err) => {
                warn!(error = %err, "custom resource list failed, keeping previous statuses");
                return;
            }
        };

        let mut by_trial: HashMap<&str, &DynamicObject> = HashMap::new();
        for object in &objects {
            if let Some(trial) =
                object.metadata.labels.as_ref().and_then(|labels| labels.get("trial"))
            {
                by_trial.insert(trial.as_str(), object);
            }
        }

        for id in open {
            let Some(object) = by_trial.get(id.as_str()) else { continue };
            if let Some(status) = self.adapter.map_status(object) {
                self.registry.observe_status(&id, status).await;
            }
        }
    }
}
