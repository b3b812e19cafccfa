//! Cluster teardown

use tracing::{info, instrument, warn};

use strata_common::cluster::ClusterConfig;
use strata_common::state::ClusterPhase;
use strata_common::teardown::TeardownReport;
use strata_common::{Error, Result};

use super::Orchestrator;

impl Orchestrator {
    /// Tear down a stored cluster and remove its state
    ///
    /// Fails with `NotFound` (leaving no lock behind) if the name has no state.
    /// Teardown is best-effort: individual failures are logged and returned in
    /// the report, and the state is deleted once every phase has been
    /// attempted. Use [`TeardownReport::into_result`] to treat leftovers as an
    /// error.
    #[instrument(skip(self))]
    pub async fn destroy_cluster(&self, name: &str) -> Result<TeardownReport> {
        self.locked(name, "destroy", |_| async move {
            let mut state = self.load(name).await?;
            let provider = self.providers.get(state.config.provider)?;

            state
                .status
                .transition(ClusterPhase::Deleting, "tearing down resources");
            self.save_best_effort(&state).await;

            let resources = match state.provider_resources() {
                Ok(resources) => resources.clone(),
                Err(e) => {
                    warn!(error = %e, "No resource graph recorded, nothing to tear down");
                    serde_json::json!({})
                }
            };

            info!(provider = provider.name(), "Destroying cluster");
            let report = provider.destroy(&state.config, &resources).await;
            log_failures(name, &report);

            self.delete_state(name).await?;
            info!(
                deleted = report.entries.len() - report.failures().count(),
                failed = report.failures().count(),
                "Cluster destroyed"
            );
            Ok(report)
        })
        .await
    }

    /// Tear down the partial graph of a failed create
    ///
    /// `resources` is the graph carried by a `CreateFailed` error. Refused with
    /// `Conflict` if the name has stored state, since that graph belongs to a
    /// completed create and must go through [`Orchestrator::destroy_cluster`].
    #[instrument(skip_all, fields(cluster = %config.name))]
    pub async fn destroy_partial(
        &self,
        config: &ClusterConfig,
        resources: &serde_json::Value,
    ) -> Result<TeardownReport> {
        let provider = self.providers.get(config.provider)?;
        let name = config.name.as_str();

        self.locked(name, "destroy", |_| async move {
            if self.exists(name).await? {
                return Err(Error::conflict(
                    name,
                    "cluster has stored state; use destroy instead",
                ));
            }

            info!("Destroying partially-created resources");
            let report = provider.destroy(config, resources).await;
            log_failures(name, &report);
            Ok(report)
        })
        .await
    }
}

fn log_failures(cluster: &str, report: &TeardownReport) {
    if report.is_clean() {
        return;
    }
    let mut by_class: std::collections::BTreeMap<&str, Vec<&str>> = Default::default();
    for entry in report.failures() {
        by_class
            .entry(entry.resource.as_str())
            .or_default()
            .push(entry.id.as_str());
    }
    for (resource, ids) in by_class {
        warn!(
            cluster = %cluster,
            resource = %resource,
            ids = ?ids,
            "Teardown left resources behind; remove them manually"
        );
    }
}
