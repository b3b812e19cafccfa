//! Provider lookup by cloud

use std::collections::HashMap;
use std::sync::Arc;

use strata_aws::{AwsClients, AwsProvider};
use strata_common::cluster::CloudProvider;
use strata_common::config::Settings;
use strata_common::provider::Provider;
use strata_common::{Error, Result};

/// Maps each [`CloudProvider`] to the implementation that serves it
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<CloudProvider, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the AWS provider wired to `clients`
    pub fn aws(clients: AwsClients, settings: &Settings) -> Self {
        Self::new().with(CloudProvider::Aws, Arc::new(AwsProvider::new(clients, settings)))
    }

    /// Register (or replace) the provider for a cloud
    pub fn with(mut self, cloud: CloudProvider, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(cloud, provider);
        self
    }

    /// Provider for a cloud; `Configuration` if none is registered
    pub fn get(&self, cloud: CloudProvider) -> Result<Arc<dyn Provider>> {
        self.providers.get(&cloud).cloned().ok_or_else(|| {
            Error::configuration(format!("no provider registered for '{}'", cloud.as_str()))
        })
    }
}
