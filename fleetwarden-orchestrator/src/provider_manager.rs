use std::collections::BTreeMap;
use std::sync::Arc;

use fleetwarden_common::FleetError;
use fleetwarden_providers::CloudProvider;

use crate::config::Settings;

/// Name -> adapter. The orchestrator only ever talks to `dyn CloudProvider`;
/// vendor adapters are registered by the embedding binary.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn CloudProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn CloudProvider>) {
        let name = provider.name().to_lowercase();
        tracing::info!("🔌 [providers] registered provider '{}'", name);
        self.providers.insert(name, provider);
    }

    pub fn with(mut self, provider: Arc<dyn CloudProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn CloudProvider>, FleetError> {
        self.providers
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| FleetError::NotFound(format!("provider '{}'", name)))
    }

    pub fn all(&self) -> Vec<Arc<dyn CloudProvider>> {
        self.providers.values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Build the registry for `PROVIDER`. Only the in-memory mock ships with
    /// this workspace; unknown names are skipped with a warning.
    pub fn from_settings(settings: &Settings) -> Self {
        let mut registry = Self::new();
        for name in &settings.provider_names {
            match name.to_lowercase().as_str() {
                #[cfg(feature = "provider-mock")]
                n if n == "mock" || n.starts_with("mock-") => {
                    registry.register(Arc::new(fleetwarden_providers::mock::MockProvider::new(n)));
                }
                other => {
                    tracing::warn!(
                        "⚠️ [providers] no adapter compiled in for '{}', skipping",
                        other
                    );
                }
            }
        }
        registry
    }
}
