//! Requirement resolution for the render pipeline
//!
//! Answers "I need these resources to proceed" callbacks from an in-memory
//! cache when possible and from the cluster otherwise. The cache lives for
//! the process: identical requirement fetches within one run must return
//! identical objects, and a diff run is short enough that staleness is
//! acceptable.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value as JsonValue;
use tracing::debug;

use xpdiff_core::{Gvk, Result, resource};
use xpdiff_kube::Clients;

use crate::render::{ResourceSelector, StepRequirements};

type CacheKey = (String, String, String);

/// Resolves render-pipeline requirements against cache and cluster
pub struct RequirementsProvider {
    clients: Clients,
    /// Keyed on (apiVersion, kind, name); readers share, one writer at a time
    cache: RwLock<HashMap<CacheKey, JsonValue>>,
}

impl RequirementsProvider {
    pub fn new(clients: Clients) -> Self {
        Self {
            clients,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch environment configs once and warm the cache with them
    pub async fn initialize(&self) -> Result<()> {
        let configs = self.clients.environment.environment_configs().await?;
        let mut cache = self.cache.write().expect("requirements cache lock");
        for config in configs {
            cache.insert(cache_key(&config), config);
        }
        Ok(())
    }

    /// Drop every cached entry
    pub fn clear_cache(&self) {
        self.cache
            .write()
            .expect("requirements cache lock")
            .clear();
    }

    /// Number of cached entries, for assertions
    pub fn cache_len(&self) -> usize {
        self.cache.read().expect("requirements cache lock").len()
    }

    /// Resolve every selector of every step
    ///
    /// `xr_namespace` is the invoking XR's namespace, the fallback target
    /// for namespaced kinds when the selector does not name one.
    pub async fn provide_requirements(
        &self,
        requirements: &StepRequirements,
        xr_namespace: &str,
    ) -> Result<Vec<JsonValue>> {
        let mut fetched = Vec::new();
        for (step, selectors) in requirements {
            for (name, selector) in selectors {
                debug!(step = %step, selector = %name, "resolving requirement");
                fetched.extend(self.resolve_selector(selector, xr_namespace).await?);
            }
        }
        Ok(fetched)
    }

    async fn resolve_selector(
        &self,
        selector: &ResourceSelector,
        xr_namespace: &str,
    ) -> Result<Vec<JsonValue>> {
        let gvk = Gvk::from_api_version(&selector.api_version, selector.kind.clone());

        if let Some(name) = &selector.match_name {
            let key = (
                selector.api_version.clone(),
                selector.kind.clone(),
                name.clone(),
            );
            if let Some(hit) = self
                .cache
                .read()
                .expect("requirements cache lock")
                .get(&key)
            {
                debug!(kind = %selector.kind, name, "requirement served from cache");
                return Ok(vec![hit.clone()]);
            }

            let namespace = self.resolve_namespace(selector, &gvk, xr_namespace).await?;
            let obj = self.clients.resource.get(&gvk, &namespace, name).await?;
            self.cache
                .write()
                .expect("requirements cache lock")
                .insert(key, obj.clone());
            return Ok(vec![obj]);
        }

        if let Some(labels) = &selector.match_labels {
            // Label results are not cached: they cannot be keyed efficiently.
            let namespace = self.resolve_namespace(selector, &gvk, xr_namespace).await?;
            return self
                .clients
                .resource
                .list_by_label(&gvk, &namespace, labels)
                .await;
        }

        debug!(kind = %selector.kind, "selector has neither matchName nor matchLabels, skipping");
        Ok(Vec::new())
    }

    async fn resolve_namespace(
        &self,
        selector: &ResourceSelector,
        gvk: &Gvk,
        xr_namespace: &str,
    ) -> Result<String> {
        if let Some(namespace) = &selector.namespace {
            return Ok(namespace.clone());
        }
        if self.clients.resource.is_namespaced(gvk).await? {
            Ok(xr_namespace.to_string())
        } else {
            Ok(String::new())
        }
    }
}

fn cache_key(obj: &JsonValue) -> CacheKey {
    (
        resource::api_version(obj).to_string(),
        resource::kind(obj).to_string(),
        resource::name(obj).to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use xpdiff_kube::MockClients;

    use serde_json::json;

    fn config_map(name: &str) -> JsonValue {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "prod", "labels": {"team": "a"}},
            "data": {"k": "v"}
        })
    }

    fn match_name_selector(name: &str) -> ResourceSelector {
        ResourceSelector {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            match_name: Some(name.to_string()),
            match_labels: None,
            namespace: None,
        }
    }

    fn requirements(selector: ResourceSelector) -> StepRequirements {
        let mut selectors = BTreeMap::new();
        selectors.insert("need".to_string(), selector);
        let mut reqs = StepRequirements::new();
        reqs.insert("step-1".to_string(), selectors);
        reqs
    }

    #[tokio::test]
    async fn test_match_name_fetches_and_caches() {
        let mock = MockClients::new()
            .with_resource(config_map("cm-1"))
            .with_namespaced_kind("", "ConfigMap");
        let provider = RequirementsProvider::new(mock.clients());

        let reqs = requirements(match_name_selector("cm-1"));
        let first = provider.provide_requirements(&reqs, "prod").await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(mock.get_count("v1", "ConfigMap", "cm-1"), 1);

        // Second resolution is served from cache: no second get.
        let second = provider.provide_requirements(&reqs, "prod").await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(mock.get_count("v1", "ConfigMap", "cm-1"), 1);
        assert_eq!(first[0], second[0]);
    }

    #[tokio::test]
    async fn test_match_name_not_found_fails() {
        let mock = MockClients::new().with_namespaced_kind("", "ConfigMap");
        let provider = RequirementsProvider::new(mock.clients());

        let reqs = requirements(match_name_selector("absent"));
        let err = provider.provide_requirements(&reqs, "prod").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_match_labels_bypasses_cache() {
        let mock = MockClients::new()
            .with_resource(config_map("cm-1"))
            .with_resource(config_map("cm-2"))
            .with_namespaced_kind("", "ConfigMap");
        let provider = RequirementsProvider::new(mock.clients());

        let mut labels = BTreeMap::new();
        labels.insert("team".to_string(), "a".to_string());
        let selector = ResourceSelector {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            match_name: None,
            match_labels: Some(labels),
            namespace: None,
        };

        let reqs = requirements(selector);
        let found = provider.provide_requirements(&reqs, "prod").await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(provider.cache_len(), 0);

        provider.provide_requirements(&reqs, "prod").await.unwrap();
        assert_eq!(mock.list_count(), 2);
    }

    #[tokio::test]
    async fn test_initialize_warms_cache_from_env_configs() {
        let env = json!({
            "apiVersion": "apiextensions.crossplane.io/v1beta1",
            "kind": "EnvironmentConfig",
            "metadata": {"name": "env-1"},
            "data": {"region": "eu"}
        });
        let mock = MockClients::new().with_env_config(env.clone());
        let provider = RequirementsProvider::new(mock.clients());
        provider.initialize().await.unwrap();
        assert_eq!(provider.cache_len(), 1);

        let selector = ResourceSelector {
            api_version: "apiextensions.crossplane.io/v1beta1".to_string(),
            kind: "EnvironmentConfig".to_string(),
            match_name: Some("env-1".to_string()),
            match_labels: None,
            namespace: None,
        };
        let found = provider
            .provide_requirements(&requirements(selector), "")
            .await
            .unwrap();
        assert_eq!(found, vec![env]);
        // Served entirely from the warm cache.
        assert_eq!(
            mock.get_count("apiextensions.crossplane.io/v1beta1", "EnvironmentConfig", "env-1"),
            0
        );
    }

    #[tokio::test]
    async fn test_clear_cache() {
        let mock = MockClients::new()
            .with_resource(config_map("cm-1"))
            .with_namespaced_kind("", "ConfigMap");
        let provider = RequirementsProvider::new(mock.clients());

        let reqs = requirements(match_name_selector("cm-1"));
        provider.provide_requirements(&reqs, "prod").await.unwrap();
        assert_eq!(provider.cache_len(), 1);

        provider.clear_cache();
        assert_eq!(provider.cache_len(), 0);

        provider.provide_requirements(&reqs, "prod").await.unwrap();
        assert_eq!(mock.get_count("v1", "ConfigMap", "cm-1"), 2);
    }

    #[tokio::test]
    async fn test_namespace_resolution_cluster_scoped() {
        let cluster_obj = json!({
            "apiVersion": "example.org/v1",
            "kind": "ClusterThing",
            "metadata": {"name": "t-1"}
        });
        let mock = MockClients::new().with_resource(cluster_obj);
        let provider = RequirementsProvider::new(mock.clients());

        let selector = ResourceSelector {
            api_version: "example.org/v1".to_string(),
            kind: "ClusterThing".to_string(),
            match_name: Some("t-1".to_string()),
            match_labels: None,
            namespace: None,
        };
        // ClusterThing is not registered as namespaced, so the XR's
        // namespace must not leak into the lookup.
        let found = provider
            .provide_requirements(&requirements(selector), "prod")
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }
}
