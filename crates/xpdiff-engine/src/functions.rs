//! Function resolution for render pipelines
//!
//! Two providers: a per-call fetcher for single-XR runs, and a caching
//! variant for composition-change runs. The cached variant annotates each
//! function with a stable container-runtime reuse key so repeated renders
//! across many XRs amortize container startup, and tears the containers
//! down on cleanup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use xpdiff_core::{Composition, Result, fields, object, resource};
use xpdiff_kube::FunctionClient;

/// Supplies the composition functions for a given composition
#[async_trait]
pub trait FunctionProvider: Send + Sync {
    async fn functions_for(&self, composition: &Composition) -> Result<Vec<JsonValue>>;
}

/// Removes container-runtime artifacts recorded for reuse
#[async_trait]
pub trait RuntimeCleaner: Send + Sync {
    async fn remove_runtime(&self, name: &str) -> Result<()>;
}

/// Fetches functions on every invocation
pub struct FetchFunctionProvider {
    client: Arc<dyn FunctionClient>,
}

impl FetchFunctionProvider {
    pub fn new(client: Arc<dyn FunctionClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FunctionProvider for FetchFunctionProvider {
    async fn functions_for(&self, composition: &Composition) -> Result<Vec<JsonValue>> {
        self.client.functions_from_pipeline(composition).await
    }
}

/// Fetches once per composition and annotates for container reuse
pub struct CachedFunctionProvider {
    client: Arc<dyn FunctionClient>,
    cleaner: Option<Arc<dyn RuntimeCleaner>>,
    /// Per-process suffix preventing collisions between concurrent runs
    suffix: String,
    cache: tokio::sync::Mutex<HashMap<String, Vec<JsonValue>>>,
    runtime_names: Mutex<Vec<String>>,
}

impl CachedFunctionProvider {
    pub fn new(client: Arc<dyn FunctionClient>) -> Self {
        Self {
            client,
            cleaner: None,
            suffix: format!("{:08x}", rand::random::<u32>()),
            cache: tokio::sync::Mutex::new(HashMap::new()),
            runtime_names: Mutex::new(Vec::new()),
        }
    }

    /// Attach the runtime cleaner invoked by `cleanup`
    pub fn with_cleaner(mut self, cleaner: Arc<dyn RuntimeCleaner>) -> Self {
        self.cleaner = Some(cleaner);
        self
    }

    /// Container-runtime reuse key for a function
    ///
    /// "<last-path-segment-of-package>-<version>-comp-<suffix>", with ":"
    /// in the version replaced by "-"; "unknown-comp-<suffix>" when the
    /// package ref is empty.
    fn reuse_key(&self, function: &JsonValue) -> String {
        let package = object::get_string(function, &["spec", "package"]).unwrap_or_default();
        if package.is_empty() {
            return format!("unknown-comp-{}", self.suffix);
        }
        let segment = package.rsplit('/').next().unwrap_or(package);
        let (name, version) = segment.split_once(':').unwrap_or((segment, "latest"));
        format!(
            "{}-{}-comp-{}",
            name,
            version.replace(':', "-"),
            self.suffix
        )
    }

    /// Recorded runtime names, for assertions
    pub fn runtime_names(&self) -> Vec<String> {
        self.runtime_names.lock().expect("runtime names lock").clone()
    }

    /// Stop and remove all recorded runtime containers
    ///
    /// Best-effort: failures are logged, never raised.
    pub async fn cleanup(&self) {
        let names: Vec<String> = {
            let mut recorded = self.runtime_names.lock().expect("runtime names lock");
            recorded.drain(..).collect()
        };
        let Some(cleaner) = &self.cleaner else {
            return;
        };
        for name in names {
            if let Err(e) = cleaner.remove_runtime(&name).await {
                warn!(runtime = %name, error = %e, "failed to remove function runtime");
            }
        }
    }
}

#[async_trait]
impl FunctionProvider for CachedFunctionProvider {
    async fn functions_for(&self, composition: &Composition) -> Result<Vec<JsonValue>> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.get(&composition.name) {
            debug!(composition = %composition.name, "functions served from cache");
            return Ok(cached.clone());
        }

        let mut functions = self.client.functions_from_pipeline(composition).await?;
        for function in &mut functions {
            let key = self.reuse_key(function);
            resource::set_annotation(function, fields::RUNTIME_NAME_ANNOTATION, &key);
            self.runtime_names
                .lock()
                .expect("runtime names lock")
                .push(key);
        }

        cache.insert(composition.name.clone(), functions.clone());
        Ok(functions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use xpdiff_kube::MockClients;

    use serde_json::json;

    fn composition() -> Composition {
        Composition::from_value(&json!({
            "apiVersion": "apiextensions.crossplane.io/v1",
            "kind": "Composition",
            "metadata": {"name": "xbuckets.example.org"},
            "spec": {
                "compositeTypeRef": {"apiVersion": "example.org/v1", "kind": "XBucket"},
                "pipeline": [
                    {"step": "compose", "functionRef": {"name": "function-patch-and-transform"}}
                ]
            }
        }))
        .unwrap()
    }

    fn function() -> JsonValue {
        json!({
            "apiVersion": "pkg.crossplane.io/v1",
            "kind": "Function",
            "metadata": {"name": "function-patch-and-transform"},
            "spec": {"package": "xpkg.example.io/crossplane-contrib/function-patch-and-transform:v0.7.0"}
        })
    }

    #[tokio::test]
    async fn test_fetch_provider_calls_through() {
        let mock = MockClients::new().with_function(function());
        let provider = FetchFunctionProvider::new(mock.clients().function);
        let functions = provider.functions_for(&composition()).await.unwrap();
        assert_eq!(functions.len(), 1);
        // No reuse annotation in the per-call variant.
        assert!(resource::annotation(&functions[0], fields::RUNTIME_NAME_ANNOTATION).is_none());
    }

    #[tokio::test]
    async fn test_cached_provider_annotates_and_caches() {
        let mock = MockClients::new().with_function(function());
        let provider = CachedFunctionProvider::new(mock.clients().function);

        let first = provider.functions_for(&composition()).await.unwrap();
        let annotation =
            resource::annotation(&first[0], fields::RUNTIME_NAME_ANNOTATION).unwrap();
        assert!(annotation.starts_with("function-patch-and-transform-v0.7.0-comp-"));
        assert_eq!(provider.runtime_names().len(), 1);

        let second = provider.functions_for(&composition()).await.unwrap();
        assert_eq!(first, second);
        // Still a single recorded runtime: the second call hit the cache.
        assert_eq!(provider.runtime_names().len(), 1);
    }

    #[tokio::test]
    async fn test_reuse_key_unknown_package() {
        let mock = MockClients::new();
        let provider = CachedFunctionProvider::new(mock.clients().function);
        let bare = json!({
            "apiVersion": "pkg.crossplane.io/v1",
            "kind": "Function",
            "metadata": {"name": "f"}
        });
        let key = provider.reuse_key(&bare);
        assert!(key.starts_with("unknown-comp-"));
    }

    #[tokio::test]
    async fn test_reuse_key_digest_version() {
        let mock = MockClients::new();
        let provider = CachedFunctionProvider::new(mock.clients().function);
        let digest = json!({
            "apiVersion": "pkg.crossplane.io/v1",
            "kind": "Function",
            "metadata": {"name": "f"},
            "spec": {"package": "registry.example.io/fns/go-templating:sha256:abcd"}
        });
        let key = provider.reuse_key(&digest);
        assert!(key.starts_with("go-templating-sha256-abcd-comp-"));
    }

    struct CountingCleaner {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl RuntimeCleaner for Arc<CountingCleaner> {
        async fn remove_runtime(&self, _name: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(xpdiff_core::DiffError::Internal("docker is gone".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_cleanup_is_best_effort() {
        let cleaner = Arc::new(CountingCleaner {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let mock = MockClients::new().with_function(function());
        let provider = CachedFunctionProvider::new(mock.clients().function)
            .with_cleaner(Arc::new(cleaner.clone()));

        provider.functions_for(&composition()).await.unwrap();
        // Failures are swallowed; cleanup still drains the recorded names.
        provider.cleanup().await;
        assert_eq!(cleaner.calls.load(Ordering::SeqCst), 1);
        assert!(provider.runtime_names().is_empty());
    }
}
