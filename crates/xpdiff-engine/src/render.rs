//! Render seam and fixed-point driver
//!
//! The render pipeline itself is external, effectful, and possibly
//! non-deterministic; the engine only drives it. Each invocation may report
//! requirements ("I need these resources to proceed"), which are resolved
//! and fed back in until the output stabilizes.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use xpdiff_core::{Composition, DiffError, Result, resource};

use crate::requirements::RequirementsProvider;

/// Requirements keyed by step name, then selector name
pub type StepRequirements = BTreeMap<String, BTreeMap<String, ResourceSelector>>;

/// A render-pipeline request for one resource or set of resources
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSelector {
    pub api_version: String,
    pub kind: String,
    /// Select one resource by name (resolved through the cache)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_name: Option<String>,
    /// Select resources by labels (always resolved live)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_labels: Option<BTreeMap<String, String>>,
    /// Explicit target namespace; resolved from scope otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Inputs for one render invocation
#[derive(Debug, Clone)]
pub struct RenderInputs {
    pub xr: JsonValue,
    pub composition: Composition,
    pub functions: Vec<JsonValue>,
    /// Resources discovered through requirements so far
    pub required_resources: Vec<JsonValue>,
    /// The composite's currently observed children
    pub observed_resources: Vec<JsonValue>,
}

/// Outputs of one successful render invocation
#[derive(Debug, Clone, Default)]
pub struct RenderOutputs {
    /// The post-render composite, when the pipeline returns one
    pub composite_resource: Option<JsonValue>,
    pub composed_resources: Vec<JsonValue>,
    pub requirements: StepRequirements,
}

/// Result of one render invocation
///
/// Failure with requirements is distinguishable from plain failure: the
/// pipeline may be partially successful and only blocked on missing
/// resources.
#[derive(Debug, Clone)]
pub enum RenderOutcome {
    Done(RenderOutputs),
    Incomplete {
        requirements: StepRequirements,
        error: String,
    },
}

/// The opaque render function supplied by the caller
pub type RenderFn =
    Arc<dyn Fn(RenderInputs) -> BoxFuture<'static, Result<RenderOutcome>> + Send + Sync>;

/// Wraps the render function with optional external serialization
pub struct Renderer {
    render: RenderFn,
    mutex: Option<Arc<tokio::sync::Mutex<()>>>,
}

impl Renderer {
    pub fn new(render: RenderFn) -> Self {
        Self {
            render,
            mutex: None,
        }
    }

    /// Serialize every render invocation through the given mutex
    ///
    /// For render implementations that share a container runtime and are
    /// not safe to call concurrently.
    pub fn with_mutex(mut self, mutex: Arc<tokio::sync::Mutex<()>>) -> Self {
        self.mutex = Some(mutex);
        self
    }

    async fn render(&self, inputs: RenderInputs) -> Result<RenderOutcome> {
        let _guard = match &self.mutex {
            Some(mutex) => Some(mutex.lock().await),
            None => None,
        };
        (self.render)(inputs).await
    }

    /// Drive the render pipeline to a fixed point
    ///
    /// Each iteration resolves the reported requirements and feeds the
    /// discovered resources back in. Exits when the pipeline reports no
    /// requirements or an iteration discovers nothing new; a hard cap
    /// bounds pathological loops.
    pub async fn render_to_fixed_point(
        &self,
        requirements_provider: &RequirementsProvider,
        xr: &JsonValue,
        composition: &Composition,
        functions: &[JsonValue],
        observed_resources: &[JsonValue],
        max_iterations: usize,
    ) -> Result<RenderOutputs> {
        let xr_namespace = resource::namespace(xr).to_string();
        let mut discovered: Vec<JsonValue> = Vec::new();
        let mut last: Option<RenderOutputs> = None;

        for iteration in 1..=max_iterations {
            let inputs = RenderInputs {
                xr: xr.clone(),
                composition: composition.clone(),
                functions: functions.to_vec(),
                required_resources: discovered.clone(),
                observed_resources: observed_resources.to_vec(),
            };

            let (requirements, render_error) = match self.render(inputs).await? {
                RenderOutcome::Done(outputs) => {
                    let requirements = outputs.requirements.clone();
                    last = Some(outputs);
                    (requirements, None)
                }
                RenderOutcome::Incomplete {
                    requirements,
                    error,
                } => {
                    if requirements.is_empty() {
                        return Err(DiffError::Render(error));
                    }
                    warn!(iteration, error = %error, "render failed but reported requirements, continuing");
                    (requirements, Some(error))
                }
            };

            if requirements.is_empty() {
                return last.ok_or_else(|| {
                    DiffError::Internal("render produced no output and no requirements".into())
                });
            }

            let fetched = requirements_provider
                .provide_requirements(&requirements, &xr_namespace)
                .await?;

            let mut added = false;
            for candidate in fetched {
                let duplicate = discovered.iter().any(|existing| {
                    resource::api_version(existing) == resource::api_version(&candidate)
                        && resource::name(existing) == resource::name(&candidate)
                });
                if !duplicate {
                    discovered.push(candidate);
                    added = true;
                }
            }

            debug!(iteration, total = discovered.len(), added, "render requirements resolved");

            if !added {
                // Nothing new to supply; re-rendering cannot converge further.
                return match last {
                    Some(outputs) => Ok(outputs),
                    None => Err(DiffError::Render(
                        render_error.unwrap_or_else(|| "render requirements unsatisfiable".into()),
                    )),
                };
            }
        }

        warn!(max_iterations, "render did not settle, using last output");
        last.ok_or_else(|| {
            DiffError::LimitExceeded(format!(
                "render produced no usable output in {} iterations",
                max_iterations
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use xpdiff_kube::MockClients;

    use serde_json::json;

    fn selector(name: &str) -> ResourceSelector {
        ResourceSelector {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            match_name: Some(name.to_string()),
            match_labels: None,
            namespace: Some("default".to_string()),
        }
    }

    fn requirements_for(name: &str) -> StepRequirements {
        let mut selectors = BTreeMap::new();
        selectors.insert("need".to_string(), selector(name));
        let mut reqs = StepRequirements::new();
        reqs.insert("step-1".to_string(), selectors);
        reqs
    }

    fn composition() -> Composition {
        Composition::from_value(&json!({
            "apiVersion": "apiextensions.crossplane.io/v1",
            "kind": "Composition",
            "metadata": {"name": "test"},
            "spec": {
                "compositeTypeRef": {"apiVersion": "example.org/v1", "kind": "XBucket"},
                "pipeline": []
            }
        }))
        .unwrap()
    }

    fn provider() -> RequirementsProvider {
        let mock = MockClients::new().with_resource(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm-1", "namespace": "default"},
            "data": {"k": "v"}
        }));
        RequirementsProvider::new(mock.clients())
    }

    #[tokio::test]
    async fn test_fixed_point_immediate() {
        let renderer = Renderer::new(Arc::new(|_inputs| {
            Box::pin(async {
                Ok(RenderOutcome::Done(RenderOutputs {
                    composite_resource: None,
                    composed_resources: vec![json!({"apiVersion": "v1", "kind": "ConfigMap"})],
                    requirements: StepRequirements::new(),
                }))
            })
        }));

        let out = renderer
            .render_to_fixed_point(&provider(), &json!({}), &composition(), &[], &[], 10)
            .await
            .unwrap();
        assert_eq!(out.composed_resources.len(), 1);
    }

    #[tokio::test]
    async fn test_fixed_point_feeds_requirements_back() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen_extra = Arc::new(StdMutex::new(Vec::new()));
        let calls_inner = calls.clone();
        let seen_inner = seen_extra.clone();

        let renderer = Renderer::new(Arc::new(move |inputs: RenderInputs| {
            let calls = calls_inner.clone();
            let seen = seen_inner.clone();
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                seen.lock().unwrap().push(inputs.required_resources.len());
                if n == 0 {
                    Ok(RenderOutcome::Done(RenderOutputs {
                        requirements: requirements_for("cm-1"),
                        ..Default::default()
                    }))
                } else {
                    Ok(RenderOutcome::Done(RenderOutputs::default()))
                }
            })
        }));

        renderer
            .render_to_fixed_point(&provider(), &json!({}), &composition(), &[], &[], 10)
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*seen_extra.lock().unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_incomplete_without_requirements_is_fatal() {
        let renderer = Renderer::new(Arc::new(|_inputs| {
            Box::pin(async {
                Ok(RenderOutcome::Incomplete {
                    requirements: StepRequirements::new(),
                    error: "function exploded".to_string(),
                })
            })
        }));

        let err = renderer
            .render_to_fixed_point(&provider(), &json!({}), &composition(), &[], &[], 10)
            .await
            .unwrap_err();
        assert!(matches!(err, DiffError::Render(_)));
    }

    #[tokio::test]
    async fn test_incomplete_with_requirements_recovers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_inner = calls.clone();

        let renderer = Renderer::new(Arc::new(move |_inputs| {
            let calls = calls_inner.clone();
            Box::pin(async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(RenderOutcome::Incomplete {
                        requirements: requirements_for("cm-1"),
                        error: "needs cm-1".to_string(),
                    })
                } else {
                    Ok(RenderOutcome::Done(RenderOutputs::default()))
                }
            })
        }));

        renderer
            .render_to_fixed_point(&provider(), &json!({}), &composition(), &[], &[], 10)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stable_requirements_exit_early() {
        // Always asks for the same resource; the loop must notice nothing
        // new arrives and exit with the last output.
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_inner = calls.clone();

        let renderer = Renderer::new(Arc::new(move |_inputs| {
            let calls = calls_inner.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(RenderOutcome::Done(RenderOutputs {
                    requirements: requirements_for("cm-1"),
                    ..Default::default()
                }))
            })
        }));

        renderer
            .render_to_fixed_point(&provider(), &json!({}), &composition(), &[], &[], 10)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_mutex_serializes_renders() {
        let mutex = Arc::new(tokio::sync::Mutex::new(()));
        let renderer = Renderer::new(Arc::new(|_inputs| {
            Box::pin(async { Ok(RenderOutcome::Done(RenderOutputs::default())) })
        }))
        .with_mutex(mutex.clone());

        // Holding the mutex elsewhere must block the render until released.
        let guard = mutex.lock().await;
        let inputs = RenderInputs {
            xr: json!({}),
            composition: composition(),
            functions: vec![],
            required_resources: vec![],
            observed_resources: vec![],
        };
        let pending = renderer.render(inputs);
        tokio::pin!(pending);
        assert!(
            futures::poll!(pending.as_mut()).is_pending(),
            "render should wait for the mutex"
        );
        drop(guard);
        pending.await.unwrap();
    }
}
