//! Workflow-definition resolution (§6 outbound contract). Definition authoring,
//! validation, and versioning live outside this core; the resolver is the seam
//! through which an already-validated, version-pinned definition enters it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::model::WorkflowDefinition;

#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    #[error("no definition registered for workflow {0} version {1:?}")]
    NotFound(String, Option<String>),

    #[error("invalid workflow definition: {0}")]
    Invalid(String),
}

/// Resolves a workflow name (and optional version) to a pinned, validated
/// definition.
#[async_trait]
pub trait DefinitionResolver: Send + Sync {
    async fn resolve(&self, name: &str, version: Option<&str>) -> Result<WorkflowDefinition, ResolverError>;
}

/// A resolver backed by an in-memory map, for tests and small deployments that pin
/// definitions at startup rather than through an external authoring service.
#[derive(Default, Clone)]
pub struct StaticResolver {
    definitions: Arc<RwLock<HashMap<(String, String), WorkflowDefinition>>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition, validating it per §6 before accepting it.
    pub fn register(&self, definition: WorkflowDefinition) -> Result<(), ResolverError> {
        definition.validate().map_err(ResolverError::Invalid)?;
        self.definitions
            .write()
            .insert((definition.name.clone(), definition.version.clone()), definition);
        Ok(())
    }
}

#[async_trait]
impl DefinitionResolver for StaticResolver {
    async fn resolve(&self, name: &str, version: Option<&str>) -> Result<WorkflowDefinition, ResolverError> {
        let definitions = self.definitions.read();

        if let Some(version) = version {
            return definitions
                .get(&(name.to_string(), version.to_string()))
                .cloned()
                .ok_or_else(|| ResolverError::NotFound(name.to_string(), Some(version.to_string())));
        }

        // No version pinned: pick the latest by lexical version ordering. A real
        // authoring service would carry an explicit "latest" pointer; this is a
        // small stand-in sufficient for tests and single-binary deployments.
        definitions
            .values()
            .filter(|d| d.name == name)
            .max_by(|a, b| a.version.cmp(&b.version))
            .cloned()
            .ok_or_else(|| ResolverError::NotFound(name.to_string(), None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Step;

    fn demo_definition() -> WorkflowDefinition {
        WorkflowDefinition {
            name: "demo".to_string(),
            version: "v1".to_string(),
            steps: vec![Step {
                id: "s1".to_string(),
                step_type: "log".to_string(),
                config: serde_json::json!({"message": "hi"}),
                next: None,
                on_error: None,
                timeout_ms: None,
                retry_policy: None,
            }],
        }
    }

    #[tokio::test]
    async fn resolves_registered_definition() {
        let resolver = StaticResolver::new();
        resolver.register(demo_definition()).unwrap();

        let resolved = resolver.resolve("demo", Some("v1")).await.unwrap();
        assert_eq!(resolved.name, "demo");
    }

    #[tokio::test]
    async fn unknown_workflow_is_not_found() {
        let resolver = StaticResolver::new();
        let result = resolver.resolve("missing", None).await;
        assert!(matches!(result, Err(ResolverError::NotFound(_, _))));
    }

    #[test]
    fn rejects_empty_definition() {
        let resolver = StaticResolver::new();
        let empty = WorkflowDefinition { name: "empty".to_string(), version: "v1".to_string(), steps: vec![] };
        assert!(resolver.register(empty).is_err());
    }

    #[test]
    fn rejects_dangling_next_reference() {
        let resolver = StaticResolver::new();
        let mut def = demo_definition();
        def.steps[0].next = Some("does-not-exist".to_string());
        assert!(resolver.register(def).is_err());
    }
}
