//! Model selection and agent construction.

use std::sync::Arc;

use session_relay_core::{Agent, AgentError, ModelConfig, ModelRef, SessionInfo};
use tracing::warn;

/// Builds the agent for a session.
pub trait AgentFactory: Send + Sync {
    /// Create an agent for `session` that will run with `model`.
    ///
    /// # Errors
    /// Returns error if the agent cannot be constructed.
    fn create_agent(
        &self,
        session: &SessionInfo,
        model: &ModelRef,
    ) -> Result<Arc<dyn Agent>, AgentError>;
}

impl<F> AgentFactory for F
where
    F: Fn(&SessionInfo, &ModelRef) -> Result<Arc<dyn Agent>, AgentError> + Send + Sync,
{
    fn create_agent(
        &self,
        session: &SessionInfo,
        model: &ModelRef,
    ) -> Result<Arc<dyn Agent>, AgentError> {
        self(session, model)
    }
}

/// Maps stored model choices onto what this server can run.
#[derive(Debug, Clone)]
pub struct ModelResolver {
    default: ModelRef,
    available: Vec<ModelRef>,
}

impl ModelResolver {
    /// An empty `available` list accepts any model.
    #[must_use]
    pub const fn new(default: ModelRef, available: Vec<ModelRef>) -> Self {
        Self { default, available }
    }

    #[must_use]
    pub const fn default_model(&self) -> &ModelRef {
        &self.default
    }

    /// Whether `model` may be selected.
    #[must_use]
    pub fn is_available(&self, model: &ModelRef) -> bool {
        self.available.is_empty() || *model == self.default || self.available.contains(model)
    }

    /// The model a session should run with.
    ///
    /// A stored choice that is no longer available falls back to the
    /// default instead of failing.
    #[must_use]
    pub fn resolve(&self, stored: Option<&ModelConfig>) -> ModelRef {
        let Some(config) = stored else {
            return self.default.clone();
        };
        let wanted = ModelRef::from(config);
        if self.is_available(&wanted) {
            wanted
        } else {
            warn!(
                provider = %wanted.provider,
                model_id = %wanted.model_id,
                fallback = %self.default.model_id,
                "Stored model is no longer available, using default"
            );
            self.default.clone()
        }
    }

    /// Model for a session record.
    #[must_use]
    pub fn resolve_for(&self, session: &SessionInfo) -> ModelRef {
        self.resolve(session.model_config().as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> ModelResolver {
        ModelResolver::new(
            ModelRef::new("openai", "gpt-4o"),
            vec![ModelRef::new("anthropic", "sonnet")],
        )
    }

    #[test]
    fn test_missing_choice_uses_default() {
        assert_eq!(resolver().resolve(None).model_id, "gpt-4o");
    }

    #[test]
    fn test_valid_choice_is_kept() {
        let config = ModelConfig::new("anthropic", "sonnet");
        assert_eq!(resolver().resolve(Some(&config)).provider, "anthropic");
    }

    #[test]
    fn test_stale_choice_falls_back() {
        let config = ModelConfig::new("retired", "model-1");
        assert_eq!(resolver().resolve(Some(&config)), ModelRef::new("openai", "gpt-4o"));
    }

    #[test]
    fn test_empty_list_accepts_anything() {
        let open = ModelResolver::new(ModelRef::new("openai", "gpt-4o"), Vec::new());
        assert!(open.is_available(&ModelRef::new("any", "thing")));
    }
}
