use sagacore::{StepBody, StepError};
use std::collections::HashMap;
use std::sync::Arc;

/// Factory trait for creating step body instances
pub trait StepBodyFactory: Send + Sync {
    /// Create a fresh body. Called once per pointer run.
    fn create(&self) -> Result<Box<dyn StepBody>, StepError>;

    /// Registry tag, referenced by `WorkflowStep::body`
    fn body_type(&self) -> &str;

    fn metadata(&self) -> StepMetadata {
        StepMetadata::default()
    }
}

/// Metadata about a step body type
#[derive(Debug, Clone)]
pub struct StepMetadata {
    pub description: String,
    pub category: String,
}

impl Default for StepMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
        }
    }
}

/// Factory backed by a closure, for application steps that need no configuration.
pub struct FnStepFactory<F> {
    body_type: String,
    metadata: StepMetadata,
    create: F,
}

impl<F> FnStepFactory<F>
where
    F: Fn() -> Box<dyn StepBody> + Send + Sync,
{
    pub fn new(body_type: impl Into<String>, create: F) -> Self {
        Self {
            body_type: body_type.into(),
            metadata: StepMetadata::default(),
            create,
        }
    }

    pub fn with_metadata(
        mut self,
        description: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        self.metadata = StepMetadata {
            description: description.into(),
            category: category.into(),
        };
        self
    }
}

impl<F> StepBodyFactory for FnStepFactory<F>
where
    F: Fn() -> Box<dyn StepBody> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn StepBody>, StepError> {
        Ok((self.create)())
    }

    fn body_type(&self) -> &str {
        &self.body_type
    }

    fn metadata(&self) -> StepMetadata {
        self.metadata.clone()
    }
}

/// Registry of available step body types
pub struct StepRegistry {
    factories: HashMap<String, Arc<dyn StepBodyFactory>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a body factory. A later registration under the same tag replaces the earlier one.
    pub fn register(&mut self, factory: Arc<dyn StepBodyFactory>) {
        let body_type = factory.body_type().to_string();
        tracing::debug!("Registering step body type: {}", body_type);
        self.factories.insert(body_type, factory);
    }

    pub fn register_fn<F>(&mut self, body_type: impl Into<String>, create: F)
    where
        F: Fn() -> Box<dyn StepBody> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnStepFactory::new(body_type, create)));
    }

    pub fn create(&self, body_type: &str) -> Result<Box<dyn StepBody>, StepError> {
        let factory = self
            .factories
            .get(body_type)
            .ok_or_else(|| StepError::UnknownBodyType(body_type.to_string()))?;

        factory.create()
    }

    pub fn contains(&self, body_type: &str) -> bool {
        self.factories.contains_key(body_type)
    }

    pub fn list_body_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn get_metadata(&self, body_type: &str) -> Option<StepMetadata> {
        self.factories.get(body_type).map(|f| f.metadata())
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}
