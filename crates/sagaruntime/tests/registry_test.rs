use async_trait::async_trait;
use sagacore::{
    DefinitionError, ExecutionResult, StepBody, StepError, StepExecutionContext, WorkflowDefinition,
    WorkflowStep,
};
use sagaruntime::{validate, DefinitionRegistry, FnStepFactory, StepRegistry};
use std::sync::Arc;

struct Noop;

#[async_trait]
impl StepBody for Noop {
    async fn run(&mut self, _ctx: &StepExecutionContext<'_>) -> Result<ExecutionResult, StepError> {
        Ok(ExecutionResult::next())
    }
}

fn chain(id: &str, version: u32) -> WorkflowDefinition {
    let mut definition = WorkflowDefinition::new(id, version);
    let a = definition.add_step(WorkflowStep::new("noop"));
    let b = definition.add_step(WorkflowStep::new("noop"));
    definition.connect(a, b);
    definition
}

#[test]
fn test_step_registry_creates_registered_bodies() {
    let mut registry = StepRegistry::new();
    registry.register(Arc::new(
        FnStepFactory::new("noop", || Box::new(Noop) as Box<dyn StepBody>)
            .with_metadata("Does nothing", "testing"),
    ));
    registry.register_fn("also.noop", || Box::new(Noop) as Box<dyn StepBody>);

    assert!(registry.contains("noop"));
    assert!(registry.create("noop").is_ok());
    assert_eq!(registry.list_body_types(), vec!["also.noop", "noop"]);
    assert_eq!(
        registry.get_metadata("noop").map(|m| m.category),
        Some("testing".to_string())
    );

    match registry.create("missing") {
        Err(StepError::UnknownBodyType(tag)) => assert_eq!(tag, "missing"),
        _ => panic!("expected UnknownBodyType"),
    }
}

#[test]
fn test_validate_accepts_chain() {
    assert!(validate(&chain("orders", 1)).is_ok());
}

#[test]
fn test_validate_rejects_empty_definition() {
    let definition = WorkflowDefinition::new("empty", 1);
    assert!(matches!(validate(&definition), Err(DefinitionError::Invalid(_))));
}

#[test]
fn test_validate_rejects_unknown_targets() {
    let mut definition = chain("orders", 1);
    definition.connect(1, 42);
    assert!(matches!(validate(&definition), Err(DefinitionError::Invalid(_))));

    let mut definition = chain("orders", 1);
    definition.steps[0].children.push(7);
    assert!(matches!(validate(&definition), Err(DefinitionError::Invalid(_))));

    let mut definition = chain("orders", 1);
    definition.steps[1].compensation_step_id = Some(9);
    assert!(matches!(validate(&definition), Err(DefinitionError::Invalid(_))));
}

#[test]
fn test_validate_rejects_duplicate_ids_and_missing_initial_step() {
    let mut definition = chain("orders", 1);
    definition.steps.push(WorkflowStep::new("noop").with_id(1));
    assert!(matches!(validate(&definition), Err(DefinitionError::Invalid(_))));

    let definition = chain("orders", 1).with_initial_step(5);
    assert!(matches!(validate(&definition), Err(DefinitionError::StepNotFound(5))));
}

#[tokio::test]
async fn test_definition_registry_versions() {
    let registry = DefinitionRegistry::new();
    registry.register(chain("orders", 1)).await.expect("v1");
    registry.register(chain("orders", 3)).await.expect("v3");

    let duplicate = registry.register(chain("orders", 1)).await;
    assert!(matches!(
        duplicate,
        Err(DefinitionError::AlreadyRegistered { version: 1, .. })
    ));

    assert_eq!(registry.get("orders", 1).await.map(|d| d.version), Some(1));
    assert!(registry.get("orders", 2).await.is_none());
    assert_eq!(registry.latest("orders").await.map(|d| d.version), Some(3));
    assert_eq!(
        registry.list().await,
        vec![("orders".to_string(), 1), ("orders".to_string(), 3)]
    );
}
