use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use sagacore::{DefinitionError, StepId, WorkflowDefinition};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Outcome,
    Child,
    Compensation,
}

/// Append-only store of validated definitions keyed by `(id, version)`.
pub struct DefinitionRegistry {
    definitions: RwLock<HashMap<String, BTreeMap<u32, Arc<WorkflowDefinition>>>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self {
            definitions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<Arc<WorkflowDefinition>, DefinitionError> {
        validate(&definition)?;

        let mut definitions = self.definitions.write().await;
        let versions = definitions.entry(definition.id.clone()).or_default();
        if versions.contains_key(&definition.version) {
            return Err(DefinitionError::AlreadyRegistered {
                id: definition.id.clone(),
                version: definition.version,
            });
        }

        tracing::info!(
            workflow = %definition.id,
            version = definition.version,
            steps = definition.steps.len(),
            "Registered workflow definition"
        );
        let definition = Arc::new(definition);
        versions.insert(definition.version, definition.clone());
        Ok(definition)
    }

    pub async fn get(&self, id: &str, version: u32) -> Option<Arc<WorkflowDefinition>> {
        let definitions = self.definitions.read().await;
        definitions.get(id).and_then(|v| v.get(&version)).cloned()
    }

    pub async fn latest(&self, id: &str) -> Option<Arc<WorkflowDefinition>> {
        let definitions = self.definitions.read().await;
        definitions
            .get(id)
            .and_then(|v| v.values().next_back())
            .cloned()
    }

    /// All registered `(id, version)` pairs, sorted.
    pub async fn list(&self) -> Vec<(String, u32)> {
        let definitions = self.definitions.read().await;
        let mut all: Vec<(String, u32)> = definitions
            .iter()
            .flat_map(|(id, versions)| versions.keys().map(move |v| (id.clone(), *v)))
            .collect();
        all.sort();
        all
    }
}

impl Default for DefinitionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Check structural invariants: unique step ids and every link resolving to a step.
pub fn validate(definition: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if definition.steps.is_empty() {
        return Err(DefinitionError::Invalid(format!(
            "workflow {} has no steps",
            definition.id
        )));
    }

    let mut seen = HashSet::new();
    for step in &definition.steps {
        if !seen.insert(step.id) {
            return Err(DefinitionError::Invalid(format!(
                "duplicate step id {}",
                step.id
            )));
        }
    }

    if !seen.contains(&definition.initial_step) {
        return Err(DefinitionError::StepNotFound(definition.initial_step));
    }

    let graph = build_graph(definition)?;

    let mut reachable = HashSet::new();
    let mut dfs = Dfs::new(&graph.graph, graph.index[&definition.initial_step]);
    while let Some(idx) = dfs.next(&graph.graph) {
        reachable.insert(graph.graph[idx]);
    }
    for step in &definition.steps {
        if !reachable.contains(&step.id) {
            tracing::warn!(
                workflow = %definition.id,
                step = step.id,
                "Step is not reachable from the initial step"
            );
        }
    }

    Ok(())
}

struct StepGraph {
    graph: DiGraph<StepId, Link>,
    index: HashMap<StepId, NodeIndex>,
}

fn build_graph(definition: &WorkflowDefinition) -> Result<StepGraph, DefinitionError> {
    let mut graph = DiGraph::new();
    let mut index = HashMap::new();

    for step in &definition.steps {
        index.insert(step.id, graph.add_node(step.id));
    }

    for step in &definition.steps {
        let from = index[&step.id];
        let links = step
            .outcomes
            .iter()
            .map(|o| (o.next_step, Link::Outcome))
            .chain(step.children.iter().map(|c| (*c, Link::Child)))
            .chain(step.compensation_step_id.map(|c| (c, Link::Compensation)));

        for (target, link) in links {
            let to = index.get(&target).ok_or_else(|| {
                DefinitionError::Invalid(format!(
                    "step {} has a {:?} link to unknown step {}",
                    step.id, link, target
                ))
            })?;
            graph.add_edge(from, *to, link);
        }
    }

    Ok(StepGraph { graph, index })
}
