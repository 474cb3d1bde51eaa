//! Plan de ejecución: registro de stages y orden topológico.
//!
//! Las dependencias se derivan de las declaraciones: si el stage B consume el
//! artifact X y el stage A lo produce, existe la arista A -> B. Cada artifact
//! tiene a lo sumo un productor (single-writer) y el grafo debe ser acíclico;
//! ambas condiciones se verifican en `declare`, antes de ejecutar nada.

use std::collections::{BTreeSet, HashMap};

use indexmap::IndexMap;
use log::debug;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::json;

use crate::constants::ENGINE_VERSION;
use crate::errors::PlanError;
use crate::hashing::hash_value;
use crate::stage::Stage;

/// Registro de stages en orden de declaración.
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    stages: IndexMap<String, Stage>,
    producers: HashMap<String, String>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra un stage. Falla si el id ya existe, si otro stage ya produce
    /// alguno de sus outputs o si la declaración cierra un ciclo.
    pub fn declare(&mut self, stage: Stage) -> Result<&mut Self, PlanError> {
        let id = stage.id().to_string();
        if id.is_empty() {
            return Err(PlanError::EmptyStageId);
        }
        if self.stages.contains_key(&id) {
            return Err(PlanError::DuplicateStageId(id));
        }
        if stage.retry_policy().max_attempts == 0 {
            return Err(PlanError::InvalidRetryPolicy(id));
        }
        for artifact in stage.output_kinds().keys() {
            if let Some(first) = self.producers.get(artifact) {
                return Err(PlanError::DuplicateProducer { artifact: artifact.clone(),
                                                          first: first.clone(),
                                                          second: id });
            }
        }

        let mut producers = self.producers.clone();
        for artifact in stage.output_kinds().keys() {
            producers.insert(artifact.clone(), id.clone());
        }
        let mut stages = self.stages.clone();
        stages.insert(id.clone(), stage);
        if topological_order(&stages, &producers).is_err() {
            return Err(PlanError::CyclicDependency(id));
        }

        debug!("declare stage={id}");
        self.stages = stages;
        self.producers = producers;
        Ok(self)
    }

    /// Variante encadenable que consume el builder.
    pub fn stage(mut self, stage: Stage) -> Result<Self, PlanError> {
        self.declare(stage)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn build(self) -> Result<ExecutionPlan, PlanError> {
        let order = topological_order(&self.stages, &self.producers)?;
        let ordered: Vec<Stage> = order.into_iter()
                                       .filter_map(|i| self.stages.get_index(i).map(|(_, s)| s.clone()))
                                       .collect();

        let index_of: HashMap<&str, usize> = ordered.iter().enumerate().map(|(i, s)| (s.id(), i)).collect();
        let producers: HashMap<String, usize> =
            self.producers
                .iter()
                .filter_map(|(artifact, stage_id)| index_of.get(stage_id.as_str()).map(|i| (artifact.clone(), *i)))
                .collect();
        let upstream: Vec<BTreeSet<usize>> =
            ordered.iter()
                   .map(|s| s.input_names().iter().filter_map(|a| producers.get(a).copied()).collect())
                   .collect();

        let specs: Vec<_> = ordered.iter().map(Stage::spec).collect();
        let definition_hash = hash_value(&json!({
            "engine_version": ENGINE_VERSION,
            "stages": specs,
        }));

        Ok(ExecutionPlan { stages: ordered,
                           definition_hash,
                           producers,
                           upstream })
    }
}

/// Atajo: declara todos los stages en orden y construye el plan.
pub fn build_plan(stages: Vec<Stage>) -> Result<ExecutionPlan, PlanError> {
    let mut builder = PipelineBuilder::new();
    for stage in stages {
        builder.declare(stage)?;
    }
    builder.build()
}

/// Índices (orden de declaración) en orden topológico.
fn topological_order(stages: &IndexMap<String, Stage>,
                     producers: &HashMap<String, String>)
                     -> Result<Vec<usize>, PlanError> {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let nodes: Vec<NodeIndex> = (0..stages.len()).map(|i| graph.add_node(i)).collect();
    for (consumer, (_, stage)) in stages.iter().enumerate() {
        for input in stage.input_names() {
            if let Some(producer) = producers.get(input).and_then(|id| stages.get_index_of(id)) {
                graph.add_edge(nodes[producer], nodes[consumer], ());
            }
        }
    }
    toposort(&graph, None).map(|order| order.into_iter().map(|n| graph[n]).collect())
                          .map_err(|cycle| {
                              let idx = graph[cycle.node_id()];
                              let id = stages.get_index(idx).map(|(id, _)| id.clone()).unwrap_or_default();
                              PlanError::CyclicDependency(id)
                          })
}

/// Plan inmutable listo para ejecutar.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    stages: Vec<Stage>,
    definition_hash: String,
    producers: HashMap<String, usize>,
    upstream: Vec<BTreeSet<usize>>,
}

impl ExecutionPlan {
    /// Stages en orden topológico.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id() == id)
    }

    pub fn stage_ids(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.id().to_string()).collect()
    }

    pub fn definition_hash(&self) -> &str {
        &self.definition_hash
    }

    pub fn producer_of(&self, artifact: &str) -> Option<&Stage> {
        self.producers.get(artifact).map(|i| &self.stages[*i])
    }

    /// Índices de los stages de los que depende `index`.
    pub fn upstream_of(&self, index: usize) -> &BTreeSet<usize> {
        &self.upstream[index]
    }

    /// Inputs que ningún stage produce: deben existir en la store.
    pub fn external_inputs(&self) -> BTreeSet<String> {
        self.stages
            .iter()
            .flat_map(|s| s.input_names().iter())
            .filter(|a| !self.producers.contains_key(*a))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StageFailure;
    use crate::model::ArtifactKind;
    use crate::stage::{RetryPolicy, StageContext, StageOutputs};

    fn noop(_: &StageContext) -> Result<StageOutputs, StageFailure> {
        Ok(StageOutputs::new())
    }

    fn stage(id: &str, inputs: &[&str], outputs: &[&str]) -> Stage {
        outputs.iter().fold(Stage::new(id, noop).inputs(inputs.iter().copied()), |s, o| {
                          s.output(*o, ArtifactKind::Json)
                      })
    }

    #[test]
    fn orders_by_dependencies_not_declaration() {
        let plan = build_plan(vec![stage("report", &["clean"], &["summary"]),
                                   stage("fetch", &["issue"], &["raw"]),
                                   stage("transform", &["raw"], &["clean"])]).expect("plan");
        assert_eq!(plan.stage_ids(), vec!["fetch", "transform", "report"]);
        assert_eq!(plan.producer_of("clean").map(|s| s.id()), Some("transform"));
        assert_eq!(plan.external_inputs(), BTreeSet::from(["issue".to_string()]));
        assert_eq!(plan.upstream_of(2), &BTreeSet::from([1]));
    }

    #[test]
    fn rejects_cycle_at_declaration() {
        let mut b = PipelineBuilder::new();
        b.declare(stage("a", &["y"], &["x"])).expect("a");
        let err = b.declare(stage("b", &["x"], &["y"])).expect_err("cycle");
        assert_eq!(err, PlanError::CyclicDependency("b".into()));
        assert_eq!(b.len(), 1, "rejected stage is not registered");
    }

    #[test]
    fn rejects_self_loop() {
        let err = build_plan(vec![stage("loop", &["x"], &["x"])]).expect_err("self loop");
        assert_eq!(err, PlanError::CyclicDependency("loop".into()));
    }

    #[test]
    fn rejects_duplicates() {
        let err = build_plan(vec![stage("a", &[], &["x"]), stage("a", &[], &["y"])]).expect_err("dup id");
        assert_eq!(err, PlanError::DuplicateStageId("a".into()));
        let err = build_plan(vec![stage("a", &[], &["x"]), stage("b", &[], &["x"])]).expect_err("dup producer");
        assert_eq!(err,
                   PlanError::DuplicateProducer { artifact: "x".into(),
                                                  first: "a".into(),
                                                  second: "b".into() });
    }

    #[test]
    fn rejects_zero_attempts_and_empty_id() {
        let zero = stage("a", &[], &["x"]).retry(RetryPolicy { max_attempts: 0,
                                                               backoff: Default::default() });
        assert_eq!(build_plan(vec![zero]).expect_err("zero"), PlanError::InvalidRetryPolicy("a".into()));
        assert_eq!(build_plan(vec![stage("", &[], &[])]).expect_err("empty"), PlanError::EmptyStageId);
    }

    #[test]
    fn definition_hash_is_stable() {
        let mk = || build_plan(vec![stage("fetch", &[], &["raw"]), stage("transform", &["raw"], &["clean"])]);
        let a = mk().expect("a");
        let b = mk().expect("b");
        assert_eq!(a.definition_hash(), b.definition_hash());
        let c = build_plan(vec![stage("fetch", &[], &["raw"])]).expect("c");
        assert_ne!(a.definition_hash(), c.definition_hash());
    }
}
