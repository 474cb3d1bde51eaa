use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use uuid::Uuid;

use super::RetryPolicy;
use crate::errors::StageFailure;
use crate::model::{Artifact, ArtifactKind, Payload};

/// Outputs devueltos por `execute`: nombre de artifact -> contenido.
pub type StageOutputs = BTreeMap<String, Payload>;

/// Lógica de un stage. Implementaciones deben:
/// - usar únicamente el contexto recibido (inputs ya resueltos);
/// - devolver todos los outputs declarados o un `StageFailure`;
/// - validar su propio esquema de salida (un output que no valida es
///   `StageFailure::Permanent`).
pub trait StageRunner: Send + Sync {
    fn execute(&self, ctx: &StageContext) -> Result<StageOutputs, StageFailure>;

    /// Parámetros deterministas del runner; entran al hash de definición.
    fn params(&self) -> Value {
        Value::Null
    }
}

impl<F> StageRunner for F where F: Fn(&StageContext) -> Result<StageOutputs, StageFailure> + Send + Sync
{
    fn execute(&self, ctx: &StageContext) -> Result<StageOutputs, StageFailure> {
        self(ctx)
    }
}

/// Input resuelto a una versión concreta.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedInput {
    pub artifact: Artifact,
    pub payload: Payload,
}

/// Contexto de ejecución entregado a `StageRunner::execute`. Es owned para
/// poder moverse a un hilo de trabajo cuando el stage tiene timeout.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub run_id: Uuid,
    pub stage_id: String,
    pub attempt_number: u32,
    pub inputs: BTreeMap<String, ResolvedInput>,
    pub outputs: BTreeMap<String, ArtifactKind>,
    /// Momento en que el motor da el intento por vencido. Los runners que
    /// lanzan trabajo externo deben cortarlo antes de este instante.
    pub deadline: Option<Instant>,
}

impl StageContext {
    /// Tiempo que queda hasta `deadline` (cero si ya pasó).
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_past_deadline(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn input(&self, name: &str) -> Result<&Payload, StageFailure> {
        self.inputs
            .get(name)
            .map(|r| &r.payload)
            .ok_or_else(|| StageFailure::permanent(format!("stage {} has no input {name}", self.stage_id)))
    }

    pub fn input_text(&self, name: &str) -> Result<&str, StageFailure> {
        self.input(name)?
            .as_text()
            .ok_or_else(|| StageFailure::permanent(format!("input {name} is not text")))
    }

    pub fn input_json(&self, name: &str) -> Result<&Value, StageFailure> {
        self.input(name)?
            .as_json()
            .ok_or_else(|| StageFailure::permanent(format!("input {name} is not json")))
    }
}

/// Declaración inmutable de un stage.
///
/// ```ignore
/// let stage = Stage::from_fn("transform", |ctx| { ... })
///     .input("raw")
///     .output("clean", ArtifactKind::Json)
///     .retry(RetryPolicy::new(3, Backoff::Linear { step_ms: 15 }));
/// ```
#[derive(Clone)]
pub struct Stage {
    id: String,
    inputs: BTreeSet<String>,
    outputs: BTreeMap<String, ArtifactKind>,
    retry_policy: RetryPolicy,
    idempotent: bool,
    timeout: Option<Duration>,
    runner: Arc<dyn StageRunner>,
}

impl Stage {
    /// Por defecto: un intento, idempotente, sin timeout.
    pub fn new(id: impl Into<String>, runner: impl StageRunner + 'static) -> Self {
        Self::with_runner(id, Arc::new(runner))
    }

    /// Igual que `new`, pero fija la firma del closure para que la inferencia
    /// de tipos no necesite anotaciones.
    pub fn from_fn<F>(id: impl Into<String>, f: F) -> Self
        where F: Fn(&StageContext) -> Result<StageOutputs, StageFailure> + Send + Sync + 'static
    {
        Self::with_runner(id, Arc::new(f))
    }

    pub fn with_runner(id: impl Into<String>, runner: Arc<dyn StageRunner>) -> Self {
        Self { id: id.into(),
               inputs: BTreeSet::new(),
               outputs: BTreeMap::new(),
               retry_policy: RetryPolicy::none(),
               idempotent: true,
               timeout: None,
               runner }
    }

    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.inputs.insert(name.into());
        self
    }

    pub fn inputs<I, S>(mut self, names: I) -> Self
        where I: IntoIterator<Item = S>,
              S: Into<String>
    {
        self.inputs.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn output(mut self, name: impl Into<String>, kind: ArtifactKind) -> Self {
        self.outputs.insert(name.into(), kind);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn input_names(&self) -> &BTreeSet<String> {
        &self.inputs
    }

    pub fn output_kinds(&self) -> &BTreeMap<String, ArtifactKind> {
        &self.outputs
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    pub fn timeout_limit(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn runner(&self) -> Arc<dyn StageRunner> {
        Arc::clone(&self.runner)
    }

    /// Forma canónica de la declaración (entra al hash de definición).
    pub fn spec(&self) -> Value {
        json!({
            "id": self.id,
            "inputs": self.inputs,
            "outputs": self.outputs,
            "retry": self.retry_policy,
            "idempotent": self.idempotent,
            "timeout_ms": self.timeout.map(|t| t.as_millis() as u64),
            "params": self.runner.params(),
        })
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
         .field("id", &self.id)
         .field("inputs", &self.inputs)
         .field("outputs", &self.outputs)
         .field("retry_policy", &self.retry_policy)
         .field("idempotent", &self.idempotent)
         .field("timeout", &self.timeout)
         .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::Backoff;

    fn noop(_: &StageContext) -> Result<StageOutputs, StageFailure> {
        Ok(StageOutputs::new())
    }

    #[test]
    fn builder_collects_declarations() {
        let stage = Stage::new("report", noop).inputs(["clean", "raw"])
                                              .output("summary", ArtifactKind::Report)
                                              .retry(RetryPolicy::new(2, Backoff::Fixed { delay_ms: 5 }))
                                              .idempotent(false)
                                              .timeout(Duration::from_secs(3));
        assert_eq!(stage.id(), "report");
        assert_eq!(stage.input_names().len(), 2);
        assert_eq!(stage.output_kinds().get("summary"), Some(&ArtifactKind::Report));
        assert_eq!(stage.retry_policy().max_attempts, 2);
        assert!(!stage.is_idempotent());
        assert_eq!(stage.spec()["timeout_ms"], json!(3000));
    }

    #[test]
    fn spec_changes_with_declaration() {
        let a = Stage::new("s", noop).output("x", ArtifactKind::Json);
        let b = Stage::new("s", noop).output("x", ArtifactKind::Document);
        assert_ne!(a.spec(), b.spec());
    }

    #[test]
    fn missing_input_is_permanent() {
        let ctx = StageContext { run_id: Uuid::new_v4(),
                                 stage_id: "s".into(),
                                 attempt_number: 1,
                                 inputs: BTreeMap::new(),
                                 outputs: BTreeMap::new(),
                                 deadline: None };
        assert!(matches!(ctx.input("raw"), Err(StageFailure::Permanent(_))));
        assert_eq!(ctx.remaining(), None);
    }

    #[test]
    fn remaining_time_saturates_at_zero() {
        let ctx = StageContext { run_id: Uuid::new_v4(),
                                 stage_id: "s".into(),
                                 attempt_number: 1,
                                 inputs: BTreeMap::new(),
                                 outputs: BTreeMap::new(),
                                 deadline: Some(Instant::now()) };
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
        assert!(ctx.is_past_deadline());
    }
}
