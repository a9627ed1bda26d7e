//! Orchestrator: runs the three generation steps in order over one chat session.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use examgen_flow::{OrchestratorBuilder, SourceDocument, scripted::ScriptedProvider};
//! # async fn demo() -> examgen_flow::Result<()> {
//! let orchestrator = OrchestratorBuilder::new(Arc::new(ScriptedProvider::new())).build();
//! orchestrator.select_document(SourceDocument::from_bytes("exam.pdf", "application/pdf", b"%PDF"))?;
//!
//! let mut events = orchestrator.handle().subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//! });
//!
//! let report = orchestrator.run("api-key").await?;
//! println!("{}", report.compose());
//! # Ok(())
//! # }
//! ```
//!
//! Each step streams into its own buffer on the [`WorkflowHandle`]. A failed step is
//! retried down the model priority list by [`FallbackController`]; once a fallback model
//! succeeds it stays active for the remaining steps. Observers may call
//! [`WorkflowHandle::reset`] at any time, which abandons the run in flight.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span};
use uuid::Uuid;

use crate::{
    answer_key::{self, AnswerKey},
    document::SourceDocument,
    error::{FlowError, Result},
    executor::{StepExecutor, forward_fragments},
    export,
    fallback::{FallbackController, RetryPolicy, UniformRetry, describe_models},
    model::{ModelDescriptor, ModelPriority},
    prompts::SYSTEM_INSTRUCTION,
    session::{ChatSession, SessionProvider},
    state::{RunTicket, WorkflowHandle, WorkflowSnapshot},
    step::{Step, StepAttempt},
};

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub buffers: [String; 3],
    pub final_model: ModelDescriptor,
    pub active_model_index: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn buffer(&self, step: Step) -> &str {
        &self.buffers[step.index()]
    }

    /// All three variants as one export document.
    pub fn compose(&self) -> String {
        export::compose(&self.buffers)
    }

    pub fn answer_key(&self, step: Step) -> AnswerKey {
        answer_key::parse(self.buffer(step))
    }
}

/// Streams one step into the shared buffer of the run identified by `generation`.
struct BufferedStep<'a> {
    step: Step,
    generation: u64,
    handle: &'a WorkflowHandle,
    document: &'a SourceDocument,
    cancel: &'a CancellationToken,
    executor: StepExecutor,
}

#[async_trait]
impl<'a> StepAttempt for BufferedStep<'a> {
    fn step(&self) -> Step {
        self.step
    }

    async fn attempt(&mut self, session: &mut dyn ChatSession) -> Result<()> {
        // no new request once the run has been abandoned
        if self.cancel.is_cancelled() {
            return Err(FlowError::Cancelled);
        }
        let stream = self
            .executor
            .run(session, self.step, Some(self.document))
            .await?;
        let (handle, generation, step) = (self.handle, self.generation, self.step);
        forward_fragments(stream, self.cancel, |fragment| {
            handle.append(generation, step, fragment)
        })
        .await?;
        Ok(())
    }

    fn reset(&mut self) {
        self.handle.restart_step(self.generation, self.step);
    }

    fn on_model_switch(&mut self, from: &ModelDescriptor, to: &ModelDescriptor) {
        self.handle
            .model_switched(self.generation, self.step, from, to);
    }
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    provider: Arc<dyn SessionProvider>,
    models: ModelPriority,
    preferred: Option<String>,
    policy: Arc<dyn RetryPolicy>,
    system_instruction: String,
    handle: WorkflowHandle,
}

impl OrchestratorBuilder {
    pub fn new(provider: Arc<dyn SessionProvider>) -> Self {
        Self {
            provider,
            models: ModelPriority::default(),
            preferred: None,
            policy: Arc::new(UniformRetry),
            system_instruction: SYSTEM_INSTRUCTION.to_string(),
            handle: WorkflowHandle::new(),
        }
    }

    pub fn models(mut self, models: ModelPriority) -> Self {
        self.models = models;
        self
    }

    /// Model to try first; the rest of the priority list keeps its order.
    pub fn preferred_model(mut self, id: impl Into<String>) -> Self {
        self.preferred = Some(id.into());
        self
    }

    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = instruction.into();
        self
    }

    /// Shares an existing handle instead of creating a fresh one.
    pub fn handle(mut self, handle: WorkflowHandle) -> Self {
        self.handle = handle;
        self
    }

    pub fn build(self) -> Orchestrator {
        let models = match &self.preferred {
            Some(id) => self.models.with_preferred(id),
            None => self.models,
        };
        Orchestrator {
            provider: self.provider,
            models,
            policy: self.policy,
            executor: StepExecutor::new(),
            system_instruction: self.system_instruction,
            handle: self.handle,
        }
    }
}

/// Drives the workflow. Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Orchestrator {
    provider: Arc<dyn SessionProvider>,
    models: ModelPriority,
    policy: Arc<dyn RetryPolicy>,
    executor: StepExecutor,
    system_instruction: String,
    handle: WorkflowHandle,
}

impl Orchestrator {
    pub fn handle(&self) -> &WorkflowHandle {
        &self.handle
    }

    pub fn models(&self) -> &ModelPriority {
        &self.models
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        self.handle.snapshot()
    }

    pub fn select_document(&self, document: SourceDocument) -> Result<()> {
        self.handle.select_document(document)
    }

    pub fn reset(&self) {
        self.handle.reset();
    }

    /// Runs steps 1 to 3 against the selected document.
    ///
    /// Returns `FlowError::Cancelled` if the run was reset while in flight. Any other
    /// error has already moved the workflow to `Failed` with its message.
    pub async fn run(&self, api_key: &str) -> Result<RunReport> {
        if api_key.trim().is_empty() {
            return Err(FlowError::MissingInput(
                "no API key configured".to_string(),
            ));
        }
        let ticket = self.handle.begin_run()?;
        let span = info_span!("workflow_run", run_id = %ticket.run_id);
        self.drive(api_key, ticket).instrument(span).await
    }

    async fn drive(&self, api_key: &str, ticket: RunTicket) -> Result<RunReport> {
        let generation = ticket.generation;
        info!(
            document = %ticket.document.name,
            models = %describe_models(self.models.models()),
            "Starting exam generation"
        );
        self.handle.enter_step(generation, Step::One)?;

        let first = self.models.get(0).ok_or(FlowError::NoModels)?;
        let mut session = match self
            .provider
            .open(api_key, first, &self.system_instruction)
            .await
        {
            Ok(session) => session,
            Err(e) => return Err(self.abort(generation, Step::One, e)),
        };

        let controller =
            FallbackController::new(&*self.provider, api_key, &self.models, &*self.policy);
        let mut active_index = 0;

        for step in Step::ALL {
            if step != Step::One {
                self.handle.enter_step(generation, step)?;
            }
            let mut attempt = BufferedStep {
                step,
                generation,
                handle: &self.handle,
                document: &ticket.document,
                cancel: &ticket.cancel,
                executor: self.executor,
            };
            if let Err(e) = controller
                .run_step(&mut session, &mut active_index, &mut attempt)
                .await
            {
                return Err(self.abort(generation, step, e));
            }
            self.handle.record_active_model(generation, active_index)?;
            info!(step = step.number(), model = %session.model().id, "Step complete");
        }

        self.handle.complete(generation)?;
        let finished_at = Utc::now();
        info!(
            elapsed_ms = (finished_at - ticket.started_at).num_milliseconds(),
            "Exam generation complete"
        );

        Ok(RunReport {
            run_id: ticket.run_id,
            buffers: self.handle.buffers(),
            final_model: session.model().clone(),
            active_model_index: active_index,
            started_at: ticket.started_at,
            finished_at,
        })
    }

    /// Settles a failed step. A reset run reports `Cancelled` and leaves the state alone.
    fn abort(&self, generation: u64, step: Step, err: FlowError) -> FlowError {
        if matches!(err, FlowError::Cancelled) || !self.handle.is_current(generation) {
            info!(step = step.number(), "Run abandoned");
            return FlowError::Cancelled;
        }
        error!(step = step.number(), error = %err, "Exam generation failed");
        self.handle.fail(generation, step, &err);
        err
    }
}
