use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    document::SourceDocument,
    error::{FlowError, Result},
    model::ModelDescriptor,
    step::Step,
};

const EVENT_CAPACITY: usize = 1024;

/// Top-level progress of the three-step workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowState {
    Idle,
    RunningStep(Step),
    Complete,
    Failed(String),
}

impl WorkflowState {
    pub fn is_running(&self) -> bool {
        matches!(self, WorkflowState::RunningStep(_))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowState::Complete | WorkflowState::Failed(_))
    }
}

/// Notifications for rendering collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowEvent {
    StateChanged(WorkflowState),
    Fragment { step: Step, text: String },
    /// The step's buffer was cleared before a retry.
    StepRestarted { step: Step },
    ModelSwitched { step: Step, from: String, to: String },
}

/// Point-in-time copy of the observable workflow state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowSnapshot {
    pub state: WorkflowState,
    pub buffers: [String; 3],
    pub error: Option<String>,
    pub active_model_index: usize,
    pub document_name: Option<String>,
    pub run_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
}

impl WorkflowSnapshot {
    pub fn buffer(&self, step: Step) -> &str {
        &self.buffers[step.index()]
    }
}

struct Inner {
    state: WorkflowState,
    buffers: [String; 3],
    error: Option<String>,
    active_model_index: usize,
    document: Option<SourceDocument>,
    run_id: Option<Uuid>,
    started_at: Option<DateTime<Utc>>,
    generation: u64,
    cancel: CancellationToken,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: WorkflowState::Idle,
            buffers: Default::default(),
            error: None,
            active_model_index: 0,
            document: None,
            run_id: None,
            started_at: None,
            generation: 0,
            cancel: CancellationToken::new(),
        }
    }
}

/// What a run needs from the shared state to get going.
#[derive(Debug, Clone)]
pub(crate) struct RunTicket {
    pub generation: u64,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub document: SourceDocument,
    pub cancel: CancellationToken,
}

/// Cloneable view of the workflow state, shared between the running workflow and its
/// observers.
///
/// Every write from a run carries that run's generation. `reset()` bumps the
/// generation, so anything an abandoned run tries to write afterwards is dropped.
#[derive(Clone)]
pub struct WorkflowHandle {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<WorkflowEvent>,
}

impl Default for WorkflowHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowHandle {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: WorkflowEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        let inner = self.lock();
        WorkflowSnapshot {
            state: inner.state.clone(),
            buffers: inner.buffers.clone(),
            error: inner.error.clone(),
            active_model_index: inner.active_model_index,
            document_name: inner.document.as_ref().map(|d| d.name.clone()),
            run_id: inner.run_id,
            started_at: inner.started_at,
        }
    }

    pub fn state(&self) -> WorkflowState {
        self.lock().state.clone()
    }

    /// Accepts the source document for the next run.
    pub fn select_document(&self, document: SourceDocument) -> Result<()> {
        let mut inner = self.lock();
        if inner.state.is_running() {
            return Err(FlowError::AlreadyRunning);
        }
        info!(document = %document.name, mime_type = %document.mime_type, "Document selected");
        inner.document = Some(document);
        Ok(())
    }

    /// Abandons any run in flight and returns to `Idle` with everything cleared.
    pub fn reset(&self) {
        {
            let mut inner = self.lock();
            inner.cancel.cancel();
            let generation = inner.generation + 1;
            *inner = Inner {
                generation,
                ..Inner::default()
            };
        }
        info!("Workflow reset");
        self.emit(WorkflowEvent::StateChanged(WorkflowState::Idle));
    }

    /// Claims the workflow for a new run; the caller announces step 1 via `enter_step`.
    pub(crate) fn begin_run(&self) -> Result<RunTicket> {
        let mut inner = self.lock();
        if inner.state.is_running() {
            return Err(FlowError::AlreadyRunning);
        }
        let document = inner
            .document
            .clone()
            .ok_or_else(|| FlowError::MissingInput("no document selected".to_string()))?;
        document.ensure_present()?;

        inner.generation += 1;
        inner.cancel = CancellationToken::new();
        inner.buffers = Default::default();
        inner.error = None;
        inner.active_model_index = 0;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        inner.run_id = Some(run_id);
        inner.started_at = Some(started_at);
        inner.state = WorkflowState::RunningStep(Step::One);

        Ok(RunTicket {
            generation: inner.generation,
            run_id,
            started_at,
            document,
            cancel: inner.cancel.clone(),
        })
    }

    /// Runs `f` on the state if `generation` is still the live run.
    fn with_run<T>(&self, generation: u64, f: impl FnOnce(&mut Inner) -> T) -> Result<T> {
        let mut inner = self.lock();
        if inner.generation != generation {
            return Err(FlowError::Cancelled);
        }
        Ok(f(&mut inner))
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    pub(crate) fn enter_step(&self, generation: u64, step: Step) -> Result<()> {
        self.with_run(generation, |inner| {
            inner.buffers[step.index()].clear();
            inner.state = WorkflowState::RunningStep(step);
        })?;
        debug!(step = step.number(), "Entered step");
        self.emit(WorkflowEvent::StateChanged(WorkflowState::RunningStep(step)));
        Ok(())
    }

    pub(crate) fn append(&self, generation: u64, step: Step, fragment: String) -> Result<()> {
        self.with_run(generation, |inner| {
            inner.buffers[step.index()].push_str(&fragment);
        })?;
        self.emit(WorkflowEvent::Fragment {
            step,
            text: fragment,
        });
        Ok(())
    }

    pub(crate) fn restart_step(&self, generation: u64, step: Step) {
        if self
            .with_run(generation, |inner| inner.buffers[step.index()].clear())
            .is_ok()
        {
            self.emit(WorkflowEvent::StepRestarted { step });
        }
    }

    pub(crate) fn model_switched(
        &self,
        generation: u64,
        step: Step,
        from: &ModelDescriptor,
        to: &ModelDescriptor,
    ) {
        if self.is_current(generation) {
            self.emit(WorkflowEvent::ModelSwitched {
                step,
                from: from.id.clone(),
                to: to.id.clone(),
            });
        }
    }

    /// Index only moves forward within a run.
    pub(crate) fn record_active_model(&self, generation: u64, index: usize) -> Result<()> {
        self.with_run(generation, |inner| {
            inner.active_model_index = inner.active_model_index.max(index);
        })
    }

    pub(crate) fn complete(&self, generation: u64) -> Result<()> {
        self.with_run(generation, |inner| inner.state = WorkflowState::Complete)?;
        self.emit(WorkflowEvent::StateChanged(WorkflowState::Complete));
        Ok(())
    }

    /// Terminal failure; the failed step's partial output is dropped.
    pub(crate) fn fail(&self, generation: u64, step: Step, error: &FlowError) {
        let message = error.to_string();
        let failed = self.with_run(generation, |inner| {
            inner.buffers[step.index()].clear();
            inner.error = Some(message.clone());
            inner.state = WorkflowState::Failed(message.clone());
        });
        if failed.is_ok() {
            self.emit(WorkflowEvent::StateChanged(WorkflowState::Failed(message)));
        }
    }

    pub(crate) fn buffers(&self) -> [String; 3] {
        self.lock().buffers.clone()
    }
}
