pub mod answer_key;
pub mod config;
pub mod document;
pub mod error;
pub mod executor;
pub mod export;
pub mod fallback;
#[cfg(feature = "gemini")]
pub mod gemini;
pub mod model;
pub mod orchestrator;
pub mod prompts;
pub mod scripted;
pub mod session;
pub mod state;
pub mod step;

// Re-export commonly used types
pub use answer_key::{AnswerEntry, AnswerKey};
pub use config::Settings;
pub use document::{SourceDocument, mime_from_extension};
pub use error::{ErrorKind, FlowError, Result};
pub use executor::{StepExecutor, forward_fragments};
pub use fallback::{
    FallbackController, KindAwareRetry, RetryPolicy, RetryPolicyKind, UniformRetry,
};
#[cfg(feature = "gemini")]
pub use gemini::GeminiProvider;
pub use model::{ModelDescriptor, ModelPriority, default_models};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, RunReport};
pub use session::{ChatSession, FragmentStream, Part, Role, SessionProvider, Turn};
pub use state::{WorkflowEvent, WorkflowHandle, WorkflowSnapshot, WorkflowState};
pub use step::{Step, StepAttempt};
