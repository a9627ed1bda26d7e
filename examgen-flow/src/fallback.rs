use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::{
    error::{ErrorKind, FlowError, Result},
    model::{ModelDescriptor, ModelPriority},
    session::{ChatSession, SessionProvider},
    step::StepAttempt,
};

/// Decides whether a failed attempt moves on to the next model.
pub trait RetryPolicy: Send + Sync + fmt::Debug {
    fn should_fall_back(&self, error: &FlowError) -> bool;
}

/// Every backend failure moves on to the next model, whatever its kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformRetry;

impl RetryPolicy for UniformRetry {
    fn should_fall_back(&self, error: &FlowError) -> bool {
        !matches!(error, FlowError::Cancelled)
    }
}

/// Stops on failures another model cannot fix: bad credentials and malformed requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct KindAwareRetry;

impl RetryPolicy for KindAwareRetry {
    fn should_fall_back(&self, error: &FlowError) -> bool {
        matches!(error.kind(), ErrorKind::Quota | ErrorKind::Transport)
    }
}

/// Configurable selector for the built-in policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryPolicyKind {
    #[default]
    Uniform,
    KindAware,
}

impl RetryPolicyKind {
    pub fn build(self) -> Arc<dyn RetryPolicy> {
        match self {
            RetryPolicyKind::Uniform => Arc::new(UniformRetry),
            RetryPolicyKind::KindAware => Arc::new(KindAwareRetry),
        }
    }
}

impl FromStr for RetryPolicyKind {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uniform" => Ok(RetryPolicyKind::Uniform),
            "kind-aware" | "kind_aware" => Ok(RetryPolicyKind::KindAware),
            other => Err(FlowError::Config(format!("unknown retry policy '{other}'"))),
        }
    }
}

/// Retries one step down the model priority list.
///
/// On failure the step's output is reset, the session is rebuilt on the next model
/// with the prior history, and the same step runs again. The active index moves only
/// when a model succeeds.
pub struct FallbackController<'a> {
    provider: &'a dyn SessionProvider,
    api_key: &'a str,
    models: &'a ModelPriority,
    policy: &'a dyn RetryPolicy,
}

impl<'a> FallbackController<'a> {
    pub fn new(
        provider: &'a dyn SessionProvider,
        api_key: &'a str,
        models: &'a ModelPriority,
        policy: &'a dyn RetryPolicy,
    ) -> Self {
        Self {
            provider,
            api_key,
            models,
            policy,
        }
    }

    /// Runs `attempt` starting at `*active_index`, which must match `session`'s model.
    pub async fn run_step<A>(
        &self,
        session: &mut Box<dyn ChatSession>,
        active_index: &mut usize,
        attempt: &mut A,
    ) -> Result<()>
    where
        A: StepAttempt + ?Sized,
    {
        let step = attempt.step();
        let mut index = *active_index;

        loop {
            let failure = match attempt.attempt(&mut **session).await {
                Ok(()) => {
                    if index != *active_index {
                        info!(
                            step = step.number(),
                            model = %session.model().id,
                            "Fallback model succeeded, keeping it for the remaining steps"
                        );
                    }
                    *active_index = index;
                    return Ok(());
                }
                Err(e) => e,
            };

            if matches!(failure, FlowError::Cancelled) {
                return Err(failure);
            }
            warn!(
                step = step.number(),
                model = %session.model().id,
                error = %failure,
                "Step attempt failed"
            );

            index = self.switch_model(session, index, attempt, failure).await?;
        }
    }

    /// Moves `session` to the first model after `index` that opens, returning its index.
    async fn switch_model<A>(
        &self,
        session: &mut Box<dyn ChatSession>,
        mut index: usize,
        attempt: &mut A,
        failure: FlowError,
    ) -> Result<usize>
    where
        A: StepAttempt + ?Sized,
    {
        let step = attempt.step();
        let mut last_error = failure;

        loop {
            if !self.policy.should_fall_back(&last_error) {
                info!(step = step.number(), error = %last_error, "Retry policy stopped the fallback");
                return Err(last_error);
            }
            let Some(next) = self.models.get(index + 1) else {
                error!(
                    step = step.number(),
                    attempts = index + 1,
                    "All models in the priority list failed"
                );
                return Err(last_error);
            };

            attempt.reset();
            index += 1;
            let from = session.model().clone();

            match self
                .provider
                .reopen_with_history(self.api_key, next, &**session)
                .await
            {
                Ok(reopened) => {
                    info!(
                        step = step.number(),
                        from = %from.id,
                        to = %next.id,
                        "Switched session to fallback model"
                    );
                    *session = reopened;
                    attempt.on_model_switch(&from, next);
                    return Ok(index);
                }
                Err(e) => {
                    warn!(model = %next.id, error = %e, "Could not open fallback session");
                    last_error = e;
                }
            }
        }
    }
}

/// Display names of the models tried for a step, for diagnostics.
pub fn describe_models(models: &[ModelDescriptor]) -> String {
    models
        .iter()
        .map(|m| m.display_name.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}
