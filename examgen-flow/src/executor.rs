use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    document::SourceDocument,
    error::{FlowError, Result},
    prompts,
    session::{ChatSession, FragmentStream, Part},
    step::Step,
};

/// Issues the generation request of one step.
///
/// Errors from the session are handed back untouched; the executor never looks at
/// their kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepExecutor;

impl StepExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Step 1: the source document plus the first-variant instruction.
    pub async fn run_step1(
        &self,
        session: &mut dyn ChatSession,
        document: &SourceDocument,
    ) -> Result<FragmentStream> {
        document.ensure_present()?;
        info!(
            model = %session.model().id,
            document = %document.name,
            mime_type = %document.mime_type,
            "Sending step 1 request with source document"
        );

        let parts = vec![
            Part::InlineData {
                mime_type: document.mime_type.clone(),
                data: document.data.clone(),
            },
            Part::text(prompts::first_step_prompt()),
        ];
        session.send_message_stream(parts).await
    }

    /// Steps 2 and 3: text-only continuation relying on the session history.
    pub async fn run_step_n(
        &self,
        session: &mut dyn ChatSession,
        step: Step,
    ) -> Result<FragmentStream> {
        if step == Step::One {
            return Err(FlowError::InvalidStep(step.number()));
        }
        info!(model = %session.model().id, step = step.number(), "Sending continuation request");
        session
            .send_message_stream(vec![Part::text(prompts::next_step_prompt(step))])
            .await
    }

    /// Dispatches to the right request for `step`.
    pub async fn run(
        &self,
        session: &mut dyn ChatSession,
        step: Step,
        document: Option<&SourceDocument>,
    ) -> Result<FragmentStream> {
        match step {
            Step::One => {
                let document = document.ok_or_else(|| {
                    FlowError::MissingInput("step 1 requires the source document".to_string())
                })?;
                self.run_step1(session, document).await
            }
            _ => self.run_step_n(session, step).await,
        }
    }
}

/// Feeds every non-empty fragment of `stream` to `sink`, in arrival order.
///
/// Cancellation is checked before each fragment. Returns the number of fragments
/// delivered; a stream error ends delivery and is returned as-is.
pub async fn forward_fragments<F>(
    mut stream: FragmentStream,
    cancel: &CancellationToken,
    mut sink: F,
) -> Result<usize>
where
    F: FnMut(String) -> Result<()> + Send,
{
    let mut delivered = 0usize;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FlowError::Cancelled),
            item = stream.next() => item,
        };

        match next {
            None => break,
            Some(Err(e)) => return Err(e),
            Some(Ok(fragment)) => {
                if fragment.is_empty() {
                    continue;
                }
                sink(fragment)?;
                delivered += 1;
            }
        }
    }
    debug!(fragments = delivered, "Stream finished");
    Ok(delivered)
}
