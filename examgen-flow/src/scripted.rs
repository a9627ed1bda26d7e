//! In-memory `SessionProvider` that replays scripted replies per model.
//!
//! Used for offline rehearsal runs and as the backend in tests. Every scripted
//! stream yields to the scheduler between fragments, like a network stream would.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{
    error::{FlowError, Result},
    model::ModelDescriptor,
    session::{
        ChatSession, FragmentStream, HistoryLog, Part, SessionProvider, Turn, record_exchange,
    },
};

/// What a model answers to the next message it receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Fragments(Vec<String>),
    /// Fails before producing anything.
    Fail(FlowError),
    /// Streams some fragments, then fails.
    FailAfter(Vec<String>, FlowError),
}

impl Reply {
    /// Streams `text` one line at a time.
    pub fn text(text: &str) -> Self {
        Reply::Fragments(text.split_inclusive('\n').map(str::to_string).collect())
    }
}

/// One message received by a scripted session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedCall {
    pub model: String,
    pub history_len: usize,
    pub parts: Vec<Part>,
}

impl ScriptedCall {
    pub fn has_inline_data(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, Part::InlineData { .. }))
    }
}

#[derive(Default)]
struct Script {
    replies: HashMap<String, VecDeque<Reply>>,
    fail_open: HashMap<String, FlowError>,
    unreadable_history: bool,
    calls: Vec<ScriptedCall>,
    opened: Vec<(String, usize)>,
}

#[derive(Clone, Default)]
pub struct ScriptedProvider {
    script: Arc<Mutex<Script>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `reply` for the next unanswered message sent to `model`.
    /// Models without queued replies answer with a canned exam variant.
    pub fn reply(self, model: &str, reply: Reply) -> Self {
        self.lock()
            .replies
            .entry(model.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// Opening a session on `model` fails with `err`.
    pub fn fail_open(self, model: &str, err: FlowError) -> Self {
        self.lock().fail_open.insert(model.to_string(), err);
        self
    }

    /// Sessions fail to report their history.
    pub fn unreadable_history(self) -> Self {
        self.lock().unreadable_history = true;
        self
    }

    /// Messages received so far, in order.
    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.lock().calls.clone()
    }

    /// Sessions opened so far as `(model, seeded history length)`.
    pub fn opened(&self) -> Vec<(String, usize)> {
        self.lock().opened.clone()
    }

    fn next_reply(&self, call: ScriptedCall) -> Reply {
        let mut script = self.lock();
        let exchange = call.history_len / 2 + 1;
        let reply = script
            .replies
            .get_mut(&call.model)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Reply::text(&canned_variant(exchange)));
        script.calls.push(call);
        reply
    }
}

#[async_trait]
impl SessionProvider for ScriptedProvider {
    async fn open_with_history(
        &self,
        _api_key: &str,
        model: &ModelDescriptor,
        system_instruction: &str,
        history: Vec<Turn>,
    ) -> Result<Box<dyn ChatSession>> {
        let unreadable_history = {
            let mut script = self.lock();
            if let Some(err) = script.fail_open.get(&model.id) {
                return Err(err.clone());
            }
            script.opened.push((model.id.clone(), history.len()));
            script.unreadable_history
        };

        Ok(Box::new(ScriptedSession {
            model: model.clone(),
            system_instruction: system_instruction.to_string(),
            history: HistoryLog::new(history),
            unreadable_history,
            provider: self.clone(),
        }))
    }
}

struct ScriptedSession {
    model: ModelDescriptor,
    system_instruction: String,
    history: HistoryLog,
    unreadable_history: bool,
    provider: ScriptedProvider,
}

#[async_trait]
impl ChatSession for ScriptedSession {
    fn model(&self) -> &ModelDescriptor {
        &self.model
    }

    fn system_instruction(&self) -> &str {
        &self.system_instruction
    }

    async fn history(&self) -> Result<Vec<Turn>> {
        if self.unreadable_history {
            return Err(FlowError::HistoryExtraction(format!(
                "history of {} is unavailable",
                self.model.id
            )));
        }
        Ok(self.history.snapshot())
    }

    async fn send_message_stream(&mut self, parts: Vec<Part>) -> Result<FragmentStream> {
        let call = ScriptedCall {
            model: self.model.id.clone(),
            history_len: self.history.len(),
            parts: parts.clone(),
        };

        let items: Vec<Result<String>> = match self.provider.next_reply(call) {
            Reply::Fail(err) => return Err(err),
            Reply::Fragments(fragments) => fragments.into_iter().map(Ok).collect(),
            Reply::FailAfter(fragments, err) => fragments
                .into_iter()
                .map(Ok)
                .chain(std::iter::once(Err(err)))
                .collect(),
        };

        let paced = futures::stream::iter(items).then(|item| async move {
            tokio::task::yield_now().await;
            item
        });
        Ok(record_exchange(
            Box::pin(paced),
            self.history.clone(),
            Turn::user(parts),
        ))
    }
}

/// Small deterministic exam with its answer key.
pub fn canned_variant(number: usize) -> String {
    format!(
        "## EXAM NO. {number}\n\
         \n\
         **Question 1.** Solve $2x + {a} = 0$.\n\
         A. $x = -{half}$ B. $x = {half}$ C. $x = {a}$ D. $x = 0$\n\
         \n\
         **Question 2.** Compute $\\int_0^1 {b}x\\,dx$.\n\
         A. ${b}$ B. $\\frac{{{b}}}{{2}}$ C. $0$ D. $1$\n\
         \n\
         ## ANSWER KEY FOR EXAM NO. {number}\n\
         \n\
         1.A\n\
         2.B: $\\int_0^1 {b}x\\,dx = \\frac{{{b}}}{{2}}$\n",
        a = 2 * number,
        half = number,
        b = number + 1,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::answer_key;

    #[tokio::test]
    async fn unscripted_models_answer_with_canned_variant() {
        let provider = ScriptedProvider::new();
        let mut session = provider
            .open("key", &ModelDescriptor::from_id("m"), "sys")
            .await
            .unwrap();

        let text: String = session
            .send_message_stream(vec![Part::text("STEP 1")])
            .await
            .unwrap()
            .map(|f| f.unwrap())
            .collect()
            .await;

        assert!(text.starts_with("## EXAM NO. 1"));
        assert_eq!(answer_key::parse(&text).len(), 2);
        assert_eq!(session.history().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn scripted_failure_skips_history() {
        let provider = ScriptedProvider::new().reply(
            "m",
            Reply::FailAfter(vec!["half".into()], FlowError::Transport("reset".into())),
        );
        let mut session = provider
            .open("key", &ModelDescriptor::from_id("m"), "sys")
            .await
            .unwrap();

        let items: Vec<_> = session
            .send_message_stream(vec![Part::text("STEP 1")])
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(items.len(), 2);
        assert!(session.history().await.unwrap().is_empty());
        assert_eq!(provider.calls().len(), 1);
    }
}
