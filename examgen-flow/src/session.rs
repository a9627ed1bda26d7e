use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

use crate::{error::Result, model::ModelDescriptor};

/// Lazy, finite, non-restartable sequence of generated text fragments.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// One content part of a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Part {
    Text(String),
    InlineData { mime_type: String, data: String },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text(text.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text(text) => Some(text),
            Part::InlineData { .. } => None,
        }
    }
}

/// One entry of the conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Turn {
    pub fn user(parts: Vec<Part>) -> Self {
        Self {
            role: Role::User,
            parts,
        }
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            parts: vec![Part::text(text)],
        }
    }

    /// Concatenation of the text parts.
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(Part::as_text).collect()
    }
}

/// Shared, append-only conversation history of one session.
///
/// Reads hand out a snapshot, so extracting history any number of times never
/// duplicates turns.
#[derive(Debug, Clone, Default)]
pub struct HistoryLog {
    turns: Arc<Mutex<Vec<Turn>>>,
}

impl HistoryLog {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self {
            turns: Arc::new(Mutex::new(turns)),
        }
    }

    pub fn snapshot(&self) -> Vec<Turn> {
        self.turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.turns.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a completed exchange.
    pub fn commit(&self, user: Turn, model: Turn) {
        let mut turns = self.turns.lock().unwrap_or_else(PoisonError::into_inner);
        turns.push(user);
        turns.push(model);
    }
}

/// Wraps a backend stream so the exchange lands in `log` once the stream ends cleanly.
///
/// A failed stream commits nothing and yields no further items after the error.
pub fn record_exchange(inner: FragmentStream, log: HistoryLog, user_turn: Turn) -> FragmentStream {
    struct Recorder {
        inner: FragmentStream,
        log: HistoryLog,
        user_turn: Option<Turn>,
        text: String,
        failed: bool,
    }

    let recorder = Recorder {
        inner,
        log,
        user_turn: Some(user_turn),
        text: String::new(),
        failed: false,
    };

    Box::pin(futures::stream::unfold(recorder, |mut rec| async move {
        if rec.failed {
            return None;
        }
        match rec.inner.next().await {
            Some(Ok(fragment)) => {
                rec.text.push_str(&fragment);
                Some((Ok(fragment), rec))
            }
            Some(Err(err)) => {
                rec.failed = true;
                Some((Err(err), rec))
            }
            None => {
                if let Some(user) = rec.user_turn.take() {
                    let reply = std::mem::take(&mut rec.text);
                    rec.log.commit(user, Turn::model_text(reply));
                }
                None
            }
        }
    }))
}

/// A stateful conversation with one model.
#[async_trait]
pub trait ChatSession: Send + Sync {
    fn model(&self) -> &ModelDescriptor;

    /// Fixed for the lifetime of the process.
    fn system_instruction(&self) -> &str;

    /// Full turn history so far.
    async fn history(&self) -> Result<Vec<Turn>>;

    /// Sends one user message and streams the reply. The exchange joins the history
    /// only if the stream completes without error.
    async fn send_message_stream(&mut self, parts: Vec<Part>) -> Result<FragmentStream>;
}

/// Opens chat sessions against a generation backend.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Opens a session on `model` seeded with `history`.
    async fn open_with_history(
        &self,
        api_key: &str,
        model: &ModelDescriptor,
        system_instruction: &str,
        history: Vec<Turn>,
    ) -> Result<Box<dyn ChatSession>>;

    async fn open(
        &self,
        api_key: &str,
        model: &ModelDescriptor,
        system_instruction: &str,
    ) -> Result<Box<dyn ChatSession>> {
        self.open_with_history(api_key, model, system_instruction, Vec::new())
            .await
    }

    /// Recreates `prior` on `new_model`, carrying over its history.
    ///
    /// A failed history extraction degrades to an empty history instead of failing.
    async fn reopen_with_history(
        &self,
        api_key: &str,
        new_model: &ModelDescriptor,
        prior: &dyn ChatSession,
    ) -> Result<Box<dyn ChatSession>> {
        let history = match prior.history().await {
            Ok(turns) => turns,
            Err(e) => {
                warn!(
                    from_model = %prior.model().id,
                    to_model = %new_model.id,
                    error = %e,
                    "Could not extract session history, continuing with an empty one"
                );
                Vec::new()
            }
        };
        self.open_with_history(api_key, new_model, prior.system_instruction(), history)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FlowError;
    use futures::stream;

    struct StubSession {
        model: ModelDescriptor,
        history: Option<HistoryLog>,
    }

    #[async_trait]
    impl ChatSession for StubSession {
        fn model(&self) -> &ModelDescriptor {
            &self.model
        }

        fn system_instruction(&self) -> &str {
            "be precise"
        }

        async fn history(&self) -> Result<Vec<Turn>> {
            self.history
                .as_ref()
                .map(HistoryLog::snapshot)
                .ok_or_else(|| FlowError::HistoryExtraction("history unavailable".into()))
        }

        async fn send_message_stream(&mut self, _parts: Vec<Part>) -> Result<FragmentStream> {
            Ok(Box::pin(stream::empty()))
        }
    }

    struct StubProvider;

    #[async_trait]
    impl SessionProvider for StubProvider {
        async fn open_with_history(
            &self,
            _api_key: &str,
            model: &ModelDescriptor,
            system_instruction: &str,
            history: Vec<Turn>,
        ) -> Result<Box<dyn ChatSession>> {
            assert_eq!(system_instruction, "be precise");
            Ok(Box::new(StubSession {
                model: model.clone(),
                history: Some(HistoryLog::new(history)),
            }))
        }
    }

    fn two_turns() -> Vec<Turn> {
        vec![
            Turn::user(vec![Part::text("step 1")]),
            Turn::model_text("variant 1"),
        ]
    }

    #[tokio::test]
    async fn recorder_commits_on_clean_end() {
        let log = HistoryLog::default();
        let inner: FragmentStream = Box::pin(stream::iter(vec![Ok("a".to_string()), Ok("b".into())]));
        let out: Vec<_> = record_exchange(inner, log.clone(), Turn::user(vec![Part::text("q")]))
            .collect()
            .await;

        assert_eq!(out.len(), 2);
        let turns = log.snapshot();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].text(), "ab");
    }

    #[tokio::test]
    async fn recorder_commits_nothing_on_error() {
        let log = HistoryLog::default();
        let inner: FragmentStream = Box::pin(stream::iter(vec![
            Ok("partial".to_string()),
            Err(FlowError::Transport("connection reset".into())),
            Ok("never".to_string()),
        ]));
        let out: Vec<_> = record_exchange(inner, log.clone(), Turn::user(vec![]))
            .collect()
            .await;

        assert_eq!(out.len(), 2);
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn reopen_preserves_every_turn() {
        let prior = StubSession {
            model: ModelDescriptor::from_id("a"),
            history: Some(HistoryLog::new(two_turns())),
        };
        let next = StubProvider
            .reopen_with_history("key", &ModelDescriptor::from_id("b"), &prior)
            .await
            .unwrap();

        assert_eq!(next.model().id, "b");
        assert_eq!(next.history().await.unwrap(), two_turns());
        // extracting again does not duplicate
        assert_eq!(next.history().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn reopen_degrades_to_empty_history() {
        let prior = StubSession {
            model: ModelDescriptor::from_id("a"),
            history: None,
        };
        let next = StubProvider
            .reopen_with_history("key", &ModelDescriptor::from_id("b"), &prior)
            .await
            .unwrap();

        assert!(next.history().await.unwrap().is_empty());
    }
}
