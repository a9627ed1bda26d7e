use std::sync::Arc;

use examgen_flow::{
    FlowError, ModelDescriptor, ModelPriority, OrchestratorBuilder, SourceDocument, Step,
    WorkflowEvent, WorkflowState, answer_key,
    orchestrator::Orchestrator,
    scripted::{Reply, ScriptedProvider},
};
use tokio::sync::broadcast::{Receiver, error::TryRecvError};

fn models() -> ModelPriority {
    ModelPriority::new(vec![
        ModelDescriptor::from_id("m1"),
        ModelDescriptor::from_id("m2"),
        ModelDescriptor::from_id("m3"),
    ])
    .unwrap()
}

fn orchestrator(provider: &ScriptedProvider) -> Orchestrator {
    let orchestrator = OrchestratorBuilder::new(Arc::new(provider.clone()))
        .models(models())
        .build();
    orchestrator
        .select_document(SourceDocument::from_bytes(
            "midterm.pdf",
            "application/pdf",
            b"%PDF-1.7 forty questions",
        ))
        .unwrap();
    orchestrator
}

fn drain(rx: &mut Receiver<WorkflowEvent>) -> Vec<WorkflowEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Empty | TryRecvError::Closed) => return events,
            Err(TryRecvError::Lagged(n)) => panic!("lost {n} events"),
        }
    }
}

/// Which step each recorded call belongs to, judged by its prompt.
fn called_steps(provider: &ScriptedProvider) -> Vec<(String, u8)> {
    provider
        .calls()
        .into_iter()
        .map(|call| {
            let prompt: String = call.parts.iter().filter_map(|p| p.as_text()).collect();
            let step = (1..=3)
                .find(|n| prompt.starts_with(&format!("BƯỚC {n}:")))
                .unwrap_or(0);
            (call.model, step)
        })
        .collect()
}

fn forty_question_variant() -> String {
    let mut text = String::from("## EXAM NO. 1\n\n");
    for n in 1..=40 {
        text.push_str(&format!(
            "**Question {n}.** Evaluate ${n} + x$ at $x = 1$.\nA. ${}$ B. ${}$ C. $0$ D. $1$\n\n",
            n + 1,
            n
        ));
    }
    text.push_str("## ANSWER KEY FOR EXAM NO. 1\n\n");
    for row in 0..4 {
        let line: Vec<String> = (1..=10).map(|i| format!("{}.A", row * 10 + i)).collect();
        text.push_str(&line.join(" "));
        text.push('\n');
    }
    text.push_str("\nQuestion 40: $40 + 1 = 41$, so the answer is A.\n");
    text
}

#[tokio::test]
async fn first_variant_keeps_every_question() {
    let provider = ScriptedProvider::new().reply("m1", Reply::text(&forty_question_variant()));
    let orchestrator = orchestrator(&provider);

    let report = orchestrator.run("key").await.unwrap();

    let key = answer_key::parse(report.buffer(Step::One));
    assert_eq!(key.len(), 40);
    assert_eq!(key.numbers(), (1..=40).collect::<Vec<u32>>());
}

#[tokio::test]
async fn quota_failure_on_step_two_moves_to_next_model() {
    let provider = ScriptedProvider::new()
        .reply("m1", Reply::text("## EXAM NO. 1\nfirst\n"))
        .reply("m1", Reply::Fail(FlowError::Quota("quota exceeded".into())));
    let orchestrator = orchestrator(&provider);

    let report = orchestrator.run("key").await.unwrap();

    assert_eq!(orchestrator.snapshot().state, WorkflowState::Complete);
    assert_eq!(report.active_model_index, 1);
    assert_eq!(report.final_model.id, "m2");
    assert_eq!(report.buffer(Step::One), "## EXAM NO. 1\nfirst\n");
    assert!(report.buffer(Step::Two).starts_with("## EXAM NO. 2"));
    assert_eq!(
        called_steps(&provider),
        vec![
            ("m1".to_string(), 1),
            ("m1".to_string(), 2),
            ("m2".to_string(), 2),
            ("m2".to_string(), 3),
        ]
    );
    // the fallback session starts from the first exchange
    assert_eq!(provider.opened(), vec![("m1".to_string(), 0), ("m2".to_string(), 2)]);
}

#[tokio::test]
async fn every_model_failing_on_step_one_fails_the_run() {
    let provider = ScriptedProvider::new()
        .reply("m1", Reply::FailAfter(vec!["## EXAM".into()], FlowError::Transport("socket closed".into())))
        .reply("m2", Reply::Fail(FlowError::Quota("m2 quota".into())))
        .reply(
            "m3",
            Reply::Fail(FlowError::Quota(
                "[429 Too Many Requests] You exceeded your current quota, please check your plan and billing details.".into(),
            )),
        );
    let orchestrator = orchestrator(&provider);

    let err = orchestrator.run("key").await.unwrap_err();

    let message = "[429 Too Many Requests] You exceeded your current quota, please check your plan and billing details.";
    assert_eq!(err.to_string(), message);
    let snapshot = orchestrator.snapshot();
    assert_eq!(snapshot.state, WorkflowState::Failed(message.to_string()));
    assert_eq!(snapshot.error.as_deref(), Some(message));
    assert_eq!(snapshot.buffers, <[String; 3]>::default());
    assert!(called_steps(&provider).iter().all(|(_, step)| *step == 1));
}

#[tokio::test]
async fn exhausted_models_stop_before_later_steps() {
    let provider = ScriptedProvider::new()
        .reply("m1", Reply::text("variant one\n"))
        .reply("m1", Reply::Fail(FlowError::Quota("q1".into())))
        .reply("m2", Reply::Fail(FlowError::Quota("q2".into())))
        .reply("m3", Reply::Fail(FlowError::Transport("q3".into())));
    let orchestrator = orchestrator(&provider);

    let err = orchestrator.run("key").await.unwrap_err();

    assert_eq!(err, FlowError::Transport("q3".into()));
    let snapshot = orchestrator.snapshot();
    assert_eq!(snapshot.buffer(Step::One), "variant one\n");
    assert_eq!(snapshot.buffer(Step::Two), "");
    assert_eq!(snapshot.buffer(Step::Three), "");
    assert!(called_steps(&provider).iter().all(|(_, step)| *step != 3));
}

#[tokio::test]
async fn partial_output_of_a_failed_model_is_not_kept() {
    let provider = ScriptedProvider::new()
        .reply("m1", Reply::text("variant one\n"))
        .reply(
            "m1",
            Reply::FailAfter(
                vec!["BROKEN-PREFIX ".into(), "more ".into()],
                FlowError::Transport("stream reset".into()),
            ),
        )
        .reply("m2", Reply::text("variant two\n"));
    let orchestrator = orchestrator(&provider);
    let mut rx = orchestrator.handle().subscribe();

    let report = orchestrator.run("key").await.unwrap();

    assert_eq!(report.buffer(Step::Two), "variant two\n");
    let events = drain(&mut rx);
    assert!(events.contains(&WorkflowEvent::StepRestarted { step: Step::Two }));
    assert!(events.contains(&WorkflowEvent::ModelSwitched {
        step: Step::Two,
        from: "m1".into(),
        to: "m2".into(),
    }));
}

#[tokio::test]
async fn buffers_only_fill_while_their_step_runs() {
    let provider = ScriptedProvider::new();
    let orchestrator = orchestrator(&provider);
    let mut rx = orchestrator.handle().subscribe();

    orchestrator.run("key").await.unwrap();

    let mut current: Option<Step> = None;
    let mut seen_steps = Vec::new();
    for event in drain(&mut rx) {
        match event {
            WorkflowEvent::StateChanged(WorkflowState::RunningStep(step)) => {
                current = Some(step);
                seen_steps.push(step);
            }
            WorkflowEvent::Fragment { step, text } => {
                assert_eq!(Some(step), current, "fragment for {step} outside its step");
                assert!(!text.is_empty());
            }
            _ => {}
        }
    }
    assert_eq!(seen_steps, Step::ALL);
}

#[tokio::test]
async fn reset_during_step_two_abandons_the_run() {
    let provider = ScriptedProvider::new();
    let orchestrator = orchestrator(&provider);
    let handle = orchestrator.handle().clone();
    let mut rx = handle.subscribe();

    let observer = async {
        loop {
            match rx.recv().await {
                Ok(WorkflowEvent::Fragment { step: Step::Two, .. }) => {
                    handle.reset();
                    return;
                }
                Ok(_) => {}
                Err(e) => panic!("event feed ended: {e}"),
            }
        }
    };

    let (result, ()) = tokio::join!(orchestrator.run("key"), observer);

    assert_eq!(result.unwrap_err(), FlowError::Cancelled);
    let snapshot = orchestrator.snapshot();
    assert_eq!(snapshot.state, WorkflowState::Idle);
    assert_eq!(snapshot.buffers, <[String; 3]>::default());
    assert_eq!(snapshot.active_model_index, 0);
    assert_eq!(snapshot.error, None);
    assert!(called_steps(&provider).iter().all(|(_, step)| *step != 3));
}

#[tokio::test]
async fn new_run_starts_on_the_first_model_again() {
    let provider = ScriptedProvider::new()
        .reply("m1", Reply::Fail(FlowError::Quota("quota".into())));
    let orchestrator = orchestrator(&provider);

    let first = orchestrator.run("key").await.unwrap();
    assert_eq!(first.active_model_index, 1);

    let second = orchestrator.run("key").await.unwrap();
    assert_eq!(second.active_model_index, 0);
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(orchestrator.snapshot().active_model_index, 0);
}

#[tokio::test]
async fn unreadable_history_does_not_stop_fallback() {
    let provider = ScriptedProvider::new()
        .unreadable_history()
        .reply("m1", Reply::text("variant one\n"))
        .reply("m1", Reply::Fail(FlowError::Quota("quota".into())));
    let orchestrator = orchestrator(&provider);

    let report = orchestrator.run("key").await.unwrap();

    assert_eq!(report.final_model.id, "m2");
    assert_eq!(provider.opened()[1], ("m2".to_string(), 0));
}

#[tokio::test]
async fn run_without_document_is_refused() {
    let orchestrator = OrchestratorBuilder::new(Arc::new(ScriptedProvider::new())).build();

    let err = orchestrator.run("key").await.unwrap_err();

    assert!(matches!(err, FlowError::MissingInput(_)));
    assert_eq!(orchestrator.snapshot().state, WorkflowState::Idle);
}

#[tokio::test]
async fn export_joins_the_three_variants() {
    let provider = ScriptedProvider::new();
    let orchestrator = orchestrator(&provider);

    let report = orchestrator.run("key").await.unwrap();
    let composed = report.compose();

    let parts: Vec<&str> = composed.split("\n\n***\n\n").collect();
    assert_eq!(parts.len(), 3);
    assert!(parts[2].starts_with("## EXAM NO. 3"));
    let source = SourceDocument::from_bytes("midterm.pdf", "application/pdf", b"%PDF-1.7");
    assert_eq!(
        examgen_flow::export::file_stem(Some(&source)),
        "Bo_3_De_Thi_midterm"
    );
}
