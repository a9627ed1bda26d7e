use anyhow::{Context, Result, anyhow};
use clap::Parser;
use examgen_flow::{
    FlowError, GeminiProvider, OrchestratorBuilder, RetryPolicyKind, SessionProvider, Settings,
    SourceDocument, Step, WorkflowEvent, WorkflowHandle, WorkflowSnapshot, WorkflowState, export,
    mime_from_extension, scripted::ScriptedProvider,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{Level, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Generates three variant exams, with answer keys, from a source exam.
#[derive(Parser)]
#[command(name = "examgen")]
#[command(about = "Generate three variant exams from a source exam document", long_about = None)]
struct Cli {
    /// Source exam (PDF, image or text)
    #[arg(long)]
    file: PathBuf,

    /// MIME type of the source; inferred from the extension when omitted
    #[arg(long)]
    mime: Option<String>,

    /// Model to try first
    #[arg(long)]
    model: Option<String>,

    /// YAML settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Where to write the combined Markdown export
    #[arg(long)]
    out: Option<PathBuf>,

    /// `uniform` or `kind-aware`
    #[arg(long)]
    retry_policy: Option<RetryPolicyKind>,

    /// Write the run report as JSON
    #[arg(long)]
    report: Option<PathBuf>,

    /// Rehearse the workflow against canned replies, without calling the backend
    #[arg(long)]
    offline: bool,
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(Level::INFO.into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f == "json");

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

async fn load_document(path: &Path, mime: Option<String>) -> Result<SourceDocument> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("not a file path: {}", path.display()))?
        .to_string();
    let mime = match mime {
        Some(mime) => mime,
        None => mime_from_extension(&name)
            .map(str::to_string)
            .with_context(|| format!("cannot infer the MIME type of {name}; pass --mime"))?,
    };
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(SourceDocument::from_bytes(name, mime, &bytes))
}

fn banner(step: Step) -> String {
    format!("\n===== VARIANT {} =====\n\n", step.number())
}

/// Tracks how much of the running step has reached stdout.
///
/// Output normally comes from fragment events. Once the event feed has lagged, the
/// rest of the step is copied from the shared buffer instead, so skipped fragments
/// are recovered and fragments still queued are not printed twice.
#[derive(Debug, Default)]
struct Mirror {
    step: Option<Step>,
    printed: usize,
    follow_buffer: bool,
}

impl Mirror {
    fn start(&mut self, step: Step) -> String {
        if self.step == Some(step) {
            return String::new();
        }
        *self = Mirror {
            step: Some(step),
            ..Mirror::default()
        };
        banner(step)
    }

    fn restart(&mut self, step: Step) -> String {
        self.printed = 0;
        format!("\n----- {step} restarted -----\n\n")
    }

    fn fragment(
        &mut self,
        step: Step,
        text: &str,
        snapshot: impl FnOnce() -> WorkflowSnapshot,
    ) -> String {
        if self.step != Some(step) {
            return String::new();
        }
        if self.follow_buffer {
            return self.catch_up(&snapshot());
        }
        self.printed += text.len();
        text.to_string()
    }

    fn lagged(&mut self, snapshot: &WorkflowSnapshot) -> String {
        self.follow_buffer = true;
        let mut output = self.catch_up(snapshot);
        if let WorkflowState::RunningStep(step) = snapshot.state {
            if self.step != Some(step) {
                self.step = Some(step);
                self.printed = 0;
                output.push_str(&banner(step));
                output.push_str(&self.catch_up(snapshot));
            }
        }
        output
    }

    fn catch_up(&mut self, snapshot: &WorkflowSnapshot) -> String {
        let Some(step) = self.step else {
            return String::new();
        };
        let buffer = snapshot.buffer(step);
        // a buffer shorter than what was printed has been restarted
        let tail = buffer.get(self.printed..).unwrap_or(buffer);
        self.printed = buffer.len();
        tail.to_string()
    }
}

/// Streams step output to stdout until the run settles.
fn spawn_printer(handle: &WorkflowHandle) -> JoinHandle<()> {
    let handle = handle.clone();
    let mut events = handle.subscribe();
    tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        let mut mirror = Mirror::default();
        loop {
            let output = match events.recv().await {
                Ok(WorkflowEvent::StateChanged(WorkflowState::RunningStep(step))) => {
                    mirror.start(step)
                }
                Ok(WorkflowEvent::Fragment { step, text }) => {
                    mirror.fragment(step, &text, || handle.snapshot())
                }
                Ok(WorkflowEvent::StepRestarted { step }) => mirror.restart(step),
                Ok(WorkflowEvent::ModelSwitched { step, from, to }) => {
                    info!(step = step.number(), %from, %to, "Continuing on fallback model");
                    continue;
                }
                Ok(WorkflowEvent::StateChanged(_)) => {
                    let _ = writeln!(stdout);
                    break;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Output display fell behind, catching up from the step buffer");
                    mirror.lagged(&handle.snapshot())
                }
                Err(RecvError::Closed) => break,
            };
            if write!(stdout, "{output}")
                .and_then(|()| stdout.flush())
                .is_err()
            {
                break;
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref()).context("loading settings")?;
    if let Some(model) = cli.model {
        settings.preferred_model = Some(model);
    }
    if let Some(policy) = cli.retry_policy {
        settings.retry_policy = policy;
    }

    let document = load_document(&cli.file, cli.mime).await?;
    let export_stem = export::file_stem(Some(&document));

    let (provider, api_key): (Arc<dyn SessionProvider>, String) = if cli.offline {
        info!("Offline rehearsal, replies are canned");
        (Arc::new(ScriptedProvider::new()), "offline".to_string())
    } else {
        (
            Arc::new(GeminiProvider::from_settings(&settings)?),
            settings.api_key()?.to_string(),
        )
    };

    let orchestrator = OrchestratorBuilder::new(provider)
        .models(settings.model_priority()?)
        .retry_policy(settings.retry_policy.build())
        .system_instruction(settings.system_instruction()?)
        .build();
    orchestrator.select_document(document)?;

    let printer = spawn_printer(orchestrator.handle());
    let interrupt = {
        let handle = orchestrator.handle().clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, abandoning the run");
                handle.reset();
            }
        })
    };

    let result = orchestrator.run(&api_key).await;
    interrupt.abort();

    // the printer stops on its own once a terminal or reset state is announced
    let settled = matches!(result, Err(FlowError::Cancelled))
        || orchestrator.snapshot().state.is_terminal();
    if settled {
        let _ = printer.await;
    } else {
        printer.abort();
    }

    let report = match result {
        Ok(report) => report,
        Err(FlowError::Cancelled) => {
            eprintln!("Cancelled.");
            std::process::exit(130);
        }
        Err(e) => {
            error!(error = %e, "Generation failed");
            return Err(e.into());
        }
    };

    for step in Step::ALL {
        let key = report.answer_key(step);
        if key.is_empty() {
            warn!(step = step.number(), "No answer key found in the variant");
        } else {
            info!(step = step.number(), answers = key.len(), "Answer key parsed");
        }
    }

    let out = cli
        .out
        .unwrap_or_else(|| PathBuf::from(format!("{export_stem}.md")));
    tokio::fs::write(&out, report.compose())
        .await
        .with_context(|| format!("writing {}", out.display()))?;
    info!(path = %out.display(), model = %report.final_model.id, "Export written");

    if let Some(path) = cli.report {
        let json = serde_json::to_string_pretty(&report)?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
    }

    Ok(())
}
