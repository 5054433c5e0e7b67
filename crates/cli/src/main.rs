use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex, PoisonError};

use clap::{Parser, Subcommand, ValueEnum};
use collegegpt_client::{
    ClientSettings, ExchangeController, FailureKind, HttpTransport, PresentationSink,
    ResponseShape, Role, SettingsError, SubmitOutcome, Transcript, TransportError, TurnId,
};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const PROMPT: &str = "you> ";
const ASSISTANT_PREFIX: &str = "collegegpt> ";

#[derive(Debug, Parser)]
#[command(name = "collegegpt", version, about = "Ask CollegeGPT about colleges from the terminal")]
struct Cli {
    /// Settings file (JSON). Defaults to the per-user config directory.
    #[arg(long, env = "COLLEGEGPT_CONFIG")]
    config: Option<PathBuf>,
    /// Override the answering service base URL.
    #[arg(long)]
    base_url: Option<String>,
    /// Display name sent as a personalisation hint.
    #[arg(long)]
    name: Option<String>,
    /// Force how response bodies are read.
    #[arg(long, value_enum)]
    shape: Option<ShapeArg>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive conversation (default).
    Chat,
    /// Ask a single question and exit.
    Ask {
        #[arg(required = true, num_args = 1..)]
        question: Vec<String>,
    },
    /// Probe the service health endpoint.
    Health,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ShapeArg {
    Auto,
    Streaming,
    WholePayload,
}

impl From<ShapeArg> for ResponseShape {
    fn from(value: ShapeArg) -> Self {
        match value {
            ShapeArg::Auto => Self::Auto,
            ShapeArg::Streaming => Self::Streaming,
            ShapeArg::WholePayload => Self::WholePayload,
        }
    }
}

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("failed to load settings: {source}"))]
    LoadSettings { source: SettingsError },
    #[snafu(display("failed to set up the service connection: {source}"))]
    Connect { source: TransportError },
    #[snafu(display("health check failed: {source}"))]
    Health { source: TransportError },
    #[snafu(display("service is up but not ready (status '{status}')"))]
    NotReady { status: String },
    #[snafu(display("failed to read input: {source}"))]
    ReadInput { source: io::Error },
    #[snafu(display("exchange failed ({kind:?})"))]
    ExchangeFailed { kind: FailureKind },
}

/// Prints transcript growth to stdout.
///
/// User turns are not echoed; the terminal already shows what was typed.
#[derive(Default)]
struct TerminalSink {
    cursor: Mutex<Option<(TurnId, usize)>>,
}

impl PresentationSink for TerminalSink {
    fn render(&self, transcript: &Transcript) {
        let Some(turn) = transcript.last() else {
            return;
        };
        if turn.role != Role::Assistant {
            return;
        }

        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stdout = io::stdout().lock();

        let printed = match *cursor {
            Some((id, printed)) if id == turn.id => printed,
            _ => {
                let _ = write!(stdout, "{ASSISTANT_PREFIX}");
                0
            }
        };

        if let Some(fresh) = turn.content.get(printed..) {
            let _ = write!(stdout, "{fresh}");
        }
        let _ = stdout.flush();
        *cursor = Some((turn.id, turn.content.len()));
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "collegegpt exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let settings = load_settings(&cli)?;
    tracing::debug!(
        base_url = %settings.base_url,
        response_shape = ?settings.response_shape,
        "settings resolved"
    );

    match cli.command.unwrap_or(Command::Chat) {
        Command::Health => check_health(&settings).await,
        Command::Ask { question } => {
            let controller = connect(&settings)?;
            ask(&controller, &question.join(" ")).await
        }
        Command::Chat => {
            let controller = connect(&settings)?;
            chat(&controller).await
        }
    }
}

fn load_settings(cli: &Cli) -> Result<ClientSettings, CliError> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(ClientSettings::default_config_path);
    let mut settings = ClientSettings::load(&path).context(LoadSettingsSnafu)?;

    if let Some(base_url) = &cli.base_url {
        settings.base_url = base_url.clone();
    }
    if let Some(name) = &cli.name {
        settings.display_name = Some(name.clone());
    }
    if let Some(shape) = cli.shape {
        settings.response_shape = shape.into();
    }

    Ok(settings.normalized())
}

fn connect(settings: &ClientSettings) -> Result<ExchangeController, CliError> {
    let controller = ExchangeController::from_settings(settings).context(ConnectSnafu)?;
    controller.subscribe(Arc::new(TerminalSink::default()));
    Ok(controller)
}

async fn check_health(settings: &ClientSettings) -> Result<(), CliError> {
    let transport = HttpTransport::new(&settings.base_url).context(ConnectSnafu)?;
    let health = transport.check_health().await.context(HealthSnafu)?;

    println!("status: {}", health.status);
    for (label, flag) in [
        ("vector store", health.vector_store_initialized),
        ("retriever", health.retriever_initialized),
        ("chain", health.chain_initialized),
    ] {
        if let Some(flag) = flag {
            println!("{label}: {}", if flag { "ready" } else { "down" });
        }
    }
    if let Some(model) = &health.embedding_model {
        println!("embedding model: {model}");
    }

    if health.is_ready() {
        Ok(())
    } else {
        NotReadySnafu {
            status: health.status,
        }
        .fail()
    }
}

async fn ask(controller: &ExchangeController, question: &str) -> Result<(), CliError> {
    let outcome = controller.submit(question).await;
    println!();

    match outcome {
        SubmitOutcome::Failed(error) => ExchangeFailedSnafu { kind: error.kind() }.fail(),
        SubmitOutcome::Ignored(_) | SubmitOutcome::Completed(_) => Ok(()),
    }
}

async fn chat(controller: &ExchangeController) -> Result<(), CliError> {
    println!("Ask anything about colleges. Ctrl-D or /quit to exit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("{PROMPT}");
        let _ = io::stdout().flush();

        let Some(line) = lines.next_line().await.context(ReadInputSnafu)? else {
            println!();
            return Ok(());
        };

        match line.trim() {
            "/quit" | "/exit" => return Ok(()),
            "" => continue,
            _ => {}
        }

        // Failures already rendered the apology; the kind only matters for logs.
        if !controller.submit(&line).await.is_ignored() {
            println!();
        }
    }
}
