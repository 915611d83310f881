use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use poml_config::ConverterConfig;
use poml_core::Identity;
use poml_history::{export_document, RecordSummary};
use poml_orchestrator::{ConversionOrchestrator, OrchestratorResult, TierTrigger};
use poml_session::{LocalAuthProvider, Provider, SessionManager, SessionState};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "poml-converter")]
#[command(about = "Convert free-form prompt text into POML documents", long_about = None)]
struct Cli {
    /// Config file, defaults to config.yaml in the data directory
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    /// Continue without signing in
    #[arg(long, action = clap::ArgAction::SetTrue, conflicts_with = "provider")]
    guest: bool,

    /// Sign in through google, github or gitlab
    #[arg(long, value_name = "PROVIDER")]
    provider: Option<Provider>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert one piece of text
    Convert {
        /// Text to convert
        #[arg(short, long, conflicts_with = "file")]
        text: Option<String>,

        /// Read the text from a file
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Save the document as a .poml file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List past conversions
    History {
        /// Print the full record with this id
        #[arg(long)]
        id: Option<Uuid>,
    },

    /// Show quota usage for the current identity
    Usage,

    /// Interactive session
    Shell,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose)?;

    let config = load_config(cli.config.as_deref())?;
    let orchestrator = Arc::new(ConversionOrchestrator::from_config(&config)?);
    let session = SessionManager::new(Arc::new(LocalAuthProvider::from_env()));

    if cli.guest {
        session.continue_as_guest()?;
    } else if let Some(provider) = cli.provider {
        session.sign_in(provider).await?;
    }

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    match cli.command {
        Commands::Convert { text, file, output } => {
            let input = read_input(text, file)?;
            let mut triggers = orchestrator.subscribe();
            let result = orchestrator.submit_in_session(&session, &input, &cancel).await;
            report_triggers(&mut triggers);
            let document = print_outcome(result)?;
            if let Some(path) = output {
                let saved = export_document(&document, &path)?;
                println!("Saved to {}", saved.display());
            }
        }
        Commands::History { id } => {
            let identity = require_identity(&session)?;
            match id {
                Some(id) => print_record(&orchestrator, &identity, id)?,
                None => list_history(&orchestrator, &identity)?,
            }
        }
        Commands::Usage => {
            let identity = require_identity(&session)?;
            print_usage(&orchestrator, &identity)?;
        }
        Commands::Shell => {
            interactive_shell(orchestrator, session, cancel).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<ConverterConfig> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(ConverterConfig::default_config_path);

    let config = if path.exists() {
        info!("Loading configuration from: {:?}", path);
        ConverterConfig::from_yaml(&path)?
    } else {
        info!("Using default configuration");
        let config = ConverterConfig::default();
        config.validate()?;
        config
    };

    if config.endpoint.api_key.is_empty() {
        warn!("No API key configured; requests will be sent without one");
    }
    Ok(config)
}

fn read_input(text: Option<String>, file: Option<PathBuf>) -> Result<String> {
    let input = match (text, file) {
        (Some(text), _) => text,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        (None, None) => bail!("Provide --text or --file"),
    };

    if input.trim().is_empty() {
        bail!("Nothing to convert");
    }
    Ok(input)
}

fn require_identity(session: &SessionManager) -> Result<Identity> {
    session
        .identity()
        .context("Choose --guest or --provider <google|github|gitlab> first")
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling");
            cancel.cancel();
        }
    });
}

fn print_outcome(result: OrchestratorResult) -> Result<String> {
    match result {
        OrchestratorResult::Converted(document) => {
            println!("{document}");
            Ok(document)
        }
        OrchestratorResult::QuotaDenied(reason) => bail!("{reason}"),
        OrchestratorResult::RemoteFailed(kind) => {
            bail!("Conversion failed ({kind}). Please try again later.")
        }
        OrchestratorResult::Cancelled => bail!("Conversion cancelled"),
        OrchestratorResult::StorageFailed(message) => bail!("Storage error: {message}"),
        OrchestratorResult::SessionRequired => {
            bail!("Choose --guest or --provider <google|github|gitlab> first")
        }
        OrchestratorResult::TierMismatch { requested, entitled } => {
            bail!("Tier {requested} requested but this identity is on {entitled}")
        }
    }
}

fn report_triggers(triggers: &mut broadcast::Receiver<TierTrigger>) {
    while let Ok(trigger) = triggers.try_recv() {
        match trigger {
            TierTrigger::SignUpSuggested => {
                println!("Free trial used up. Sign in to get more conversions.");
            }
            TierTrigger::UpgradeSuggested { identity } => {
                println!("Bonus conversions used up for {identity}. Upgrade to Pro for unlimited use.");
            }
        }
    }
}

fn list_history(orchestrator: &ConversionOrchestrator, identity: &Identity) -> Result<()> {
    let tier = orchestrator.tier_for(identity);
    let records = orchestrator.history().visible_for(identity, tier)?;

    if records.is_empty() {
        println!("No conversions recorded for {identity}");
        return Ok(());
    }

    for record in &records {
        let summary = RecordSummary::from(record);
        println!(
            "{}  {}  {:>6} chars  {}",
            summary.id,
            summary.created_at.format("%Y-%m-%d %H:%M:%S"),
            summary.document_chars,
            summary.input_preview
        );
    }
    Ok(())
}

fn print_record(orchestrator: &ConversionOrchestrator, identity: &Identity, id: Uuid) -> Result<()> {
    let record = orchestrator.history().find(identity, id)?;
    println!("Input:\n{}\n", record.input_text);
    println!("POML:\n{}", record.output_document);
    Ok(())
}

fn print_usage(orchestrator: &ConversionOrchestrator, identity: &Identity) -> Result<()> {
    let usage = orchestrator.usage(identity)?;
    match (usage.limit, usage.remaining) {
        (Some(limit), Some(remaining)) => println!(
            "{identity} ({}): {} of {limit} used, {remaining} remaining",
            usage.tier, usage.used
        ),
        _ => println!("{identity} ({}): {} used, unlimited", usage.tier, usage.used),
    }
    Ok(())
}

async fn interactive_shell(
    orchestrator: Arc<ConversionOrchestrator>,
    session: SessionManager,
    cancel: CancellationToken,
) -> Result<()> {
    println!("POML converter shell");
    println!("Commands: guest, signin <provider>, signout, convert <text>, history, usage, save <path>, quit");

    let mut triggers = orchestrator.subscribe();
    let mut last_document: Option<String> = None;

    loop {
        print!("{}> ", prompt_label(&session.current()));
        io::stdout().flush()?;

        let mut line = String::new();
        if io::stdin().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();

        let outcome: Result<()> = match command {
            "" => continue,
            "quit" | "exit" => break,
            "guest" => session.continue_as_guest().map(|_| ()).map_err(Into::into),
            "signin" => match rest.parse::<Provider>() {
                Ok(provider) => session.sign_in(provider).await.map(|_| ()).map_err(Into::into),
                Err(e) => Err(e.into()),
            },
            "signout" => session.sign_out().await.map(|_| ()).map_err(Into::into),
            "convert" if rest.is_empty() => Err(anyhow::anyhow!("Usage: convert <text>")),
            "convert" => {
                let result = orchestrator
                    .submit_in_session(&session, rest, &cancel.child_token())
                    .await;
                report_triggers(&mut triggers);
                print_outcome(result).map(|document| {
                    last_document = Some(document);
                })
            }
            "history" => require_identity(&session)
                .and_then(|identity| list_history(&orchestrator, &identity)),
            "usage" => require_identity(&session)
                .and_then(|identity| print_usage(&orchestrator, &identity)),
            "save" => match (&last_document, rest) {
                (None, _) => Err(anyhow::anyhow!("Nothing converted yet")),
                (Some(_), "") => Err(anyhow::anyhow!("Usage: save <path>")),
                (Some(document), path) => export_document(document, Path::new(path))
                    .map(|saved| println!("Saved to {}", saved.display()))
                    .map_err(Into::into),
            },
            other => Err(anyhow::anyhow!("Unknown command: {other}")),
        };

        if let Err(e) = outcome {
            println!("Error: {e}");
        }
        if cancel.is_cancelled() {
            break;
        }
    }

    println!("Goodbye!");
    Ok(())
}

fn prompt_label(state: &SessionState) -> String {
    match state {
        SessionState::Unresolved => "poml".to_string(),
        SessionState::Anonymous => "poml[guest]".to_string(),
        SessionState::Authenticated(identity) => format!("poml[{identity}]"),
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let filter = if verbose { "debug" } else { "warn" };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    Ok(())
}
