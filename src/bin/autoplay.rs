use autoplay::{
    config::{self, EngineConfig},
    hal::LoggingInputDriver,
    rule::DecisionRule,
    ActionSequence, ActionSequencer, Error, PlayOptions, PlaybackEvent, RuleEngine,
};
use clap::{command, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file
    #[arg(short, long, default_value = "autoplay.json", global = true)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Dry-run an action sequence against the logging input driver
    Play(PlayArgs),

    /// Parse and validate a rule condition
    CheckRule {
        /// Condition expression, e.g. "recognition.Start.Confidence > 0.8"
        expression: String,
    },
}

#[derive(Parser)]
struct PlayArgs {
    /// Path to the sequence JSON file
    file: PathBuf,

    /// Playback speed multiplier
    #[arg(long)]
    speed: Option<f64>,

    /// Repeat until Ctrl+C
    #[arg(long)]
    repeat: bool,
}

fn load_config(path: &Path) -> Result<EngineConfig, Error> {
    if path.exists() {
        Ok(EngineConfig::from_file(path)?)
    } else {
        debug!("config file not found, using defaults");
        Ok(EngineConfig::default())
    }
}

async fn play(args: &PlayArgs, engine_config: &EngineConfig) -> Result<(), Error> {
    let sequence: ActionSequence = config::from_file(&args.file)?;
    info!(
        sequence = %sequence.name(),
        actions = sequence.action_count(),
        duration = ?sequence.playback_duration(),
        "sequence loaded"
    );

    let sequencer = Arc::new(ActionSequencer::from_config(
        Arc::new(LoggingInputDriver),
        engine_config,
    ));
    let mut events = sequencer.subscribe();
    let options = PlayOptions {
        speed: args.speed.unwrap_or(engine_config.playback.default_speed),
        repeat: args.repeat,
    };
    let cancel = CancellationToken::new();
    let mut handle = sequencer.spawn(sequence, options, cancel.clone())?;

    println!("Playing. Press Ctrl+C to stop.");
    let outcome = loop {
        tokio::select! {
            outcome = &mut handle => {
                break outcome.map_err(|e| Error::internal(format!("Playback task failed: {}", e)))?;
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Stop requested.");
                cancel.cancel();
            }
            event = events.recv() => {
                if let Ok(PlaybackEvent::ActionPlayed { index, action, .. }) = event {
                    println!("{:>4}  {}", index, action);
                }
            }
        }
    };

    println!("Playback {:?}.", outcome);
    Ok(())
}

fn check_rule(expression: &str, engine_config: &EngineConfig) -> Result<(), Error> {
    let rule = DecisionRule::parse("check", "check", expression)?;
    RuleEngine::new(engine_config.rules.clone()).validate(&rule)?;

    println!("OK: {}", rule.condition());
    for key in rule.condition().references() {
        println!("  reads {}", key);
    }
    Ok(())
}

async fn run(cli: &Cli) -> Result<(), Error> {
    let engine_config = load_config(&cli.config)?;
    match &cli.command {
        Commands::Play(args) => play(args, &engine_config).await,
        Commands::CheckRule { expression } => check_rule(expression, &engine_config),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
