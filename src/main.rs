use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use beatlight::config;
use beatlight::logging::init_logging;
use beatlight::midi::{self, MidiError, MidiListener};
use beatlight::osc::OscListener;
use beatlight::registry::EffectRegistry;
use beatlight::show::Show;

#[derive(Parser)]
#[command(name = "beatlight")]
#[command(about = "Beat-synced lighting effects engine", long_about = None)]
struct Cli {
    /// Show file; created with a demo show when missing
    #[arg(short, long, default_value = "show.json")]
    config: PathBuf,

    /// Run for 10 seconds, then exit
    #[arg(long)]
    debug: bool,

    /// Print the available effects and exit
    #[arg(long)]
    list_effects: bool,

    /// Write the Markdown effect reference to this path and exit
    #[arg(long, value_name = "PATH")]
    effect_docs: Option<PathBuf>,

    /// Event to fire once the chains are running (repeatable)
    #[arg(short, long, value_name = "EVENT")]
    trigger: Vec<String>,

    /// Write the live show back to the show file on exit
    #[arg(long)]
    save_on_exit: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_logging(cli.verbose) {
        eprintln!("Failed to initialize logging: {e}");
    }
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), BoxError> {
    let registry = Arc::new(EffectRegistry::with_builtins()?);

    if cli.list_effects {
        for name in registry.list_available() {
            if let Some(meta) = registry.metadata(name) {
                println!("{name:<14} {}", meta.description);
            }
        }
        return Ok(());
    }
    if let Some(path) = &cli.effect_docs {
        std::fs::write(path, registry.render_markdown())?;
        info!(path = %path.display(), "effect reference written");
        return Ok(());
    }

    let show_config = config::load_or_create(&cli.config, &registry)?;
    let show = Show::launch(&show_config, registry)?;
    let stage = show.stage().clone();

    let _midi = MidiListener::connect(&show_config.midi, stage.clone()).unwrap_or_else(|e| {
        warn!("MIDI disabled: {e}");
        if let MidiError::PortNotFound(_) = e {
            match midi::list_ports() {
                Ok(ports) => warn!(?ports, "available MIDI inputs"),
                Err(e) => warn!("cannot list MIDI inputs: {e}"),
            }
        }
        None
    });
    let _osc = match &show_config.osc {
        Some(osc) => match OscListener::bind(osc, stage.clone()).await {
            Ok(listener) => Some(listener),
            Err(e) => {
                warn!("OSC disabled: {e}");
                None
            }
        },
        None => None,
    };

    for event in &cli.trigger {
        if stage.trigger_event(event).is_err() {
            let known: Vec<&str> = stage.event_names().collect();
            info!(?known, "events in this show");
        }
    }

    if cli.debug {
        info!("debug run, stopping in 10 seconds");
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(10)) => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    } else {
        info!("running, press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
    }

    info!("shutting down");
    show.shutdown();
    if cli.save_on_exit {
        config::save(&stage.to_config(), &cli.config)?;
        info!(path = %cli.config.display(), "show saved");
    }
    Ok(())
}
