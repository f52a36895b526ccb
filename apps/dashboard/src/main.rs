use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use lab_shared::{
    domain::{NewRun, RunId},
    protocol::AdvisoryKind,
};
use tracing_subscriber::EnvFilter;

mod config;
mod console;
mod render;

use config::{load_settings, DEFAULT_CONFIG_FILE};
use console::Console;

#[derive(Parser, Debug)]
#[command(name = "dashboard", about = "Operator console for lab test runs")]
struct Cli {
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[arg(long)]
    api_base_url: Option<String>,
    #[arg(long)]
    broker_url: Option<String>,
    /// Forget the stored broker identity on exit.
    #[arg(long)]
    end_session: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List runs from the backend with live markers.
    Runs,
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        operator: String,
        #[arg(long)]
        sample_size: f64,
        #[arg(long)]
        cement_added: bool,
        #[arg(long)]
        filters_swapped: bool,
        /// Start the run right away and follow it.
        #[arg(long)]
        start: bool,
        #[arg(long)]
        capture_file: Option<PathBuf>,
    },
    /// Send the start command; finished runs are started again.
    Start {
        run_id: String,
        #[arg(long)]
        watch: bool,
        #[arg(long)]
        capture_file: Option<PathBuf>,
    },
    Watch {
        run_id: String,
        /// Image answered to camera triggers.
        #[arg(long)]
        capture_file: Option<PathBuf>,
    },
    Delete {
        run_id: String,
        #[arg(long)]
        yes: bool,
    },
    /// Publish a manual-step advisory.
    Advise {
        kind: AdviseKind,
        #[arg(long)]
        run_id: Option<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum AdviseKind {
    Heat,
    Stirring,
    Wait,
}

impl From<AdviseKind> for AdvisoryKind {
    fn from(kind: AdviseKind) -> Self {
        match kind {
            AdviseKind::Heat => AdvisoryKind::HeatConfirmed,
            AdviseKind::Stirring => AdvisoryKind::StirringConfirmed,
            AdviseKind::Wait => AdvisoryKind::WaitComplete,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings(&cli.config);
    if let Some(url) = cli.api_base_url {
        settings.api_base_url = url;
    }
    if let Some(url) = cli.broker_url {
        settings.broker_url = url;
    }
    settings.validate()?;

    let console = Console::new(&settings)?;
    let outcome = run(&console, cli.command).await;
    if cli.end_session {
        console.end_session().await;
    } else {
        console.shutdown().await;
    }
    outcome
}

async fn run(console: &Console, command: Command) -> Result<()> {
    match command {
        Command::Runs => console.list_runs().await,
        Command::Create {
            name,
            operator,
            sample_size,
            cement_added,
            filters_swapped,
            start,
            capture_file,
        } => {
            let run_id = console
                .create_run(NewRun {
                    trial_name: name,
                    trial_operator: operator,
                    sample_size,
                    cement_added,
                    syringe_filters_swapped: filters_swapped,
                })
                .await?;
            if start {
                console.start_run(&run_id).await?;
                console.watch(&run_id, capture_file).await?;
            }
            Ok(())
        }
        Command::Start {
            run_id,
            watch,
            capture_file,
        } => {
            let run_id = RunId::new(run_id);
            console.start_run(&run_id).await?;
            if watch {
                console.watch(&run_id, capture_file).await?;
            }
            Ok(())
        }
        Command::Watch {
            run_id,
            capture_file,
        } => console.watch(&RunId::new(run_id), capture_file).await,
        Command::Delete { run_id, yes } => console.delete_run(&RunId::new(run_id), yes).await,
        Command::Advise { kind, run_id } => {
            console
                .advise(kind.into(), run_id.map(RunId::new))
                .await
        }
    }
}
