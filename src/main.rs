use anyhow::Result;
use clap::Parser;
use marketing_assets::generator::{plan_generation, run_generation};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "marketing-assets", about = "Batch image and video generation for the website")]
struct Cli {
    /// Project root; manifests, outputs and .env.local are resolved against it
    #[arg(long, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Generate every missing asset (all manifests under jobs/ when none given)
    Run {
        manifests: Vec<PathBuf>,
    },
    /// List which jobs would be skipped or generated, without calling the API
    Plan {
        manifests: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run { manifests } => run_generation(&cli.root, &manifests).await?,
        Command::Plan { manifests } => plan_generation(&cli.root, &manifests).await?,
    };
    std::process::exit(code);
}
