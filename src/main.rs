mod audit;
mod auth;
mod checkpoint;
mod cli;
mod config;
mod confine;
mod credentials;
mod drift;
mod engine;
mod errors;
mod gate;
mod guard;
mod limits;
mod logging;
mod manager;
mod ops;
mod paths;
mod promote;
mod prompts;
mod provider;
mod roles;
mod sandbox;
mod secrets;
mod session;
mod skills;
mod store;
mod wisdom;
mod workspace;

use crate::config::Config;
use anyhow::Result;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "ara", version)]
#[command(about = "ARA — governed autonomous-role execution engine", long_about = None)]
struct Cli {
    /// Workspace root. If omitted, detects by walking up for .git.
    #[arg(long, global = true)]
    workspace: Option<std::path::PathBuf>,

    /// Print results as JSON instead of text.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    /// Log level override (trace|debug|info|warn|error).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    cmd: cli::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    logging::init(args.log_level.as_deref())?;

    let config = Config::load()?;
    let core = ops::Core::open(config)?;

    let result = cli::dispatch(&core, args.cmd, args.workspace).await;
    cli::print_result(&result, args.json);
    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}
