use anyhow::Result;
use clap::Parser;
use coderun_common::EngineKind;
use coderun_server::{run_server_app, ServerArgs};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "coderun-server")]
#[command(about = "Run submitted code in sandboxes and relay interactive input", version)]
pub struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "CODERUN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on (overrides config and PORT)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Sandbox engine (docker, process)
    #[arg(long, value_parser = parse_engine)]
    pub engine: Option<EngineKind>,

    /// Also write logs to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

fn parse_engine(input: &str) -> Result<EngineKind, String> {
    input.parse::<EngineKind>().map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    run_server_app(ServerArgs {
        config: args.config,
        port: args.port,
        engine: args.engine,
        log_file: args.log_file,
        verbose: args.verbose,
    })
    .await
}
