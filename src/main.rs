//! Pipeline gateway.
//!
//! # Architecture Overview
//!
//! ```text
//!                       ┌──────────────────────────────────────────────────────┐
//!                       │                      GATEWAY                          │
//!   Client Request      │  ┌─────────┐   ┌─────────┐   ┌──────────────────┐    │
//!   ────────────────────┼─▶│  http   │──▶│ routing │──▶│ TrafficController │    │
//!                       │  │ server  │   │  table  │   │  (named pipelines)│    │
//!                       │  └─────────┘   └─────────┘   └────────┬─────────┘    │
//!                       │                                        ▼              │
//!                       │              ┌──────────────────────────────────┐     │
//!                       │              │ Pipeline: filter → filter → ...  │     │
//!                       │              │ Proxy │ APIAggregator │ Fallback │     │
//!                       │              │ CertExtractor                    │     │
//!                       │              └──────────────┬───────────────────┘     │
//!                       │                             │ sub-requests             │
//!                       │                             ▼                          │
//!                       │                   other named pipelines ──────────────┼──▶ Backends
//!                       │                                                        │
//!                       │  config (+watcher) · observability · lifecycle · tls   │
//!                       └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;

use pipeline_gateway::filters::registry;
use pipeline_gateway::lifecycle::startup::{self, StartupOptions};

#[derive(Debug, Parser)]
#[command(name = "pipeline-gateway", version, about = "HTTP gateway running filter pipelines")]
struct Args {
    /// Path to the TOML configuration file. Defaults apply without it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Reload the configuration when the file changes.
    #[arg(long)]
    watch: bool,

    /// Validate the configuration, list filter kinds and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let options = StartupOptions {
        config_path: args.config,
        watch: args.watch,
    };

    if args.check {
        let config = startup::load(&options)?;
        println!(
            "configuration ok: {} routes, {} pipelines",
            config.routes.len(),
            config.pipelines.len()
        );
        for kind in registry().kinds() {
            println!("  {:<14} {}", kind.name, kind.description);
        }
        return Ok(());
    }

    startup::run(options).await?;
    Ok(())
}
