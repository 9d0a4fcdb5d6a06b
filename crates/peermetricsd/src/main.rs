//! peermetricsd — pool members sharing one merged `/metrics` endpoint.
//!
//! Two modes:
//! - `worker`: one pool member. Joins the pool's topic, answers peers, and
//!   serves `/metrics` with the merged view.
//! - `pool`: supervisor. Spawns N workers with `NODE_APP_INSTANCE` set so
//!   they share its pid as their parent and therefore one topic.
//!
//! # Usage
//!
//! ```text
//! peermetricsd pool --workers 4 --base-port 9464
//! peermetricsd worker --config /etc/peermetrics.toml --listen 0.0.0.0:9464
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod pool;
mod worker;

#[derive(Parser)]
#[command(name = "peermetricsd", about = "peermetrics worker and pool supervisor")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one pool member.
    Worker {
        /// Path to peermetrics.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Explicit peer index, overriding the instance env var.
        #[arg(long)]
        instance: Option<u32>,

        /// Address for the /metrics endpoint, overriding `http.listen`.
        #[arg(long)]
        listen: Option<String>,
    },
    /// Spawn and supervise a pool of workers.
    Pool {
        /// Number of workers.
        #[arg(long, default_value = "2")]
        workers: u32,

        /// Worker i listens on base-port + i.
        #[arg(long, default_value = "9464")]
        base_port: u16,

        /// Host the workers bind to.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Config file handed to every worker.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    tracing_subscriber::EnvFilter::new("info,peermetrics=debug,peermetricsd=debug")
                }),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Worker {
            config,
            instance,
            listen,
        } => worker::run_worker(config, instance, listen).await,
        Command::Pool {
            workers,
            base_port,
            host,
            config,
        } => pool::run_pool(workers, base_port, host, config).await,
    }
}
