//! Run a strata document as a sync server or client.
//!
//! ```text
//! strata-node serve --bind 127.0.0.1:9000 --tick-ms 1000
//! strata-node join --server 127.0.0.1:9000 --receive-only
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use strata_core::{Document, NodePath, TaggedMutation, Tree};
use strata_sync::{
    EndpointConfig, ListenerConfig, ReconnectPolicy, SyncController, SyncMode,
};

#[derive(Parser, Debug)]
#[command(name = "strata-node")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve a document to connecting replicas
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:9000")]
        bind: String,

        /// Maximum concurrent sessions
        #[arg(long, default_value_t = 100)]
        max_sessions: usize,

        /// Bump a counter property on the root this often (0 = never)
        #[arg(long, default_value_t = 0)]
        tick_ms: u64,
    },

    /// Replicate a document from a server
    Join {
        /// Server address (host:port or ws:// URL)
        #[arg(short, long)]
        server: String,

        /// Never send local edits
        #[arg(long)]
        receive_only: bool,

        /// Give up after this many reconnect attempts (0 = retry forever)
        #[arg(long, default_value_t = 10)]
        max_attempts: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let tree = Arc::new(Tree::new("document"));
    let _trace = tree.on_mutation(Arc::new(|t: &TaggedMutation| log::info!("{:?}: {}", t.origin, t.mutation)));

    let controller = match cli.command {
        Command::Serve {
            bind,
            max_sessions,
            tick_ms,
        } => {
            let config = ListenerConfig {
                max_sessions,
                ..ListenerConfig::default()
            };
            let controller = SyncController::server(tree.clone(), config);
            controller.start(&bind).await?;
            if tick_ms > 0 {
                tokio::spawn(tick(tree.clone(), Duration::from_millis(tick_ms)));
            }
            controller
        }
        Command::Join {
            server,
            receive_only,
            max_attempts,
        } => {
            let config = EndpointConfig {
                mode: if receive_only {
                    SyncMode::ReceiveOnly
                } else {
                    SyncMode::Bidirectional
                },
                reconnect: ReconnectPolicy {
                    max_attempts: (max_attempts > 0).then_some(max_attempts),
                    ..ReconnectPolicy::default()
                },
                ..EndpointConfig::default()
            };
            let controller = SyncController::client(tree.clone(), config);
            controller.start(&server).await?;
            controller
        }
    };

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");
    controller.shutdown().await;
    Ok(())
}

async fn tick(tree: Arc<Tree>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    let mut count: i64 = 0;
    loop {
        interval.tick().await;
        count += 1;
        if let Err(e) = tree.set_property(&NodePath::root(), "tick", count) {
            log::error!("tick failed: {e}");
            return;
        }
    }
}
