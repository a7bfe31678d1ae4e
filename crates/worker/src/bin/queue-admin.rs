//! queue-admin: create, delete, feed and inspect the work queue pair.

use clap::{Parser, Subcommand};
use tracing::info;

use vault_core::config::{load_dotenv, Config};
use vault_core::EntityId;
use vault_queue::SqsAdmin;

/// Manage the entity work queue and its dead-letter queue.
#[derive(Parser, Debug)]
#[command(name = "queue-admin", version, about)]
struct Cli {
    /// Prefix shared by every queue of this deployment.
    #[arg(long, env = "QUEUE_PROJECT_PREFIX", default_value = "sec_filings_")]
    project_prefix: String,

    #[arg(long, env = "QUEUE_NAME", default_value = "ciks_to_collect")]
    queue_name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the dead-letter queue and the main queue redriving into it.
    Setup,
    /// Delete the main queue and the dead-letter queue.
    Teardown,
    /// Send one work message per CIK.
    Enqueue {
        #[arg(required = true)]
        ciks: Vec<String>,
    },
    /// Print queue and dead-letter depths as JSON.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env();
    config.queue.project_prefix = cli.project_prefix;
    config.queue.queue_name = cli.queue_name;

    let admin = SqsAdmin::new(&config.aws, &config.queue).await;

    match cli.command {
        Command::Setup => {
            let url = admin.setup().await?;
            info!(queue = %admin.queue_name(), %url, "Queues ready");
        }
        Command::Teardown => {
            let deleted = admin.teardown().await?;
            info!(?deleted, "Teardown complete");
        }
        Command::Enqueue { ciks } => {
            for cik in &ciks {
                let entity = EntityId::new(cik);
                if entity.is_empty() {
                    anyhow::bail!("empty CIK");
                }
                admin.send_entity(&entity).await?;
            }
            info!(count = ciks.len(), "Enqueued");
        }
        Command::Status => {
            let status = admin.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }
    Ok(())
}
