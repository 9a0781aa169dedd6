//! CLI client for ringkv

use clap::{Parser, Subcommand};
use ringkv::client::{PutOutcome, RequestRouter};
use ringkv::common::NodeAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ringkv")]
#[command(about = "ringkv distributed key-value store CLI")]
#[command(version = ringkv::BUILD_INFO)]
struct Cli {
    /// Any cluster node to bootstrap from (host:port)
    #[arg(long, default_value = "127.0.0.1:7001")]
    node: NodeAddr,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a value
    Put {
        key: String,
        value: String,
    },

    /// Fetch a value
    Get {
        key: String,
    },

    /// Remove a key
    Delete {
        key: String,
    },

    /// Show the ring's write ranges
    Keyrange,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut router = RequestRouter::new();
    router.connect(&cli.node).await?;

    match cli.command {
        Commands::Put { key, value } => match router.put(&key, &value).await? {
            PutOutcome::Created => println!("created {}", key),
            PutOutcome::Updated => println!("updated {}", key),
        },
        Commands::Get { key } => match router.get(&key).await? {
            Some(value) => println!("{}", value),
            None => {
                eprintln!("not found: {}", key);
                std::process::exit(1);
            }
        },
        Commands::Delete { key } => {
            if router.delete(&key).await? {
                println!("deleted {}", key);
            } else {
                eprintln!("not found: {}", key);
                std::process::exit(1);
            }
        }
        Commands::Keyrange => {
            let ring = router.keyrange().await?;
            for range in ring.ranges() {
                println!("{:032x}..{:032x}  {}", range.lower, range.upper, range.addr);
            }
        }
    }
    Ok(())
}
