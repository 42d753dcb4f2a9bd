use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use batch_lite::config::{HandlerConfig, ListenerConfig, MasterConfig, PullConfig, MASTER_PORT};
use batch_lite::dispatch::RedisStreamBroker;
use batch_lite::entry;
use batch_lite::job::{decode_payload, JobPayload};
use batch_lite::shutdown::install_shutdown_handler;
use batch_lite::worker::{CommandHandler, FunctionHandler};

#[derive(Parser, Debug)]
#[command(name = "batch-lite")]
#[command(version)]
#[command(about = "Call distribution for batch jobs: range master, pull workers and fanout listeners")]
#[command(propagate_version = true)]
struct Args {
    /// Shell command executing invocations; receives the payload as JSON on stdin
    #[arg(long, env = "BATCH_HANDLER", default_value = "cat > /dev/null", global = true)]
    handler: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Pull call ranges from the master and execute them
    RunJob {
        /// Base64-encoded JSON job payload
        payload: String,

        /// IP of the master pod
        #[arg(long, env = "MASTER_POD_IP")]
        master_ip: Option<String>,

        /// Full master URL; takes precedence over --master-ip
        #[arg(long, env = "MASTER_URL")]
        master_url: Option<String>,
    },

    /// Serve call ranges to pull workers
    RunMaster {
        /// Base64-encoded JSON payload (only `log_level` is read)
        payload: Option<String>,

        /// Port to listen on
        #[arg(long, default_value_t = MASTER_PORT)]
        port: u16,
    },

    /// Consume broadcast job messages and run this pod's share
    StartListener {
        /// Base64-encoded JSON listener payload
        payload: String,
    },

    /// Print runtime metadata as JSON
    GetMetadata {
        /// Base64-encoded JSON payload (only `log_level` is read)
        payload: Option<String>,
    },
}

fn init_tracing(log_level: Option<&str>) {
    let default_level = log_level.unwrap_or("info").to_lowercase();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

/// Decode a payload argument and set up logging from its `log_level`.
fn load_payload<T: DeserializeOwned>(encoded: &str) -> Result<T, Box<dyn std::error::Error>> {
    let raw: Value = decode_payload(encoded)?;
    init_tracing(raw.get("log_level").and_then(Value::as_str));
    Ok(serde_json::from_value(raw)?)
}

fn init_from_optional(encoded: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    match encoded {
        Some(encoded) => load_payload::<Value>(encoded).map(|_| ()),
        None => {
            init_tracing(None);
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let handler: Arc<dyn FunctionHandler> =
        Arc::new(CommandHandler::new(HandlerConfig::new(args.handler)));

    match args.command {
        Commands::RunJob {
            payload,
            master_ip,
            master_url,
        } => {
            let payload: JobPayload = load_payload(&payload)?;
            let config = match (master_url, master_ip) {
                (Some(master_url), _) => PullConfig {
                    master_url,
                    ..PullConfig::default()
                },
                (None, Some(master_ip)) => PullConfig::for_master_ip(&master_ip),
                (None, None) => return Err("MASTER_POD_IP or --master-url is required".into()),
            };

            let shutdown = install_shutdown_handler();
            let summary = entry::run_job(&payload, &config, handler, &shutdown).await?;
            tracing::info!(
                rounds = summary.rounds,
                calls = summary.calls,
                failed_rounds = summary.failed_rounds,
                "Pull worker finished"
            );
        }
        Commands::RunMaster { payload, port } => {
            init_from_optional(payload.as_deref())?;
            let config = MasterConfig::new(SocketAddr::from(([0, 0, 0, 0], port)));
            let shutdown = install_shutdown_handler();
            entry::run_master(&config, shutdown).await?;
        }
        Commands::StartListener { payload } => {
            let config: ListenerConfig = load_payload(&payload)?;
            let broker = RedisStreamBroker::open(&config.broker_url)?;
            let shutdown = install_shutdown_handler();
            entry::start_listener(&config, &broker, handler, &shutdown).await?;
        }
        Commands::GetMetadata { payload } => {
            init_from_optional(payload.as_deref())?;
            tracing::info!("Generating runtime metadata");
            println!("{}", serde_json::to_string_pretty(&entry::runtime_metadata())?);
        }
    }

    Ok(())
}
