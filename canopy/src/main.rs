use std::sync::Arc;

use anyhow::{anyhow, Result};
use canopy::{ConnectionConfig, IdentityProvider, ModuleAction, StaticIdentity};
use canopy_core::{path, LogicalPath};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "canopy")]
#[command(about = "Client tooling for a hierarchical document store")]
struct Cli {
    /// Organisation token
    #[arg(long, env = "CANOPY_ORG_TOKEN", default_value = "")]
    org_token: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the connection derived from the org token
    Connection,

    /// Translate between logical paths and store keys
    Path {
        #[command(subcommand)]
        action: PathAction,
    },

    /// Invoke a server-side module action
    Invoke {
        function: String,
        module: String,
        action: String,

        /// JSON payload; anything that does not parse is sent as a string
        #[arg(short, long)]
        payload: Option<String>,

        /// ID token to authenticate with
        #[arg(long)]
        id_token: Option<String>,
    },
}

#[derive(Subcommand)]
enum PathAction {
    /// Escape segments into a store key
    Encode { segments: Vec<String> },

    /// Unescape a store key into segments
    Decode { key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Connection => {
            let config = ConnectionConfig::from_token(&cli.org_token)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Path { action } => match action {
            PathAction::Encode { segments } => {
                println!("{}", path::encode(&LogicalPath::from(segments))?);
            }
            PathAction::Decode { key } => {
                println!("{}", serde_json::to_string(path::decode_key(&key).segments())?);
            }
        },
        Commands::Invoke {
            function,
            module,
            action,
            payload,
            id_token,
        } => {
            let config = ConnectionConfig::from_token(&cli.org_token)?
                .ok_or_else(|| anyhow!("an org token is required to invoke module actions"))?;
            let identity = match id_token {
                Some(token) => {
                    Some(Arc::new(StaticIdentity::from_id_token(token)?) as Arc<dyn IdentityProvider>)
                }
                None => None,
            };
            let payload = payload.map(|raw| {
                serde_json::from_str::<serde_json::Value>(&raw).unwrap_or(serde_json::Value::String(raw))
            });
            let response = ModuleAction::new(config.functions_url, identity)
                .invoke(&function, &module, &action, payload)
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }

    Ok(())
}
