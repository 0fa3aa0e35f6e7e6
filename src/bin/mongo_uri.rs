use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use mongo_persistence::connect::{MongoDbConnectionResolver, mask_password};
use mongo_persistence::{CallContext, ConfigParams};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "mongo-uri")]
#[command(about = "Resolve persistence configuration into a MongoDB connection string")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Resolve {
        /// JSON configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Extra `key=value` parameters, applied after the file
        #[arg(long = "set")]
        set: Vec<String>,
        #[arg(long)]
        show_password: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Resolve {
            config,
            set,
            show_password,
        } => resolve(config.as_deref(), &set, show_password).await,
    }
}

fn load_config(path: Option<&Path>, pairs: &[String]) -> Result<ConfigParams> {
    let mut config = match path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config '{}'", path.display()))?;
            let json: serde_json::Value = serde_json::from_str(&raw)
                .with_context(|| format!("Config '{}' is not valid JSON", path.display()))?;
            ConfigParams::from_json(&json)
        }
        None => ConfigParams::new(),
    };

    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("Invalid parameter '{}'. Expected format: key=value", pair))?;
        config.set(key.trim(), value.trim());
    }

    if config.is_empty() {
        return Err(anyhow!(
            "No configuration given: use --config <file> and/or --set key=value"
        ));
    }
    Ok(config)
}

async fn resolve(path: Option<&Path>, pairs: &[String], show_password: bool) -> Result<()> {
    let config = load_config(path, pairs)?;

    let mut resolver = MongoDbConnectionResolver::new();
    resolver.configure(&config);
    let uri = resolver
        .resolve(&CallContext::new("mongo-uri"))
        .await
        .context("Failed to resolve connection")?;

    if show_password {
        println!("{}", uri);
    } else {
        println!("{}", mask_password(&uri));
    }
    Ok(())
}
