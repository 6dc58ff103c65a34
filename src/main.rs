//! abs-opds server entry point.

use abs_opds::{
    cache::{CacheBackend, MemoryWithSnapshot, Namespace, snapshot_path},
    config::{CacheCommand, Cli, Command, Config},
    server,
};
use clap::Parser;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Find or load config
    let config_path = cli.config.clone().or_else(Config::find_config_file);

    let mut config = if let Some(ref path) = config_path {
        Config::load(path)?
    } else {
        Config::default()
    };
    config.apply_overrides(&cli.overrides)?;

    match cli.command {
        Some(Command::Init { force }) => cmd_init(force),
        Some(Command::Cache { action }) => cmd_cache(action, &config),
        Some(Command::Check) => cmd_check(&config, config_path.as_ref()),
        Some(Command::Serve { bind }) => cmd_serve(config, bind).await,
        None => cmd_serve(config, None).await,
    }
}

/// Write a default config file.
fn cmd_init(force: bool) -> anyhow::Result<()> {
    let config_path = PathBuf::from("config.toml");

    if config_path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    std::fs::write(&config_path, Config::generate_default())?;
    println!("Created config file: {}", config_path.display());
    println!("\nSet upstream.url to your Audiobookshelf server, then run: abs-opds serve");

    Ok(())
}

/// Inspect or clear persisted cache snapshots.
fn cmd_cache(action: CacheCommand, config: &Config) -> anyhow::Result<()> {
    let dir = &config.cache.dir;

    match action {
        CacheCommand::Clear => {
            for namespace in Namespace::ALL {
                let path = snapshot_path(dir, namespace);
                if path.exists() {
                    std::fs::remove_file(&path)?;
                    println!("Removed {}", path.display());
                }
            }
        }

        CacheCommand::Stats => {
            println!("Snapshot directory: {}", dir.display());
            println!("{:<10} {:>8}  PATH", "NAMESPACE", "ENTRIES");
            println!("{}", "-".repeat(60));
            for namespace in Namespace::ALL {
                let path = snapshot_path(dir, namespace);
                if !path.exists() {
                    println!("{:<10} {:>8}  (none)", namespace, 0);
                    continue;
                }
                let snapshot = MemoryWithSnapshot::open(path.clone())?;
                println!("{:<10} {:>8}  {}", namespace, snapshot.len(), path.display());
            }
        }
    }

    Ok(())
}

/// Validate configuration and print the effective settings.
fn cmd_check(config: &Config, path: Option<&PathBuf>) -> anyhow::Result<()> {
    config.validate()?;

    match path {
        Some(path) => println!("Config file: {}", path.display()),
        None => println!("Config file: (none, using defaults)"),
    }

    let mut effective = config.clone();
    if effective.upstream.api_key.is_some() {
        effective.upstream.api_key = Some("<redacted>".to_string());
    }
    for key in effective.auth.users.values_mut() {
        *key = "<redacted>".to_string();
    }

    println!("{}", toml::to_string_pretty(&effective)?);
    println!("Configuration OK");
    Ok(())
}

/// Start the server.
async fn cmd_serve(mut config: Config, bind: Option<std::net::SocketAddr>) -> anyhow::Result<()> {
    if let Some(addr) = bind {
        config.server.bind = addr;
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "abs_opds=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    config.validate()?;

    tracing::info!(
        bind = %config.server.bind,
        upstream = %config.upstream.base_url(),
        auth = config.auth.enabled,
        "Starting abs-opds"
    );

    let bind = config.server.bind;
    let state = server::AppState::new(config)?;
    state.spawn_sweeper();

    let app = server::create_router(state);

    let listener = TcpListener::bind(bind).await?;
    tracing::info!(address = %bind, "Server listening");

    axum::serve(listener, app).await?;

    Ok(())
}
