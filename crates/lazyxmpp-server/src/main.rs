//! LazyXMPP standalone server.
//!
//! Loads configuration (defaults, optional TOML file, CLI flags, in that
//! order), opens the credential store, and runs the server until ctrl-c.
//! The `adduser` subcommand provisions accounts in the credential store,
//! since the in-band registration write path is intentionally stubbed.

mod config;

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lazyxmpp::{StoreError, UserStore, XmppServer, XmppServerConfig};

use crate::config::FileConfig;

#[derive(Debug, Parser)]
#[command(name = "lazyxmpp-server", version, about = "Minimal XMPP server")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// TCP port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Server domain (the host part of every local JID)
    #[arg(long)]
    hostname: Option<String>,

    /// Disable the IPv4 acceptor
    #[arg(long)]
    no_ipv4: bool,

    /// Disable the IPv6 acceptor
    #[arg(long)]
    no_ipv6: bool,

    /// Do not advertise in-band registration
    #[arg(long)]
    disable_registration: bool,

    /// Do not offer SASL PLAIN
    #[arg(long)]
    disable_plain_auth: bool,

    /// Refuse PLAIN on unencrypted streams
    #[arg(long)]
    disable_unsecure_auth: bool,

    /// Do not offer SASL ANONYMOUS
    #[arg(long)]
    disable_anonymous_auth: bool,

    /// Path to the user database (defaults to ~/.config/LazyXMPP/users.db)
    #[arg(long)]
    user_db: Option<PathBuf>,

    /// Keep the user database in memory instead of on disk
    #[arg(long)]
    ephemeral: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register a user in the credential store
    Adduser {
        /// The username (node part of the JID)
        username: String,
        /// The password to store
        password: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let file = match cli.config {
        Some(ref path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };

    let mut server_config = XmppServerConfig::default();
    file.apply(&mut server_config);

    if let Some(port) = cli.port {
        server_config.port = port;
    }
    if let Some(ref hostname) = cli.hostname {
        server_config.hostname = hostname.clone();
    }
    if cli.no_ipv4 {
        server_config.enable_ipv4 = false;
    }
    if cli.no_ipv6 {
        server_config.enable_ipv6 = false;
    }
    if cli.disable_registration {
        server_config.enable_registration = false;
    }
    if cli.disable_plain_auth {
        server_config.enable_plain_auth = false;
    }
    if cli.disable_unsecure_auth {
        server_config.enable_unsecure_auth = false;
    }
    if cli.disable_anonymous_auth {
        server_config.enable_anonymous_auth = false;
    }

    let db_path = cli
        .user_db
        .clone()
        .or_else(|| file.user_db.clone())
        .unwrap_or_else(UserStore::default_path);

    if let Some(Command::Adduser { username, password }) = cli.command {
        let store = UserStore::open(&db_path).await?;
        match store.register_user(&username, &password).await {
            Ok(()) => {
                info!(username = %username, "User registered");
                return Ok(());
            }
            Err(StoreError::AlreadyExists) => {
                bail!("username '{}' is already registered", username)
            }
            Err(e) => return Err(e.into()),
        }
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        hostname = %server_config.hostname,
        port = server_config.port,
        "Starting LazyXMPP server"
    );

    let store = if cli.ephemeral {
        info!("Using in-memory user database");
        UserStore::in_memory().await?
    } else {
        UserStore::open(&db_path).await?
    };

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    let server = XmppServer::bind(server_config, store, shutdown).await?;
    server.run().await?;

    info!("Server stopped");
    Ok(())
}
