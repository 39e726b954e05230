//! cifs-core CLI binary.
//!
//! # Commands
//!
//! - `ping` - Connect, authenticate, optionally connect a share, and echo
//! - `serve` - Run the reference responder

use std::path::PathBuf;
use std::time::Instant;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use cifs::{
    protocol::Command, server::Responder, Config, Credentials, Endpoint, ServerConfig,
    SessionDirectory, VERSION,
};

#[derive(Parser)]
#[command(name = "cifs")]
#[command(version = VERSION)]
#[command(about = "Network filesystem session engine", long_about = None)]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authenticate against a server and measure round trips
    Ping {
        /// Server host (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Server port (default: 445, then 139)
        #[arg(short, long)]
        port: Option<u16>,

        /// Share to connect
        #[arg(short, long)]
        share: Option<String>,

        /// User name (overrides config)
        #[arg(short, long)]
        user: Option<String>,

        /// Account domain
        #[arg(short, long)]
        domain: Option<String>,

        /// Config file (default: platform config dir)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of echo round trips
        #[arg(short = 'n', long, default_value = "3")]
        count: usize,
    },

    /// Run the reference responder
    Serve {
        /// Listen port
        #[arg(short, long, default_value = "4450")]
        port: u16,

        /// Listen host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Responder config file (users, shares)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Account as user:domain:password (repeatable)
        #[arg(long = "user")]
        users: Vec<String>,

        /// Exported share (repeatable)
        #[arg(long = "share")]
        shares: Vec<String>,

        /// Require signing
        #[arg(long)]
        sign: bool,

        /// Legacy logon only
        #[arg(long)]
        legacy: bool,
    },
}

fn init_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = tokio::runtime::Runtime::new()?;
    match cli.command {
        Commands::Ping {
            host,
            port,
            share,
            user,
            domain,
            config,
            count,
        } => runtime.block_on(cmd_ping(host, port, share, user, domain, config, count)),
        Commands::Serve {
            port,
            host,
            config,
            users,
            shares,
            sign,
            legacy,
        } => runtime.block_on(cmd_serve(port, host, config, users, shares, sign, legacy)),
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let file = match path.or_else(Config::default_path) {
        Some(path) if path.exists() => Config::from_file(path)?,
        _ => Config::default(),
    };
    Ok(file.merge(Config::from_env()))
}

#[allow(clippy::too_many_arguments)]
async fn cmd_ping(
    host: Option<String>,
    port: Option<u16>,
    share: Option<String>,
    user: Option<String>,
    domain: Option<String>,
    config: Option<PathBuf>,
    count: usize,
) -> anyhow::Result<()> {
    let mut config = load_config(config)?;
    if let Some(host) = host {
        config.connection.host = host;
    }
    if port.is_some() {
        config.connection.port = port;
    }
    if share.is_some() {
        config.connection.share = share;
    }
    if let Some(user) = user {
        config.credentials.username = user;
    }
    if let Some(domain) = domain {
        config.credentials.domain = domain;
    }
    if config.credentials.password.is_empty() {
        eprintln!("Warning: no password configured (set CIFS_PASSWORD)");
    }

    let endpoint = match config.connection.port {
        Some(port) => Endpoint::with_port(config.connection.host.clone(), port),
        None => Endpoint::new(config.connection.host.clone()),
    };
    let credentials: Credentials = config.credentials.clone();
    let directory = SessionDirectory::new(config.connection.clone());

    let started = Instant::now();
    let session = directory
        .find_or_create_session(&endpoint, &credentials)
        .await?;
    println!(
        "Authenticated {} on {} in {:?} (session 0x{:016X}, signing: {})",
        session.identity(),
        endpoint,
        started.elapsed(),
        session.session_id(),
        session.is_signing()
    );

    for i in 0..count {
        let rtt = session.transport().echo().await?;
        println!("  echo {}: {:?}", i + 1, rtt);
    }

    if let Some(share) = config.connection.share.as_deref() {
        let tree = directory
            .find_or_create_tree_connection(&session, share)
            .await?;
        println!("Connected {} (tree 0x{:08X})", tree.path(), tree.tree_id());

        let reply = tree
            .send_request(Command::Request, Bytes::from_static(b"ping"))
            .await?;
        println!("  request: {} bytes back", reply.len());
        directory.release_tree_connection(&tree).await;
    }

    directory.release_session(&session).await;
    directory.shutdown().await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_serve(
    port: u16,
    host: String,
    config: Option<PathBuf>,
    users: Vec<String>,
    shares: Vec<String>,
    sign: bool,
    legacy: bool,
) -> anyhow::Result<()> {
    let mut server = match config {
        Some(path) => toml::from_str::<ServerConfig>(&std::fs::read_to_string(path)?)?,
        None => ServerConfig::default(),
    };
    let addr: std::net::SocketAddr = format!("{host}:{port}").parse()?;
    server = server.with_addr(addr);

    for spec in &users {
        let mut parts = spec.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(user), Some(domain), Some(password)) => {
                server = server.with_user(user, domain, password);
            }
            _ => anyhow::bail!("Invalid --user '{spec}', expected user:domain:password"),
        }
    }
    for share in &shares {
        server = server.with_share(share);
    }
    if sign {
        server = server.with_signing_required();
    }
    if legacy {
        server = server.without_extended_security();
    }

    tracing::info!(
        %addr,
        users = server.users.len(),
        shares = server.shares.len(),
        "Starting responder"
    );
    Responder::bind(server).await?.run().await?;
    Ok(())
}
