use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use teamserver::{
    api::create_api_server,
    config::{default_data_dir, TeamServerConfig, PID_FILE},
    pidfile::PidFile,
    server::{initialize, InitOptions, TeamServer},
};
use teamserver_core::AuditAction;

const PURGE_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Parser)]
#[command(
    name = "teamserver",
    about = "Team access server: SSH certificate authority, access control and audit",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short,
        long,
        global = true,
        env = "TEAMSERVER_DATA_DIR",
        help = "Data directory (default ~/.teamserver)"
    )]
    data_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "Emit logs as JSON")]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Initialize a new data directory")]
    Init {
        #[arg(long, help = "Disable the SSH certificate authority")]
        no_ca: bool,

        #[arg(long, default_value = "127.0.0.1", help = "Listen address")]
        host: String,

        #[arg(long, default_value_t = 8443, help = "Listen port")]
        port: u16,
    },

    #[command(about = "Run the API server")]
    Start,

    #[command(about = "Verify the audit log hash chain")]
    VerifyAudit,

    #[command(about = "Print the CA public key for host configuration")]
    CaPublicKey,
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("teamserver=info".parse()?)
        .add_directive("teamserver_core=info".parse()?);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs)?;

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);

    match cli.command {
        Commands::Init { no_ca, host, port } => init(&data_dir, host, port, !no_ca).await,
        Commands::Start => start(&data_dir).await,
        Commands::VerifyAudit => verify_audit(&data_dir).await,
        Commands::CaPublicKey => ca_public_key(&data_dir).await,
    }
}

async fn init(data_dir: &Path, host: String, port: u16, ca_enabled: bool) -> Result<()> {
    let init = initialize(
        data_dir,
        InitOptions {
            host,
            port,
            ca_enabled,
        },
    )
    .await?;

    println!("{}", "Team server initialized".green().bold());
    println!("  data directory: {}", data_dir.display());
    println!();
    println!("{}", "Store these now; they are not shown again.".yellow());
    println!("  admin token: {}", init.admin_token.bold());
    println!("  master key:  {}", init.master_key.as_str().bold());
    if let Some(ca_key) = &init.ca_public_key {
        println!();
        println!("CA public key (add to TrustedUserCAKeys on hosts):");
        println!("  {}", ca_key);
    }
    Ok(())
}

fn load_config(data_dir: &Path) -> Result<TeamServerConfig> {
    if !TeamServerConfig::exists(data_dir) {
        bail!(
            "{} is not initialized; run `teamserver init` first",
            data_dir.display()
        );
    }
    let config = TeamServerConfig::load(data_dir)?;
    config.validate()?;
    Ok(config)
}

async fn start(data_dir: &Path) -> Result<()> {
    let config = load_config(data_dir)?;
    let pid_file = PidFile::acquire(&data_dir.join(PID_FILE))?;

    let server = Arc::new(TeamServer::open(&config, data_dir).await?);
    if config.ca.enabled && !server.ca.is_configured().await? {
        warn!("certificate authority enabled but no CA key is stored");
    }

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid listen address")?;
    let listener = TcpListener::bind(&addr).await?;

    server
        .record_lifecycle(AuditAction::ServerStart, &format!("listening on {}", addr))
        .await;
    info!(%addr, ca = config.ca.enabled, "team server listening");

    let shutdown = CancellationToken::new();
    let purge = tokio::spawn(purge_expired(server.clone(), shutdown.clone()));

    let app = create_api_server(server.clone());
    let serve_shutdown = shutdown.clone();
    let mut serve = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
        .await
    });

    tokio::select! {
        result = &mut serve => {
            shutdown.cancel();
            result?.context("server error")?;
        }
        _ = shutdown_signal() => {
            shutdown.cancel();
            let grace = Duration::from_secs(config.server.shutdown_grace_secs);
            match tokio::time::timeout(grace, &mut serve).await {
                Ok(result) => result?.context("server error")?,
                Err(_) => {
                    warn!(
                        grace_secs = grace.as_secs(),
                        "grace period elapsed, dropping in-flight requests"
                    );
                    serve.abort();
                }
            }
        }
    }

    if let Err(e) = purge.await {
        warn!(error = %e, "purge task ended abnormally");
    }
    server
        .record_lifecycle(AuditAction::ServerStop, "shutdown")
        .await;
    server.store.close().await;
    drop(pid_file);

    info!("team server stopped");
    Ok(())
}

async fn purge_expired(server: Arc<TeamServer>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(PURGE_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {
                match server.sessions.purge_expired().await {
                    Ok(0) => {}
                    Ok(purged) => info!(purged, "expired sessions and invites purged"),
                    Err(e) => warn!(error = %e, "purge of expired sessions failed"),
                }
                let tracked = server.rate_limiter.retain_recent();
                debug!(tracked, "rate limiter state trimmed");
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, starting graceful shutdown"),
        _ = terminate => info!("received SIGTERM, starting graceful shutdown"),
    }
}

async fn verify_audit(data_dir: &Path) -> Result<()> {
    let config = load_config(data_dir)?;
    let server = TeamServer::open(&config, data_dir).await?;
    let report = server.audit.verify().await?;
    server.store.close().await;

    if report.valid {
        println!(
            "{} ({} entries)",
            "audit chain valid".green().bold(),
            report.entries_checked
        );
        Ok(())
    } else {
        println!(
            "{} at entry index {}",
            "audit chain BROKEN".red().bold(),
            report
                .first_mismatch
                .map(|i| i.to_string())
                .unwrap_or_else(|| "?".to_string())
        );
        bail!("audit chain verification failed")
    }
}

async fn ca_public_key(data_dir: &Path) -> Result<()> {
    let config = load_config(data_dir)?;
    let server = TeamServer::open(&config, data_dir).await?;
    let key = server.ca.public_key().await?;
    server.store.close().await;

    match key {
        Some(key) => {
            println!("{}", key);
            Ok(())
        }
        None => bail!("no CA key configured (initialized with --no-ca)"),
    }
}
