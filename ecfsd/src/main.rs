//! ecfsd: CSI plugin daemon for ECFS NFS volumes.

mod config;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use libecfs::backend::{MemoryBackend, RestConnector};
use libecfs::mount::HostMounter;
use libecfs::transport::client::CsiClient;
use libecfs::transport::server::CsiServer;
use libecfs::{
    ControllerConfig, ControllerServer, CsiController, CsiNode, NodeServer, Plugin, Session,
};
use rustls::crypto::ring;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{BackendKind, Config, Role};

#[derive(Parser, Debug)]
#[command(name = "ecfsd", version)]
#[command(about = "CSI plugin for ECFS NFS volumes")]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the CSI services over QUIC.
    Serve(ServeArgs),
    /// Query a running plugin's identity and readiness.
    Probe(ProbeArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long)]
    endpoint: Option<SocketAddr>,

    /// Services to run.
    #[arg(long, value_enum)]
    role: Option<Role>,

    /// Node ID reported by the node service.
    #[arg(long)]
    node_id: Option<String>,

    /// PEM certificate chain.
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// PEM private key.
    #[arg(long)]
    tls_key: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ProbeArgs {
    /// Address of the plugin.
    #[arg(long)]
    endpoint: SocketAddr,

    /// Name the plugin's certificate is issued for.
    #[arg(long, default_value = "localhost")]
    server_name: String,

    /// PEM CA certificate(s) to trust.
    #[arg(long)]
    ca: PathBuf,

    /// Seconds to wait for each answer.
    #[arg(long, default_value_t = 10)]
    timeout: u64,
}

fn init_tracing(verbose: u8, json: bool) {
    // Dependencies (quinn, rustls, reqwest) stay at warn unless RUST_LOG says
    // otherwise.
    let filter = match verbose {
        0 => "ecfsd=info,libecfs=info,warn",
        1 => "ecfsd=debug,libecfs=debug,warn",
        2 => "ecfsd=trace,libecfs=trace,warn",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Probe(args) => probe(args).await,
    }
}

fn resolve_config(args: ServeArgs) -> Result<Config> {
    let mut config = Config::load(args.config.as_deref())?;
    config.apply_env(|key| std::env::var(key).ok());
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }
    if let Some(role) = args.role {
        config.role = role;
    }
    if args.node_id.is_some() {
        config.node_id = args.node_id;
    }
    if let Some(cert) = args.tls_cert {
        config.tls.cert = cert;
    }
    if let Some(key) = args.tls_key {
        config.tls.key = key;
    }
    config.validate()?;
    Ok(config)
}

fn build_controller(config: &Config) -> Arc<dyn CsiController> {
    let controller_config = ControllerConfig {
        nfs_server: config.nfs_server.clone(),
        default_capacity_bytes: config.default_capacity_bytes,
    };
    match config.backend.kind {
        BackendKind::Rest => {
            let session = Session::new(RestConnector::new(config.backend.rest()));
            Arc::new(ControllerServer::new(Arc::new(session), controller_config))
        }
        BackendKind::Memory => {
            let session = Session::new(Arc::new(MemoryBackend::new()));
            Arc::new(ControllerServer::new(Arc::new(session), controller_config))
        }
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = resolve_config(args)?;

    let controller = config.role.controller().then(|| build_controller(&config));
    let node = if config.role.node() {
        let node: Arc<dyn CsiNode> = Arc::new(NodeServer::new(
            Arc::new(HostMounter::new()),
            config.node_id()?,
            config.nfs_server.clone(),
        ));
        Some(node)
    } else {
        None
    };
    let plugin = Arc::new(Plugin::new(controller, node));

    let tls = server_tls(&config.tls.cert, &config.tls.key)?;
    let server = CsiServer::new(config.endpoint, tls, plugin)?;
    info!(
        endpoint = %config.endpoint,
        role = ?config.role,
        backend = ?config.backend.kind,
        version = env!("CARGO_PKG_VERSION"),
        "starting ECFS CSI plugin"
    );

    tokio::select! {
        result = server.serve() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            server.endpoint().close(0u32.into(), b"shutdown");
        }
    }
    Ok(())
}

async fn probe(args: ProbeArgs) -> Result<()> {
    let tls = client_tls(&args.ca)?;
    let client = CsiClient::connect(args.endpoint, &args.server_name, tls)
        .await?
        .with_timeout(Duration::from_secs(args.timeout));
    let (info, ready) = client.probe().await?;
    client.close();
    println!("{} {} ready={ready}", info.name, info.vendor_version);
    anyhow::ensure!(ready, "plugin at {} is not ready", args.endpoint);
    Ok(())
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_file_iter(path)
        .with_context(|| format!("Failed to open certificate file {}", path.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificates in {}", path.display()))?;
    anyhow::ensure!(!certs.is_empty(), "no certificates in {}", path.display());
    Ok(certs)
}

fn server_tls(cert: &Path, key: &Path) -> Result<rustls::ServerConfig> {
    let certs = load_certs(cert)?;
    let key = PrivateKeyDer::from_pem_file(key)
        .with_context(|| format!("Failed to load private key {}", key.display()))?;
    let config = rustls::ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 is unavailable")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Invalid TLS certificate or key")?;
    Ok(config)
}

fn client_tls(ca: &Path) -> Result<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in load_certs(ca)? {
        roots.add(cert).context("Invalid CA certificate")?;
    }
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 is unavailable")?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(config)
}
