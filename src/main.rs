//! GoDoxy Agent - stream tunnels and HTTPS API behind one mTLS port

mod api;

use agent_cert::{create_agent_pki, PemKeyPair};
use agent_pool::AgentConfig;
use agent_stream::{
    AlpnMux, ClientAuth, ClientCredentials, MuxListener, MuxListeners, StreamError,
    TcpTunnelServer, TunnelServerConfig, UdpTunnelServer,
};
use anyhow::{Context, Result};
use axum::Router;
use clap::{Args, Parser, Subcommand};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

const CA_CERT_FILE: &str = "ca.pem";
const CLIENT_CERT_FILE: &str = "client.pem";
const CLIENT_KEY_FILE: &str = "client-key.pem";

/// GoDoxy Agent - expose local TCP/UDP services to a GoDoxy control plane
#[derive(Parser, Debug)]
#[command(name = "godoxy-agent")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Shorthand for --log-level debug
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    serve: ServeArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent (default)
    Serve,

    /// Generate certificates for a new agent
    #[command(long_about = r#"
Generate a fresh CA, server and client certificate set for one agent.

The agent side settings are printed as environment variables. The control
plane side (CA certificate plus client pair) is written to --out-dir.

EXAMPLES:
  godoxy-agent new-agent --name nas --out-dir ./certs/nas
    "#)]
    NewAgent {
        /// Agent name
        #[arg(long)]
        name: String,

        /// Agent port
        #[arg(long, default_value = "8890")]
        port: u16,

        /// Directory for the control plane certificate files
        #[arg(long, default_value = "certs")]
        out_dir: PathBuf,
    },

    /// Check which stream tunnels an agent accepts
    Probe {
        /// Agent address (e.g., 10.0.0.5:8890)
        addr: SocketAddr,

        /// Directory holding the files written by new-agent
        #[arg(long, default_value = "certs")]
        certs_dir: PathBuf,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Port for both the TCP mux and the UDP endpoint
    #[arg(long, env = "AGENT_PORT", default_value = "8890")]
    port: u16,

    /// Agent name (defaults to the hostname)
    #[arg(long, env = "AGENT_NAME")]
    name: Option<String>,

    /// CA pair, base64 encoded as produced by new-agent
    #[arg(long, env = "AGENT_CA_CERT", hide_env_values = true)]
    ca_cert: Option<String>,

    /// Server pair, base64 encoded as produced by new-agent
    #[arg(long, env = "AGENT_SSL_CERT", hide_env_values = true)]
    ssl_cert: Option<String>,

    /// Accept clients without a certificate (insecure)
    #[arg(long, env = "AGENT_SKIP_CLIENT_CERT_CHECK")]
    skip_client_cert_check: bool,
}

fn init_logging(log_level: &str, verbose: bool) -> Result<()> {
    let log_level = if verbose { "debug" } else { log_level };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    Ok(())
}

fn default_agent_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "agent".to_string())
}

fn load_pair(value: Option<String>, env_name: &str) -> Result<PemKeyPair> {
    let value = value.with_context(|| format!("{} is not set", env_name))?;
    value
        .parse::<PemKeyPair>()
        .with_context(|| format!("Failed to load {}", env_name))
}

async fn serve(args: ServeArgs) -> Result<()> {
    let ca = load_pair(args.ca_cert, "AGENT_CA_CERT")?;
    let server = load_pair(args.ssl_cert, "AGENT_SSL_CERT")?;
    let name = args.name.unwrap_or_else(default_agent_name);

    let bind_addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let mut config = TunnelServerConfig::from_pem(bind_addr, &ca, &server)?;
    if args.skip_client_cert_check {
        warn!("⚠️  Client certificate check disabled (insecure mode)");
        config = config.with_client_auth(ClientAuth::None);
    }

    info!("GoDoxy Agent version {} ({})", env!("GIT_TAG"), env!("GIT_HASH"));
    info!("Agent name: {}", name);
    info!("Agent port: {}", args.port);

    let cancel = CancellationToken::new();
    let (mux, MuxListeners { stream, https }) = AlpnMux::bind(&config, cancel.clone()).await?;
    let local_addr = mux.local_addr();

    let tcp = Arc::new(TcpTunnelServer::from_mux(
        stream,
        cancel.clone(),
        config.dial_timeout,
    ));
    let udp = Arc::new(UdpTunnelServer::bind(
        &config.with_bind_addr(local_addr),
        cancel.clone(),
    )?);

    let mut tasks = JoinSet::new();
    tasks.spawn(async move { mux.run().await.context("ALPN mux stopped") });
    {
        let tcp = tcp.clone();
        tasks.spawn(async move { tcp.start().await.context("TCP stream server stopped") });
    }
    info!(port = local_addr.port(), "TCP stream server started");
    {
        let udp = udp.clone();
        tasks.spawn(async move { udp.start().await.context("UDP stream server stopped") });
    }
    info!(port = local_addr.port(), "UDP stream server started");
    tasks.spawn(serve_https(
        https,
        api::router(api::AgentInfo::new(name)),
        cancel.clone(),
    ));
    info!(port = local_addr.port(), "HTTPS API server started");

    let mut result = Ok(());
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        Some(joined) = tasks.join_next() => {
            result = match joined {
                Ok(Ok(())) => Err(anyhow::anyhow!("a server task stopped unexpectedly")),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(e.into()),
            };
        }
    }

    cancel.cancel();
    tcp.close();
    udp.close();

    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Err(e)) => warn!("{:#}", e),
                Err(e) => warn!("Server task panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("Shutdown timed out, abandoning remaining tasks");
    }

    info!("GoDoxy Agent stopped");
    result
}

/// Serve HTTP/1.1 and HTTP/2 on connections routed to the API
async fn serve_https(
    mut listener: MuxListener,
    app: Router,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(StreamError::Closed) => return Ok(()),
                Err(e) => return Err(e.into()),
            },
        };

        let service = TowerToHyperService::new(app.clone());
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let builder = auto::Builder::new(TokioExecutor::new());
            let conn = builder.serve_connection(TokioIo::new(stream), service);
            tokio::select! {
                result = conn => {
                    if let Err(e) = result {
                        debug!(remote = %peer, "HTTPS connection error: {}", e);
                    }
                }
                _ = cancel.cancelled() => {}
            }
        });
    }
}

fn new_agent(name: &str, port: u16, out_dir: &Path) -> Result<()> {
    let pki = create_agent_pki().context("Failed to generate agent certificates")?;

    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;
    std::fs::write(out_dir.join(CA_CERT_FILE), &pki.ca.cert)
        .context("Failed to write CA certificate")?;
    pki.client
        .save_to_files(out_dir.join(CLIENT_CERT_FILE), out_dir.join(CLIENT_KEY_FILE))
        .context("Failed to write client certificate")?;

    info!(agent = %name, dir = %out_dir.display(), "Control plane certificates written");

    println!("AGENT_NAME={}", name);
    println!("AGENT_PORT={}", port);
    println!("AGENT_CA_CERT={}", pki.ca.encode());
    println!("AGENT_SSL_CERT={}", pki.server.encode());
    Ok(())
}

fn load_credentials(dir: &Path) -> Result<ClientCredentials> {
    let read = |file: &str| {
        let path = dir.join(file);
        std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))
    };

    // The control plane never holds the CA key
    let ca = PemKeyPair::new(read(CA_CERT_FILE)?, Vec::new());
    let client = PemKeyPair::new(read(CLIENT_CERT_FILE)?, read(CLIENT_KEY_FILE)?);
    Ok(ClientCredentials::from_pem(&ca, &client)?)
}

async fn probe(addr: SocketAddr, certs_dir: &Path) -> Result<()> {
    let creds = load_credentials(certs_dir)?;
    let mut agent = AgentConfig::new(addr.to_string(), addr, &creds)?;
    agent.init().await;

    let status = |ok: bool| if ok { "ok" } else { "unavailable" };
    println!("TCP stream: {}", status(agent.supports_tcp_stream()));
    println!("UDP stream: {}", status(agent.supports_udp_stream()));

    if !agent.supports_tcp_stream() && !agent.supports_udp_stream() {
        anyhow::bail!("agent {} accepts no stream tunnels", addr);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.verbose)?;

    let result = match cli.command {
        Some(Commands::Serve) | None => serve(cli.serve).await,
        Some(Commands::NewAgent {
            name,
            port,
            out_dir,
        }) => new_agent(&name, port, &out_dir),
        Some(Commands::Probe { addr, certs_dir }) => probe(addr, &certs_dir).await,
    };

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}
