use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use agentkernel_ctl::config::PlatformConfig;
use agentkernel_ctl::http_api::{self, AppState};
use agentkernel_ctl::lifecycle::LifecycleCoordinator;
use agentkernel_ctl::lock::{InMemoryDistributedLock, NullDistributedLock};
use agentkernel_ctl::orchestrator::InMemoryOrchestrator;
use agentkernel_ctl::proxy::v1::proxy_resume_server::ProxyResumeServer;
use agentkernel_ctl::proxy_service::ProxyResumeService;
use agentkernel_ctl::resume::ResumeCoordinator;
use agentkernel_ctl::store::InMemoryStore;
use agentkernel_ctl::template_manager::InMemoryTemplateManager;

#[derive(Parser)]
#[command(name = "agentkernel-ctl")]
#[command(about = "Control-plane API for a microVM sandbox platform")]
#[command(version)]
struct Cli {
    /// Path to a platform config TOML file; defaults built in when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP and gRPC control-plane servers.
    Serve {
        /// Host to bind the HTTP API to.
        #[arg(long, default_value = "127.0.0.1")]
        http_host: String,
        /// Port to bind the HTTP API to.
        #[arg(long, default_value = "8080")]
        http_port: u16,
        /// Host to bind the gRPC proxy resume service to.
        #[arg(long, default_value = "127.0.0.1")]
        grpc_host: String,
        /// Port to bind the gRPC proxy resume service to.
        #[arg(long, default_value = "8081")]
        grpc_port: u16,
        /// Disable the distributed lock (single-node / demo deployments).
        #[arg(long)]
        no_lock: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<PlatformConfig> {
    match path {
        Some(path) => PlatformConfig::from_file(path),
        None => Ok(PlatformConfig::default()),
    }
}

fn signing_key() -> Vec<u8> {
    std::env::var("AGENTKERNEL_SIGNING_KEY")
        .map(|s| s.into_bytes())
        .unwrap_or_else(|_| {
            tracing::warn!("AGENTKERNEL_SIGNING_KEY not set; using an ephemeral signing key for this process only");
            uuid::Uuid::new_v4().as_bytes().to_vec()
        })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Serve {
            http_host,
            http_port,
            grpc_host,
            grpc_port,
            no_lock,
        } => {
            let store = InMemoryStore::new();
            let orchestrator = InMemoryOrchestrator::new();
            let cache = Arc::new(agentkernel_ctl::cache::TemplateCache::new());
            let lock: Arc<dyn agentkernel_ctl::lock::DistributedLock> = if no_lock {
                NullDistributedLock::new()
            } else {
                InMemoryDistributedLock::new()
            };
            let key = signing_key();

            let lifecycle = Arc::new(LifecycleCoordinator::new(store.clone(), orchestrator.clone(), cache.clone(), config.clone(), key));
            let resume = Arc::new(ResumeCoordinator::new(store.clone(), orchestrator.clone(), lock, lifecycle.clone(), config.clone()));

            let http_addr: SocketAddr = format!("{http_host}:{http_port}").parse()?;
            let grpc_addr: SocketAddr = format!("{grpc_host}:{grpc_port}").parse()?;

            let http_state = Arc::new(AppState {
                store,
                orchestrator,
                cache,
                lifecycle,
                template_manager: InMemoryTemplateManager::new(),
                logs: Arc::new(agentkernel_ctl::logs::LogsBridge::new()),
                config,
            });

            let http = tokio::spawn(http_api::run_server(http_addr, http_state));
            let grpc = tokio::spawn(async move {
                tracing::info!(%grpc_addr, "grpc proxy resume service listening");
                tonic::transport::Server::builder()
                    .add_service(ProxyResumeServer::new(ProxyResumeService::new(resume)))
                    .serve(grpc_addr)
                    .await
            });

            tokio::select! {
                res = http => res??,
                res = grpc => res??,
            }
        }
    }

    Ok(())
}
