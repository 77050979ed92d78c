//! svr-dev-enclave - software enclave for local development
//!
//! usage:
//!   svr-dev-enclave --port 4300
//!   svr-dev-enclave --mr-enclave <hex> --write-config enclave.json
//!
//! records are kept in memory and lost on exit.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use svr::{EnclaveIdentity, ServiceUrl, SoftwareEnclave};
use svr_dev_enclave::{router, AppState};
use tracing::{info, warn};

/// svr-dev-enclave - software enclave behind a local websocket
#[derive(Parser)]
#[command(name = "svr-dev-enclave")]
#[command(about = "software svr enclave for local development")]
#[command(version)]
struct Args {
    /// port to listen on
    #[arg(short, long, default_value = "4300")]
    port: u16,

    /// bind address
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: String,

    /// measurement to claim, hex (default: random)
    #[arg(long, env = "SVR_MR_ENCLAVE")]
    mr_enclave: Option<String>,

    /// write an enclave identity json for clients to this path
    #[arg(long)]
    write_config: Option<std::path::PathBuf>,

    /// answer every expose with ERROR
    #[arg(long)]
    refuse_expose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("svr_dev_enclave=info".parse()?)
                .add_directive("svr=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mr_enclave: [u8; 32] = match &args.mr_enclave {
        Some(hex_str) => hex::decode(hex_str)
            .context("mr_enclave is not hex")?
            .try_into()
            .map_err(|_| anyhow::anyhow!("mr_enclave must be 32 bytes"))?,
        None => svr::crypto::random_bytes(),
    };

    let enclave = SoftwareEnclave::new(mr_enclave);
    enclave.set_refuse_expose(args.refuse_expose);

    let addr = format!("{}:{}", args.bind, args.port);
    info!("svr-dev-enclave v{}", env!("CARGO_PKG_VERSION"));
    info!("  mr_enclave: {}", hex::encode(mr_enclave));
    info!("  bind: {}", addr);
    warn!("software enclave has no hardware isolation - use only for testing");
    if args.refuse_expose {
        warn!("refusing every expose request");
    }

    if let Some(path) = &args.write_config {
        let identity =
            EnclaveIdentity::new(mr_enclave, vec![ServiceUrl::new(format!("ws://{addr}"))])?;
        std::fs::write(path, serde_json::to_string_pretty(&identity)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("  wrote enclave config to {}", path.display());
    }

    let app = router(Arc::new(AppState::new(enclave)));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("listening on {}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
