//! svr-cli - back up, restore and delete a pin-protected master key
//!
//! usage:
//!   svr-cli --enclave-config enclave.json -u alice -p secret backup --pin 1234
//!   svr-cli --url ws://127.0.0.1:4300 --mr-enclave <hex> -u alice -p secret restore --pin 1234
//!   svr-cli --enclave-config enclave.json -u alice -p secret delete
//!
//! prints one json object per run. exits non-zero unless the operation
//! succeeded.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use svr::{
    AuthCredentials, BackupResponse, DeleteResponse, EnclaveIdentity, MasterKey, RestoreResponse,
    SecureValueRecovery, SecureValueRecoveryV2, ServiceUrl, SoftwareAttestation,
    StaticCredentials, SvrConfig, TungsteniteConnector,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "svr-cli")]
#[command(about = "secure value recovery client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// enclave identity json (mr_enclave + urls)
    #[arg(long, env = "SVR_ENCLAVE_CONFIG", conflicts_with_all = ["url", "mr_enclave"])]
    enclave_config: Option<PathBuf>,

    /// service url, used with --mr-enclave
    #[arg(long, requires = "mr_enclave")]
    url: Option<String>,

    /// expected enclave measurement, hex
    #[arg(long, requires = "url")]
    mr_enclave: Option<String>,

    /// alternate Host header for --url
    #[arg(long, requires = "url")]
    host_header: Option<String>,

    /// transport username (also the backup id)
    #[arg(short, long, env = "SVR_USERNAME")]
    username: String,

    /// transport password
    #[arg(short, long, env = "SVR_PASSWORD", hide_env_values = true)]
    password: String,

    /// connect and read timeout in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// retry network errors this many times
    #[arg(long, default_value = "0")]
    retries: u32,
}

#[derive(Subcommand)]
enum Commands {
    /// set a new pin, storing a master key behind it
    Backup {
        #[arg(long, env = "SVR_PIN", hide_env_values = true)]
        pin: String,

        /// master key to store, hex (default: freshly generated)
        #[arg(long)]
        master_key: Option<String>,

        /// guesses allowed before the backup is destroyed
        #[arg(long, default_value_t = svr::config::DEFAULT_MAX_TRIES)]
        max_tries: u32,
    },

    /// recover the master key with a pin
    Restore {
        #[arg(long, env = "SVR_PIN", hide_env_values = true)]
        pin: String,
    },

    /// delete the stored backup
    Delete,
}

#[derive(Debug, Serialize)]
struct Output {
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    master_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    registration_lock: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    recovery_password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tries_remaining: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Output {
    fn new(outcome: &'static str) -> Self {
        Self {
            outcome,
            master_key: None,
            registration_lock: None,
            recovery_password: None,
            tries_remaining: None,
            error: None,
        }
    }

    fn with_master_key(mut self, master_key: &MasterKey) -> Self {
        self.master_key = Some(master_key.to_hex());
        self.registration_lock = Some(hex::encode(master_key.derive_registration_lock()));
        self.recovery_password = Some(master_key.derive_registration_recovery_password());
        self
    }

    fn with_error(mut self, error: &svr::Error) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// expose failure still leaves the backup stored
    fn is_success(&self) -> bool {
        matches!(self.outcome, "success" | "expose_failure")
    }
}

fn load_enclave(cli: &Cli) -> anyhow::Result<EnclaveIdentity> {
    if let Some(path) = &cli.enclave_config {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        return serde_json::from_str(&json)
            .with_context(|| format!("invalid enclave config {}", path.display()));
    }

    match (&cli.url, &cli.mr_enclave) {
        (Some(url), Some(mr_enclave)) => {
            let mut service = ServiceUrl::new(url);
            if let Some(host) = &cli.host_header {
                service = service.with_host_header(host);
            }
            Ok(EnclaveIdentity::from_hex(mr_enclave, vec![service])?)
        }
        _ => bail!("pass --enclave-config or --url with --mr-enclave"),
    }
}

fn build_client(cli: &Cli, max_tries: u32) -> anyhow::Result<SecureValueRecoveryV2> {
    let enclave = load_enclave(cli)?;
    let credentials = AuthCredentials::new(&cli.username, &cli.password);
    let config = SvrConfig {
        max_tries,
        connect_timeout: Duration::from_secs(cli.timeout),
        read_timeout: Duration::from_secs(cli.timeout),
    };

    Ok(SecureValueRecoveryV2::new(
        enclave,
        Arc::new(TungsteniteConnector),
        Arc::new(SoftwareAttestation),
        Arc::new(StaticCredentials(credentials)),
    )
    .with_config(config))
}

async fn backup(
    client: &SecureValueRecoveryV2,
    pin: &str,
    master_key: MasterKey,
    retries: u32,
) -> Output {
    let mut session = client.set_pin(pin, master_key);
    let mut attempt = 0;
    loop {
        match session.execute().await {
            BackupResponse::NetworkError(e) if attempt < retries => {
                attempt += 1;
                warn!(attempt, "backup hit a network error, retrying: {}", e);
            }
            BackupResponse::Success(master_key) => {
                return Output::new("success").with_master_key(&master_key)
            }
            // stored but not restorable; the key is still worth printing
            BackupResponse::ExposeFailure => {
                return Output::new("expose_failure").with_master_key(session.master_key())
            }
            BackupResponse::EnclaveNotFound => return Output::new("enclave_not_found"),
            BackupResponse::ServerRejected => return Output::new("server_rejected"),
            BackupResponse::NetworkError(e) => return Output::new("network_error").with_error(&e),
            BackupResponse::ApplicationError(e) => {
                return Output::new("application_error").with_error(&e)
            }
        }
    }
}

async fn restore(client: &SecureValueRecoveryV2, pin: &str, retries: u32) -> Output {
    let mut attempt = 0;
    loop {
        match client.restore_data_post_registration(pin).await {
            RestoreResponse::NetworkError(e) if attempt < retries => {
                attempt += 1;
                warn!(attempt, "restore hit a network error, retrying: {}", e);
            }
            RestoreResponse::Success(master_key) => {
                return Output::new("success").with_master_key(&master_key)
            }
            RestoreResponse::Missing => return Output::new("missing"),
            RestoreResponse::PinMismatch { tries_remaining } => {
                let mut output = Output::new("pin_mismatch");
                output.tries_remaining = Some(tries_remaining);
                return output;
            }
            RestoreResponse::EnclaveNotFound => return Output::new("enclave_not_found"),
            RestoreResponse::NetworkError(e) => return Output::new("network_error").with_error(&e),
            RestoreResponse::ApplicationError(e) => {
                return Output::new("application_error").with_error(&e)
            }
        }
    }
}

async fn delete(client: &SecureValueRecoveryV2, retries: u32) -> Output {
    let mut attempt = 0;
    loop {
        match client.delete_data().await {
            DeleteResponse::NetworkError(e) if attempt < retries => {
                attempt += 1;
                warn!(attempt, "delete hit a network error, retrying: {}", e);
            }
            DeleteResponse::Success => return Output::new("success"),
            DeleteResponse::EnclaveNotFound => return Output::new("enclave_not_found"),
            DeleteResponse::ServerRejected => return Output::new("server_rejected"),
            DeleteResponse::NetworkError(e) => return Output::new("network_error").with_error(&e),
            DeleteResponse::ApplicationError(e) => {
                return Output::new("application_error").with_error(&e)
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "svr_cli=info,svr=warn".into()),
        )
        .init();

    let cli = Cli::parse();

    let output = match &cli.command {
        Commands::Backup {
            pin,
            master_key,
            max_tries,
        } => {
            let client = build_client(&cli, *max_tries)?;
            let master_key = match master_key {
                Some(key_hex) => MasterKey::from_hex(key_hex)?,
                None => MasterKey::generate(),
            };
            info!(enclave = %client.enclave().mr_enclave_hex(), "backing up master key");
            backup(&client, pin, master_key, cli.retries).await
        }
        Commands::Restore { pin } => {
            let client = build_client(&cli, svr::config::DEFAULT_MAX_TRIES)?;
            info!(enclave = %client.enclave().mr_enclave_hex(), "restoring master key");
            restore(&client, pin, cli.retries).await
        }
        Commands::Delete => {
            let client = build_client(&cli, svr::config::DEFAULT_MAX_TRIES)?;
            info!(enclave = %client.enclave().mr_enclave_hex(), "deleting backup");
            delete(&client, cli.retries).await
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    if !output.is_success() {
        bail!("{} failed: {}", command_name(&cli.command), output.outcome);
    }
    Ok(())
}

fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Backup { .. } => "backup",
        Commands::Restore { .. } => "restore",
        Commands::Delete => "delete",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_enclave_from_flags() {
        let mr = "11".repeat(32);
        let cli = Cli::try_parse_from([
            "svr-cli",
            "--url",
            "wss://192.0.2.1",
            "--mr-enclave",
            &mr,
            "--host-header",
            "svr.example.org",
            "-u",
            "alice",
            "-p",
            "pw",
            "delete",
        ])
        .unwrap();

        let enclave = load_enclave(&cli).unwrap();
        assert_eq!(enclave.mr_enclave(), &[0x11; 32]);
        assert_eq!(enclave.urls()[0].host_header.as_deref(), Some("svr.example.org"));
    }

    #[test]
    fn test_enclave_source_required() {
        let cli = Cli::try_parse_from(["svr-cli", "-u", "alice", "-p", "pw", "delete"]).unwrap();
        assert!(load_enclave(&cli).is_err());
    }

    #[test]
    fn test_expose_failure_counts_as_stored() {
        assert!(Output::new("expose_failure").is_success());
        assert!(!Output::new("pin_mismatch").is_success());
    }
}
