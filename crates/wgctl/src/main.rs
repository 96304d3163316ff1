//! wgctl: WireGuard peer registry control
//!
//! Host-side entry point for registry changes. The controller invokes
//! the same binary over SSH and decodes its exit status:
//!
//! | code | meaning            |
//! |------|--------------------|
//! | 0    | ok                 |
//! | 3    | duplicate peer     |
//! | 4    | already banned     |
//! | 5    | already active     |
//! | 6    | peer not found     |
//! | 7    | structural error   |
//! | 8    | daemon reload failed |
//! | 1    | anything else      |

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;
use wgctl_core::{
    AllowedIp, PeerEntry, PeerOp, ProvisionedKeyPair, PublicKey, Settings, StoreError, exit_code,
    increment_counter,
};

// Use mimalloc as the global allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// WireGuard peer registry control
#[derive(Parser)]
#[command(name = "wgctl", version, about, long_about = None)]
struct Cli {
    /// Settings file (TOML)
    #[arg(short, long, global = true, env = "WGCTL_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Change or list registry peers
    #[command(subcommand)]
    Peer(PeerCommands),

    /// Reload the VPN daemon without touching the registry
    Reload,

    /// Address counter file
    #[command(subcommand)]
    Counter(CounterCommands),

    /// Generate a key pair locally (private key, then public key)
    Keygen,

    /// Provision keys and an address on the VPN host and register the peer
    Onboard,
}

#[derive(Subcommand)]
enum PeerCommands {
    /// Append a new peer block
    Add {
        key: PublicKey,

        /// Allowed IP ranges (CIDR)
        #[arg(long = "allowed-ips", num_args = 1.., required = true)]
        allowed_ips: Vec<AllowedIp>,
    },

    /// Remove every block of a peer
    #[command(alias = "delete")]
    Del { key: PublicKey },

    /// Comment out a peer's block
    Ban { key: PublicKey },

    /// Restore a banned peer's block
    Unban { key: PublicKey },

    /// List peers
    List {
        /// Machine-readable output
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum CounterCommands {
    /// Increment the counter and print the new value
    Next {
        #[arg(long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e
                .downcast_ref::<StoreError>()
                .map_or(exit_code::FAILURE, StoreError::exit_code);
            error!("{:#}", e);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

/// Logs go to stderr; stdout carries command output only.
fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "wgctl=info,wgctl_core=info",
        1 => "wgctl=debug,wgctl_core=debug",
        _ => "wgctl=trace,wgctl_core=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load(cli.config.as_deref())?;
    debug!(registry = %settings.registry.path.display(), "Settings loaded");

    match cli.command {
        Commands::Peer(command) => peer(&settings, command).await,
        Commands::Reload => {
            settings.open_store()?.reload().await?;
            Ok(())
        }
        Commands::Counter(CounterCommands::Next { file }) => {
            let value = increment_counter(&file, settings.lock_timeout()).await?;
            println!("{value}");
            Ok(())
        }
        Commands::Keygen => {
            let pair = ProvisionedKeyPair::generate();
            println!("{}", pair.private.to_base64());
            println!("{}", pair.public);
            Ok(())
        }
        Commands::Onboard => {
            let control = settings.remote_control();
            let peer = settings
                .provisioner()
                .onboard(&settings.pool.network, &control)
                .await?;
            println!("PrivateKey = {}", peer.keys.private.to_base64());
            println!("PublicKey = {}", peer.keys.public);
            println!("Address = {}", peer.allowed_ip());
            Ok(())
        }
    }
}

async fn peer(settings: &Settings, command: PeerCommands) -> Result<()> {
    let store = settings.open_store()?;

    let (op, key) = match command {
        PeerCommands::Add { key, allowed_ips } => (PeerOp::Add(allowed_ips), key),
        PeerCommands::Del { key } => (PeerOp::Delete, key),
        PeerCommands::Ban { key } => (PeerOp::Ban, key),
        PeerCommands::Unban { key } => (PeerOp::Unban, key),
        PeerCommands::List { json } => {
            let peers = store.peers().await?;
            print_peers(&peers, json)?;
            return Ok(());
        }
    };

    store.apply(&op, &key).await?;
    Ok(())
}

fn print_peers(peers: &[PeerEntry], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(peers)?);
        return Ok(());
    }

    for peer in peers {
        let ips: Vec<String> = peer.allowed_ips.iter().map(ToString::to_string).collect();
        let state = if peer.enabled { "active" } else { "banned" };
        println!("{}\t{}\t{}", peer.public_key, ips.join(","), state);
    }
    Ok(())
}
