use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use anyhow::Result;

use paylink::{
    allocator::{Allocator, Bucket},
    config,
    derivation::CHANGE_EXTERNAL,
    invitations::{Direction, InvitationStatus, InvitationStore},
    metrics,
    reconcile::{self, ReconciliationWorker, SpoolClient, StoreFeed},
    storage,
    wallet::RootWallet,
};

#[derive(Parser)]
#[command(author, version, about = "paylink — payment invitation reconciliation engine")]
struct Cli {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Show routine reconciliation logs
    #[arg(long, default_value_t = false)]
    verbose_sync: bool,

    #[command(subcommand)]
    cmd: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the reconciliation daemon
    Run,
    /// Print the current receive address
    Address,
    /// Print the allocation summary (last issued index, gap count)
    Summary,
    /// List invitations, optionally filtered by status
    Invitations {
        #[arg(long)]
        status: Option<String>,
    },
    /// Create an outbound payment invitation
    Invite {
        /// Contact identity (phone hash, handle)
        #[arg(long)]
        to: String,
        /// Amount in satoshis
        #[arg(long)]
        sats: u64,
        /// Fee in satoshis
        #[arg(long, default_value_t = 0)]
        fee: u64,
    },
    /// Cancel an invitation, freeing its reserved index if unconfirmed
    Cancel {
        #[arg(long)]
        id: String,
    },
}

fn parse_status(s: &str) -> Option<InvitationStatus> {
    match s {
        "not_sent" => Some(InvitationStatus::NotSent),
        "request_sent" => Some(InvitationStatus::RequestSent),
        "address_sent" => Some(InvitationStatus::AddressSent),
        "request_received" => Some(InvitationStatus::RequestReceived),
        "address_provided" => Some(InvitationStatus::AddressProvided),
        "completed" => Some(InvitationStatus::Completed),
        "canceled" => Some(InvitationStatus::Canceled),
        "expired" => Some(InvitationStatus::Expired),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.verbose_sync {
        reconcile::set_routine_logging(true);
    }

    // Try reading config from the CLI path, else fall back to the embedded default
    let mut cfg = match config::load(&cli.config) {
        Ok(c) => c,
        Err(e1) => {
            const EMBEDDED_CONFIG: &str = include_str!("../config.toml");
            match config::load_from_str(EMBEDDED_CONFIG) {
                Ok(c) => {
                    eprintln!("⚠️  Could not read config from '{}' ({}); using embedded defaults", cli.config, e1);
                    c
                }
                Err(e2) => {
                    return Err(anyhow::anyhow!("failed to load configuration: {} / {}", e1, e2))
                }
            }
        }
    };

    // Resolve storage path: if relative, place under the user's home directory
    if std::path::Path::new(&cfg.storage.path).is_relative() {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        let abs = std::path::Path::new(&home)
            .join(".paylink")
            .join(&cfg.storage.path);
        cfg.storage.path = abs.to_string_lossy().into_owned();
    }

    let db = storage::open(&cfg.storage)?;
    println!("🗄️  Database opened at '{}'", cfg.storage.path);

    let wallet = RootWallet::load_or_create(db.clone())?;
    let bucket = Bucket {
        coin_type: cfg.wallet.coin_type,
        account: cfg.wallet.account,
        change: CHANGE_EXTERNAL,
    };
    let allocator = Arc::new(Allocator::open(
        db.clone(),
        wallet.key_source(),
        cfg.wallet.purpose,
        bucket,
    )?);
    let invitations = Arc::new(InvitationStore::new(db.clone()));

    match &cli.cmd {
        None | Some(Cmd::Run) => {
            metrics::serve(cfg.metrics.clone())?;

            let client = SpoolClient::new(&cfg.reconcile.spool_dir)?;
            let feed = StoreFeed::new(db.clone());
            let worker = ReconciliationWorker::new(
                db.clone(),
                allocator.clone(),
                invitations.clone(),
                client,
                feed,
                &cfg.wallet,
                &cfg.reconcile,
            );

            let (shutdown_tx, _) = broadcast::channel::<()>(1);
            let (_trigger_tx, trigger_rx) = mpsc::channel::<()>(8);
            let handle = reconcile::spawn(
                worker,
                cfg.reconcile.interval_secs,
                trigger_rx,
                shutdown_tx.subscribe(),
            );

            println!("🔄 Reconciliation daemon running (interval {}s). Ctrl-C to stop.", cfg.reconcile.interval_secs);
            signal::ctrl_c().await?;
            let _ = shutdown_tx.send(());
            let _ = handle.await;
            db.close()?;
        }
        Some(Cmd::Address) => {
            let derived = allocator.current_receive_address()?;
            println!("{}  ({})", derived.address, derived.path);
        }
        Some(Cmd::Summary) => {
            let summary = allocator.summary()?;
            println!(
                "last issued index: {}\ngap count: {}\nreserved count: {}",
                summary.last_issued_index, summary.gap_count, summary.reserved_count
            );
        }
        Some(Cmd::Invitations { status }) => {
            let list = match status.as_deref().map(parse_status) {
                Some(Some(st)) => invitations.with_status(st)?,
                Some(None) => {
                    anyhow::bail!("unknown status filter; expected e.g. 'address_sent' or 'completed'")
                }
                None => invitations.all()?,
            };
            for inv in list {
                println!(
                    "{}  {:?}  {:?}  {} sats  to {}  addr {}  txid {}",
                    inv.id,
                    inv.direction,
                    inv.status,
                    inv.btc_sats,
                    inv.counterparty,
                    inv.address.as_deref().unwrap_or("-"),
                    inv.txid.as_deref().unwrap_or("-"),
                );
            }
        }
        Some(Cmd::Invite { to, sats, fee }) => {
            let inv = invitations.create(Direction::Sent, to, *sats, *fee)?;
            let inv = invitations.mark_request_sent(&inv.id)?;
            println!("✉️  Created invitation {} ({:?})", inv.id, inv.status);
        }
        Some(Cmd::Cancel { id }) => {
            if let Some(freed) = invitations.cancel(id)? {
                allocator.free_index(freed)?;
                println!("🧹 Canceled {} and freed index {}", id, freed);
            } else {
                println!("🧹 Canceled {}", id);
            }
        }
    }

    Ok(())
}
