// Back Office - maintenance CLI over the data directory
//
// Works directly on the JSON files; a running sync server picks the changes
// up through its watcher.

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use back_office_sync::logging::init_logging;
use back_office_sync::resources;
use back_office_sync::{
    snapshot_digest, DataStore, Inventory, JsonFileStore, KeywordExemption, LedgerEngine,
    SaleLine, SyncConfig,
};

#[derive(Parser, Debug)]
#[command(name = "back-office", version, about = "Back office data maintenance")]
struct Cli {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory (overrides the config file)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the ledger with running balances
    Ledger,
    /// Recompute running balances if the stored sequence is inconsistent
    Repair,
    /// Clear all ledger entries (fixed expense profile is kept)
    Reset {
        /// Only reset when today is the last day of the month
        #[arg(long)]
        month_end: bool,
    },
    /// Print the fixed expense profile
    Fixed,
    /// Move stock for a sale line
    Sale {
        #[arg(long)]
        product_id: String,
        #[arg(long)]
        quantity: i64,
        #[arg(long, default_value = "")]
        description: String,
        /// Put the quantity back instead (sale deleted)
        #[arg(long)]
        revert: bool,
    },
    /// Show every configured resource with its snapshot digest
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = SyncConfig::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    init_logging(&config.log_level)?;

    let store = Arc::new(
        JsonFileStore::open(&config.data_dir)
            .with_context(|| format!("Failed to open data directory {:?}", config.data_dir))?,
    );

    match cli.command {
        Command::Ledger => print_ledger(store).await,
        Command::Repair => {
            let ledger = LedgerEngine::new(store);
            if ledger.repair().await? {
                println!("🔧 Running balances recomputed");
            } else {
                println!("✓ Ledger is consistent");
            }
            Ok(())
        }
        Command::Reset { month_end } => {
            let ledger = LedgerEngine::new(store);
            if month_end {
                if ledger.reset_if_month_end(Local::now().date_naive()).await? {
                    println!("🗑️  Month end: ledger reset");
                } else {
                    println!("✓ Not the end of the month, nothing reset");
                }
            } else {
                ledger.reset_all().await?;
                println!("🗑️  Ledger reset");
            }
            Ok(())
        }
        Command::Fixed => {
            let profile = LedgerEngine::new(store).fixed_expenses().await?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
            Ok(())
        }
        Command::Sale {
            product_id,
            quantity,
            description,
            revert,
        } => {
            let policy = Arc::new(KeywordExemption::new(&config.stock_exempt_keyword));
            let inventory = Inventory::new(store, policy);
            let line = SaleLine {
                product_id,
                description,
                quantity_sold: quantity,
            };

            let outcome = if revert {
                inventory.revert_sale(&line).await?
            } else {
                inventory.apply_sale(&line).await?
            };
            match outcome {
                Some(quantity) => println!("📦 Product {} now at {}", line.product_id, quantity),
                None => println!("✓ Line exempt from stock, nothing moved"),
            }
            Ok(())
        }
        Command::Status => {
            print_status(store.as_ref(), &config);
            Ok(())
        }
    }
}

async fn print_ledger(store: Arc<JsonFileStore>) -> Result<()> {
    let entries = LedgerEngine::new(store).entries().await?;

    println!("📒 Ledger ({} entries)", entries.len());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for entry in &entries {
        println!(
            "{:>4}  {:<28} {:>10} {:>10} {:>10}",
            entry.id, entry.description, entry.debit, entry.credit, entry.balance
        );
    }
    Ok(())
}

fn print_status(store: &dyn DataStore, config: &SyncConfig) {
    println!("🔄 Resources in {:?}", config.data_dir);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for name in &config.resources {
        if !store.exists(name) {
            println!("  {:<16} missing", name);
            continue;
        }
        match store.read(name) {
            Ok(raw) => {
                let digest = snapshot_digest(&resources::materialize(name, raw));
                println!("  {:<16} {}", name, &digest[..12]);
            }
            Err(e) => println!("  {:<16} ❌ {}", name, e),
        }
    }
}
