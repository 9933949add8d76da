//! chainstate CLI — inspect and manage persisted indexer state.
//!
//! Usage:
//! ```bash
//! chainstate status  ./index.db
//! chainstate filters ./index.db my-indexer
//! chainstate reset   ./index.db my-indexer
//! chainstate info
//! ```

use std::env;
use std::process;

use anyhow::{bail, Context};
use serde_json::Value;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chainstate_core::StateConfig;
use chainstate_storage::filter::{list_filters, reset_filters};
use chainstate_storage::journal::{count_entries, ensure_journal_table, entries, reset_journal};
use chainstate_storage::schema::stored_version;
use chainstate_storage::{checkpoint, commit, reorg, StateDb, CURRENT_SCHEMA_VERSION};

#[tokio::main]
async fn main() {
    init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let rest = &args[2..];
    let result = match args[1].as_str() {
        "status" => cmd_status(rest).await,
        "filters" => cmd_filters(rest).await,
        "reorgs" => cmd_reorgs(rest).await,
        "journal" => cmd_journal(rest).await,
        "reset" => cmd_reset(rest).await,
        "info" => {
            cmd_info();
            Ok(())
        }
        "version" | "--version" | "-V" => {
            println!("chainstate {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

/// Logs go to stderr; `RUST_LOG` overrides the default `info` level.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_usage() {
    println!("chainstate {}", env!("CARGO_PKG_VERSION"));
    println!("Reorg-consistent indexing state engine\n");
    println!("USAGE:");
    println!("    chainstate <COMMAND> [ARGS]\n");
    println!("COMMANDS:");
    println!("    status  <db> [id]  Show schema version, checkpoints and journal sizes");
    println!("    filters <db> <id>  Show the filter version history of an indexer");
    println!("    reorgs  <db> <id>  Show recorded chain reorganizations");
    println!("    journal <db> <id>  Show pending change-journal entries");
    println!("    reset   <db> <id>  Delete checkpoint, filters and journal of an indexer");
    println!("    info               Show default configuration");
    println!("    version            Print version");
    println!("    help               Print this help");
}

/// `<db> <id>` positional arguments.
fn db_and_id(args: &[String]) -> anyhow::Result<(&str, &str)> {
    match args {
        [db, id, ..] => Ok((db.as_str(), id.as_str())),
        _ => bail!("expected <db> <id>"),
    }
}

/// Open `path` and make sure it holds chainstate state.
async fn open(path: &str) -> anyhow::Result<StateDb> {
    let db = StateDb::open(path).await?;
    let mut conn = db.pool().acquire().await?;
    match stored_version(&mut conn).await? {
        Some(_) => {
            drop(conn);
            Ok(db)
        }
        None => bail!("{path} has no chainstate state (never initialized)"),
    }
}

async fn cmd_status(args: &[String]) -> anyhow::Result<()> {
    let Some(path) = args.first() else {
        bail!("expected <db> [id]");
    };
    let only = args.get(1).map(String::as_str);

    let db = open(path).await?;
    let mut conn = db.pool().acquire().await?;
    let version = stored_version(&mut conn).await?.unwrap_or(0);
    println!("Schema version: {version} (supported: {CURRENT_SCHEMA_VERSION})");

    ensure_journal_table(&mut conn).await?;
    let checkpoints = checkpoint::list_checkpoints(&mut conn).await?;
    let mut shown = 0;
    for cp in checkpoints.iter().filter(|cp| only.map_or(true, |id| cp.indexer_id == id)) {
        let journal = count_entries(&mut conn, &cp.indexer_id).await?;
        println!("  {:<24} cursor {:<24} journal {journal}", cp.indexer_id, cp.cursor.to_string());
        shown += 1;
    }
    if shown == 0 {
        println!("  (no checkpoints)");
    }
    Ok(())
}

async fn cmd_filters(args: &[String]) -> anyhow::Result<()> {
    let (path, id) = db_and_id(args)?;
    let db = open(path).await?;
    let mut conn = db.pool().acquire().await?;

    let versions = list_filters::<Value>(&mut conn, id).await?;
    if versions.is_empty() {
        println!("No filter versions for '{id}'");
    }
    for v in versions {
        let to = v.to_block.map_or_else(|| "active".to_string(), |b| b.to_string());
        println!("  [{} .. {to}) {}", v.from_block, v.filter);
    }
    Ok(())
}

async fn cmd_reorgs(args: &[String]) -> anyhow::Result<()> {
    let (path, id) = db_and_id(args)?;
    let db = open(path).await?;
    let mut conn = db.pool().acquire().await?;

    let records = reorg::list_reorgs(&mut conn, id).await?;
    if records.is_empty() {
        println!("No chain reorganizations recorded for '{id}'");
    }
    for r in records {
        let at = chrono::DateTime::from_timestamp(r.recorded_at, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| r.recorded_at.to_string());
        println!("  {at}  {} -> {}  (depth {})", r.old_head, r.new_head, r.depth());
    }
    Ok(())
}

async fn cmd_journal(args: &[String]) -> anyhow::Result<()> {
    let (path, id) = db_and_id(args)?;
    let db = open(path).await?;
    let mut conn = db.pool().acquire().await?;
    ensure_journal_table(&mut conn).await?;

    let log = entries(&mut conn, id).await?;
    println!("{} journal entries for '{id}'", log.len());
    for e in log {
        let row_id = e.row_id.map(|v| v.to_string()).unwrap_or_default();
        println!(
            "  #{:<8} {} {:<24} block {:<10} id {row_id}",
            e.sequence,
            e.op.code(),
            e.table_name,
            e.order_key
        );
    }
    Ok(())
}

async fn cmd_reset(args: &[String]) -> anyhow::Result<()> {
    let (path, id) = db_and_id(args)?;
    let db = open(path).await?;

    let mut tx = db.begin().await?;
    ensure_journal_table(&mut tx).await?;
    checkpoint::reset_checkpoint(&mut tx, id).await?;
    reset_filters(&mut tx, id).await?;
    reset_journal(&mut tx, id).await?;
    commit(tx).await.with_context(|| format!("reset '{id}'"))?;

    tracing::info!(indexer_id = id, "indexer state reset");
    println!("Reset '{id}': checkpoint, filters and journal deleted (consumer tables untouched)");
    Ok(())
}

fn cmd_info() {
    let defaults = StateConfig::default();
    println!("ChainState v{}", env!("CARGO_PKG_VERSION"));
    println!("  State schema version: {CURRENT_SCHEMA_VERSION}");
    println!("  Default indexer name: {}", defaults.indexer_name);
    println!("  Persist state: {}", defaults.persist_state);
    println!(
        "  Init retries: {} attempts, {}ms linear backoff",
        defaults.init_max_attempts, defaults.init_retry_delay_ms
    );
    println!("  Storage backend: SQLite (file or in-memory)");
}
