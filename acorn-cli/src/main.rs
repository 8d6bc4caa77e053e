//! Command-line front end over an on-disk append-log store. JSON in, JSON
//! out; exit code 0 on success, 1 on any error.

use std::path::PathBuf;
use std::sync::Arc;

use acorn_core::Tree;
use acorn_trunk_log::AppendLogTrunk;
use clap::{Parser, Subcommand};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Parser)]
#[command(name = "acorn", about = "AcornDB command line")]
struct Cli {
    /// Store directory (created on first use).
    #[arg(long, default_value = "./acorn-data")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store a JSON document under an id.
    Stash { id: String, json: String },
    /// Print the current document for an id.
    Crack { id: String },
    /// Tombstone an id.
    Toss { id: String },
    /// Print every retained version of an id, oldest first.
    History { id: String },
    /// Print the change feed, optionally since an RFC 3339 instant.
    Export {
        #[arg(long)]
        since: Option<String>,
    },
    /// Compact the log and cut a fresh snapshot.
    Smush,
    /// Print store counters.
    Stats,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let trunk = Arc::new(AppendLogTrunk::open(&cli.dir)?);
    let tree: Tree<Value> = Tree::open(Arc::clone(&trunk))?;

    match cli.command {
        Command::Stash { id, json } => {
            let value: Value = serde_json::from_str(&json)?;
            tree.stash_with(&id, value)?;
            println!("stashed {id}");
        }
        Command::Crack { id } => match tree.crack(&id)? {
            Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            None => anyhow::bail!("no record for {id}"),
        },
        Command::Toss { id } => {
            tree.toss(&id)?;
            println!("tossed {id}");
        }
        Command::History { id } => {
            for nut in tree.get_history(&id)? {
                let when = nut.timestamp.format(&Rfc3339)?;
                if nut.deleted {
                    println!("v{} {} tombstone", nut.version, when);
                } else {
                    println!(
                        "v{} {} {}",
                        nut.version,
                        when,
                        serde_json::to_string(&nut.payload)?
                    );
                }
            }
        }
        Command::Export { since } => {
            let since = since
                .map(|raw| OffsetDateTime::parse(&raw, &Rfc3339))
                .transpose()?;
            let nuts = tree.export_changes_since(since)?;
            println!("{}", serde_json::to_string_pretty(&nuts)?);
        }
        Command::Smush => {
            trunk.smush()?;
            println!("smushed, snapshot {}", trunk.snapshot_sequence());
        }
        Command::Stats => {
            println!("{}", serde_json::to_string_pretty(&tree.stats())?);
        }
    }

    tree.close()?;
    Ok(())
}
