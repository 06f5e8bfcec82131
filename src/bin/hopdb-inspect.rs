use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use hopdb::store::{EmbeddedStore, FileStore, NodeRecord, RecordValue, IDGEN_RECORD};
use hopdb::Result;

/// Read-only inspector for an embedded node store directory.
#[derive(Parser)]
#[command(name = "hopdb-inspect", version, about)]
struct Args {
    /// Directory holding the node records.
    dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List every record id with its prototype and name.
    List,
    /// Print one record.
    Get {
        /// Node id.
        id: String,
    },
    /// Show the id generator state.
    Idgen,
}

fn print_section(title: &str) {
    println!();
    println!("─── {} {}", title, "─".repeat(55usize.saturating_sub(title.len())));
}

fn print_field(name: &str, value: impl std::fmt::Display) {
    println!("  {:.<30} {}", name, value);
}

fn describe(value: &RecordValue) -> String {
    match value {
        RecordValue::Node(key) => format!("-> {key}"),
        RecordValue::Opaque(bytes) => format!("<{} bytes> {}", bytes.len(), hex::encode(&bytes[..bytes.len().min(16)])),
        other => other.clone().into_value().to_text(),
    }
}

fn cmd_list(store: &FileStore) -> Result<()> {
    print_section("Records");
    let ids = store.ids()?;
    for id in &ids {
        if id == IDGEN_RECORD {
            continue;
        }
        let Some(bytes) = store.get(id)? else { continue };
        let record = NodeRecord::from_bytes(&bytes)?;
        println!(
            "  {:<12} {:<20} {}",
            record.id,
            record.prototype.as_deref().unwrap_or("-"),
            record.name.as_deref().unwrap_or("")
        );
    }
    println!();
    print_field("Total", ids.iter().filter(|id| *id != IDGEN_RECORD).count());
    Ok(())
}

fn cmd_get(store: &FileStore, id: &str) -> Result<()> {
    let Some(bytes) = store.get(id)? else {
        eprintln!("no record {id}");
        process::exit(1);
    };
    let record = NodeRecord::from_bytes(&bytes)?;
    print_section("Node");
    print_field("Id", &record.id);
    print_field("Name", record.name.as_deref().unwrap_or("-"));
    print_field("Prototype", record.prototype.as_deref().unwrap_or("-"));
    print_field(
        "Parent",
        record.parent.as_ref().map_or_else(|| "-".to_owned(), ToString::to_string),
    );
    print_field("Anonymous", record.anonymous);
    print_field("Created", record.created);
    print_field("Last Modified", record.last_modified);

    print_section("Properties");
    for (name, value) in &record.properties {
        print_field(name, describe(value));
    }

    print_section("Children");
    for key in &record.subnodes {
        println!("  {key}");
    }
    println!();
    Ok(())
}

fn cmd_idgen(store: &FileStore) -> Result<()> {
    print_section("Id Generator");
    match store.get(IDGEN_RECORD)? {
        Some(bytes) => {
            let idgen = hopdb::idgen::IdGenerator::from_record(Some(&bytes))?;
            print_field("Last Issued", idgen.current());
        }
        None => print_field("Last Issued", "none (fresh store)"),
    }
    println!();
    Ok(())
}

fn run(args: Args) -> Result<()> {
    let store = FileStore::open(&args.dir)?;
    match args.command {
        Command::List => cmd_list(&store),
        Command::Get { id } => cmd_get(&store, &id),
        Command::Idgen => cmd_idgen(&store),
    }
}

fn main() {
    if let Err(err) = run(Args::parse()) {
        eprintln!("error: {err}");
        process::exit(1);
    }
}
