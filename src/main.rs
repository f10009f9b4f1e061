use anyhow::Result;
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

mod archive;
mod cache;
mod catalog;
mod chd;
mod check;
mod check_commands;
mod dat_parser;
mod db_commands;
mod detector;
mod detector_xml;
mod diagnostics;
mod fix;
mod hashes;
mod inspect_commands;
mod matcher;
mod memdb;
mod models;
mod scanner;
mod settings;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug output
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check rom sets against the database, fixing them if asked
    Check(check_commands::CheckArgs),

    /// List the entries of archives with sizes and hashes
    Inspect(inspect_commands::InspectArgs),

    /// Print database contents by game name, hash, or special key
    Dump(db_commands::DumpArgs),

    /// Perform a database operation
    Database {
        #[command(subcommand)]
        db_command: db_commands::DbCommands,

        /// Path to the database
        #[arg(short = 'D', long)]
        database: Option<Utf8PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Check(args) => check_commands::handle_command(args, cli.debug),
        Commands::Inspect(args) => inspect_commands::handle_command(args, cli.debug),
        Commands::Dump(args) => db_commands::handle_dump(args, cli.debug),
        Commands::Database {
            db_command,
            database,
        } => {
            let db_path = settings::resolve_db_path(database.clone());
            db_commands::handle_command(&db_path, cli.debug, db_command)
        }
    }
}
