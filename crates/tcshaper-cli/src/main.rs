//! Traffic shaping CLI
//!
//! Applies, lists and removes tc/iptables shaping rules through the
//! tcshaper reconciliation engine. Every invocation re-reads the live
//! state, so the tool can be pointed at hierarchies built by earlier
//! runs or other processes.

mod commands;

use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use commands::{cmd_del, cmd_set, cmd_show, DelArgs, SetArgs, ShowArgs};
use tcshaper::ShaperError;
use tracing::Level;

/// Validation problems exit with POSIX EINVAL so scripts can tell bad
/// input from a failed privileged command.
const EXIT_INVALID: i32 = 22;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a shaping rule to a device or container
    Set(SetArgs),

    /// Remove shaping rules
    Del(DelArgs),

    /// Show the active shaping rules as JSON
    Show(ShowArgs),
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let code = match error.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EXIT_INVALID,
            };
            let _ = error.print();
            std::process::exit(code);
        }
    };

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Set(args) => cmd_set(args).await,
        Commands::Del(args) => cmd_del(args).await,
        Commands::Show(args) => cmd_show(args).await,
    };

    if let Err(error) = result {
        eprintln!("error: {:#}", error);
        let code = match error.downcast_ref::<ShaperError>() {
            Some(shaper) if shaper.is_validation() => EXIT_INVALID,
            _ => 1,
        };
        std::process::exit(code);
    }
}
