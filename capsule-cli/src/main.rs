//! Capsule CLI
//!
//! Loads shadow libraries into isolated namespaces and reports what the
//! boundary sees.

use clap::Parser;
use std::process;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;

use cli::{Cli, Commands};

fn main() {
    // Parse command-line arguments
    let cli = Cli::parse();

    // Logs go to stderr so JSON output stays parseable
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Inspect(args) => commands::inspect::execute(&args),
        Commands::Load(args) => commands::load::execute(&args),
        Commands::Images { json } => commands::images::execute(json),
        Commands::Version => {
            print_version();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("❌ Error: {e:#}");
        process::exit(1);
    }
}

fn print_version() {
    println!("🦀 Capsule");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Edition: Rust 2024");
    println!();
    println!("Features:");
    println!(
        "  • Link-map namespaces: {}",
        if capsule_namespace::dl::namespaces_available() {
            "available"
        } else {
            "unavailable"
        }
    );
    println!("  • Eager export tables");
    println!("  • Namespace-confined dlopen");
    println!("  • Allocator provenance dispatch");
}
