//! CLI argument definitions

use std::path::PathBuf;

use capsule_core::LoadFlags;
use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "capsule")]
#[command(about = "Isolated link-map namespaces for shadow libraries", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build a capsule and show its namespace and exports
    Inspect(InspectArgs),

    /// Load a library through a capsule's shims
    Load(LoadArgs),

    /// List the objects of every link-map namespace in this process
    Images {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show version information
    Version,
}

#[derive(Args)]
pub struct InspectArgs {
    /// Shared object to isolate (path or soname)
    #[arg(short, long, required_unless_present = "config", conflicts_with = "config")]
    pub target: Option<PathBuf>,

    /// Symbol to export from the capsule (repeatable)
    #[arg(short, long = "export", value_name = "SYMBOL")]
    pub exports: Vec<String>,

    /// JSON capsule configuration
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Root of the host filesystem (e.g. /run/host)
    #[arg(long, value_name = "DIR")]
    pub prefix: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct LoadArgs {
    /// Shared object to isolate (path or soname)
    #[arg(short, long)]
    pub target: PathBuf,

    /// Library to load (path or soname)
    pub library: String,

    /// Loader flags, e.g. RTLD_NOW|RTLD_GLOBAL
    #[arg(short, long, default_value = "RTLD_NOW")]
    pub flags: LoadFlags,

    /// Load as the host would instead of from inside the capsule
    #[arg(long)]
    pub external: bool,

    /// Root of the host filesystem (e.g. /run/host)
    #[arg(long, value_name = "DIR")]
    pub prefix: Option<PathBuf>,
}
