//! Load command implementation

use std::ffi::CString;
use std::ptr::NonNull;

use anyhow::{Context, Result};
use capsule_boundary::{BoundaryShims, Capsule, CapsuleShims};
use capsule_namespace::{CapsuleConfig, dl};
use tracing::debug;

use crate::cli::LoadArgs;

pub fn execute(args: &LoadArgs) -> Result<()> {
    let mut config = CapsuleConfig::new(&args.target);
    if let Some(ref prefix) = args.prefix {
        config = config.with_prefix(prefix);
    }
    config.validate().context("Invalid capsule configuration")?;

    let capsule = Capsule::create(config)
        .with_context(|| format!("Failed to create capsule for {}", args.target.display()))?;
    let library = CString::new(args.library.as_str()).context("Library name contains a NUL byte")?;

    // Downgrade warnings go straight to stderr.
    let shims = CapsuleShims::new(&capsule);
    debug!(library = %args.library, flags = %args.flags, external = args.external, "Loading");

    // SAFETY: running the library's constructors is what was asked for.
    let handle = unsafe {
        if args.external {
            shims.external_load(Some(&library), args.flags)
        } else {
            shims.internal_load(Some(&library), args.flags)
        }
    };

    let Some(handle) = NonNull::new(handle) else {
        let message = dl::take_error().unwrap_or_else(|| "unknown loader error".to_string());
        anyhow::bail!("Failed to load {}: {message}", args.library);
    };

    let namespace = dl::namespace_of(handle)
        .map_or_else(|| "unknown namespace".to_string(), |id| id.to_string());
    println!("✅ Loaded {} into {namespace}", args.library);
    println!(
        "   {}",
        if capsule.owns_handle(handle) {
            "confined to the capsule"
        } else {
            "visible to the host"
        }
    );
    Ok(())
}
