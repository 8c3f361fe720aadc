//! Inspect command implementation

use anyhow::{Context, Result};
use capsule_boundary::Capsule;
use capsule_core::{AddressRange, NamespaceId};
use capsule_namespace::{CapsuleConfig, ExportEntry};
use serde::Serialize;
use tracing::info;

use crate::cli::InspectArgs;

#[derive(Serialize)]
struct InspectReport {
    target: String,
    image: String,
    namespace: NamespaceId,
    range: AddressRange,
    allocators: usize,
    provenance: bool,
    exports: Vec<ExportEntry>,
}

pub fn execute(args: &InspectArgs) -> Result<()> {
    let config = build_config(args)?;
    let target = config.target.display().to_string();

    let capsule = Capsule::create(config)
        .with_context(|| format!("Failed to create capsule for {target}"))?;
    info!(target_library = %target, "Capsule ready");

    let report = InspectReport {
        target,
        image: capsule.image().display_name().to_string(),
        namespace: capsule.namespace().id(),
        range: capsule.image().range,
        allocators: capsule.dispatcher().instances(),
        provenance: capsule.dispatcher().provenance_enabled(),
        exports: capsule.exports().entries(),
    };

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        );
    } else {
        print_report(&report);
    }
    Ok(())
}

fn build_config(args: &InspectArgs) -> Result<CapsuleConfig> {
    let mut config = match (&args.config, &args.target) {
        (Some(path), _) => CapsuleConfig::from_file(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?,
        (None, Some(target)) => CapsuleConfig::new(target),
        (None, None) => anyhow::bail!("Either --target or --config is required"),
    };

    config = config.with_exports(args.exports.iter().cloned());
    if let Some(ref prefix) = args.prefix {
        config = config.with_prefix(prefix);
    }

    config.validate().context("Invalid capsule configuration")?;
    Ok(config)
}

fn print_report(report: &InspectReport) {
    println!("\n🔒 Capsule for {}", report.target);
    println!("{:-<60}", "");
    println!("Namespace:  {}", report.namespace);
    println!("Image:      {}", report.image);
    println!("Range:      {}", report.range);
    println!(
        "Allocators: {} ({})",
        report.allocators,
        if report.provenance {
            "provenance enabled"
        } else {
            "caller's allocator only"
        }
    );

    println!("\nExports ({}):", report.exports.len());
    for export in &report.exports {
        println!("  {:<40} {:#x}", export.name, export.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn args(target: Option<&str>, config: Option<PathBuf>) -> InspectArgs {
        InspectArgs {
            target: target.map(PathBuf::from),
            exports: vec!["cos".to_string()],
            config,
            prefix: None,
            json: false,
        }
    }

    #[test]
    fn test_config_from_flags() {
        let config = build_config(&args(Some("libm.so.6"), None)).unwrap();

        assert_eq!(config.target, PathBuf::from("libm.so.6"));
        assert_eq!(config.exports, vec!["cos"]);
    }

    #[test]
    fn test_config_file_merges_exports() {
        let path = std::env::temp_dir().join(format!("capsule-inspect-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"target": "libm.so.6", "exports": ["sin"]}"#).unwrap();

        let config = build_config(&args(None, Some(path.clone()))).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.exports, vec!["sin", "cos"]);
    }

    #[test]
    fn test_missing_target_and_config() {
        assert!(build_config(&args(None, None)).is_err());
    }

    #[test]
    fn test_relative_prefix_rejected() {
        let mut args = args(Some("libm.so.6"), None);
        args.prefix = Some(PathBuf::from("run/host"));

        let err = build_config(&args).unwrap_err();
        assert!(format!("{err:#}").contains("Prefix must be absolute"));
    }
}
