//! Images command implementation

use anyhow::{Context, Result};
use capsule_core::{LoadedImage, NamespaceId};
use capsule_namespace::{dl, images};
use serde::Serialize;

#[derive(Serialize)]
struct NamespaceImages {
    namespace: Option<NamespaceId>,
    images: Vec<LoadedImage>,
}

fn collect() -> Vec<NamespaceImages> {
    dl::namespace_chains(&[])
        .into_iter()
        .map(|chain| {
            let namespace = chain
                .first()
                .and_then(|head| std::ptr::NonNull::new(head.node as *mut std::ffi::c_void))
                .and_then(dl::namespace_of);
            let images = chain
                .iter()
                .filter_map(images::segments_of)
                .map(|segments| segments.image)
                .collect();
            NamespaceImages { namespace, images }
        })
        .collect()
}

pub fn execute(json: bool) -> Result<()> {
    let namespaces = collect();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&namespaces).context("Failed to serialize images")?
        );
        return Ok(());
    }

    let total: usize = namespaces.iter().map(|ns| ns.images.len()).sum();
    println!("\n📦 Loaded images ({total})");
    for ns in &namespaces {
        let label = ns
            .namespace
            .map_or_else(|| "unknown namespace".to_string(), |id| id.to_string());
        println!("\n{label}");
        println!("{:-<60}", "");
        for image in &ns.images {
            println!("{:<37} {}", image.range.to_string(), image.display_name());
        }
    }
    Ok(())
}
