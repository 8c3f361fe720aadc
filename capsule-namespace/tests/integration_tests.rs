use capsule_core::Error;
use capsule_namespace::*;

#[test]
fn test_config_from_json() {
    let config = CapsuleConfig::from_json(
        r#"{
            "target": "/usr/lib/libGLX.so.0",
            "exports": ["glXGetProcAddress", "glXGetProcAddressARB"],
            "prefix": "/run/host"
        }"#,
    )
    .unwrap();

    assert_eq!(config.exports.len(), 2);
    assert!(config.target_is_path());
}

#[test]
fn test_config_from_json_rejects_invalid() {
    let err = CapsuleConfig::from_json(r#"{"target": "", "exports": []}"#).unwrap_err();
    assert!(matches!(err, Error::InvalidConfig { .. }));

    let err = CapsuleConfig::from_json("not json").unwrap_err();
    assert!(matches!(err, Error::Json(_)));
}

#[test]
fn test_nonexistent_target_never_resolves_exports() {
    let config = CapsuleConfig::from_static("/nonexistent/libshadow.so", &["shadow_call"]);
    let result = NamespaceLoader::new(&config).load();

    assert!(matches!(result, Err(Error::Load { .. })));
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
mod glibc {
    use super::*;
    use std::sync::OnceLock;

    // Every namespace holds a libc copy in static TLS, which only has room
    // for a few, so the whole binary shares one.
    fn libm() -> &'static LoadedTarget {
        static LIBM: OnceLock<LoadedTarget> = OnceLock::new();
        LIBM.get_or_init(|| {
            NamespaceLoader::new(&CapsuleConfig::new("libm.so.6"))
                .load()
                .unwrap()
        })
    }

    fn resolve(exports: &[&str]) -> capsule_core::Result<ExportTable> {
        let config = CapsuleConfig::from_static("libm.so.6", exports);
        ExportTable::resolve(&config, &libm().namespace, &libm().image)
    }

    #[test]
    fn test_exports_resolve_inside_shadow_library() {
        let table = resolve(&["cos", "sin", "sqrt"]).unwrap();

        assert_eq!(table.len(), 3);
        for (name, address) in table.iter() {
            assert_ne!(address, 0, "{name} resolved to null");
            assert!(libm().image.contains(address), "{name} outside shadow library");
        }

        let host_cos = capsule_namespace::dl::default_symbol(c"cos");
        if let Some(host_cos) = host_cos {
            assert_ne!(table.address("cos"), Some(host_cos.as_ptr() as usize));
        }
    }

    #[test]
    fn test_missing_export_is_reported() {
        let err = resolve(&["cos", "capsule_no_such_symbol"]).unwrap_err();

        assert!(err.to_string().contains("capsule_no_such_symbol"));
    }

    #[test]
    fn test_dependency_symbol_is_not_an_export() {
        // `malloc` is visible through libm's scope but lives in the capsule's libc.
        let err = resolve(&["malloc"]).unwrap_err();

        assert!(matches!(err, Error::MissingSymbol { .. }));
    }

    #[test]
    fn test_libc_counted_in_every_namespace() {
        let loaded = libm();
        let handle = loaded.namespace.handle();

        assert!(capsule_namespace::images::count_named("libc.so", &[handle]) >= 2);
        let chains = capsule_namespace::dl::namespace_chains(&[handle]);
        assert!(chains.len() >= 2);
        assert!(
            chains
                .iter()
                .flatten()
                .any(|entry| entry.base == loaded.image.base)
        );
    }

    #[test]
    fn test_target_described_from_own_headers() {
        let loaded = libm();
        let entry = capsule_namespace::dl::link_map_entry(loaded.namespace.handle()).unwrap();

        let segments = capsule_namespace::images::segments_of(&entry).unwrap();
        assert_eq!(segments.image, loaded.image);
        assert_eq!(segments.dynamic, Some(entry.dynamic));
        assert!(segments.relro.is_some());
    }

    #[test]
    fn test_namespace_chain_is_separate() {
        let chain = libm().namespace.link_maps();

        assert!(chain.iter().any(|entry| entry.file_name().starts_with("libm")));
        assert!(chain.iter().any(|entry| entry.file_name().starts_with("libc.so")));
    }
}
