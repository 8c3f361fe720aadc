use capsule_core::*;
use std::time::SystemTime;

#[test]
fn test_load_flags_serialization() {
    let flags = LoadFlags::NOW | LoadFlags::GLOBAL;

    let json = serde_json::to_string(&flags).unwrap();
    assert_eq!(json, (libc::RTLD_NOW | libc::RTLD_GLOBAL).to_string());

    let deserialized: LoadFlags = serde_json::from_str(&json).unwrap();
    assert_eq!(flags, deserialized);
}

#[test]
fn test_load_flags_strip_preserves_unknown_bits() {
    let raw = libc::RTLD_LAZY | libc::RTLD_GLOBAL | 0x0100_0000;
    let flags = LoadFlags::from_bits(raw).without(LoadFlags::GLOBAL);

    assert_eq!(flags.bits(), libc::RTLD_LAZY | 0x0100_0000);
}

#[test]
fn test_every_global_combination_can_be_stripped() {
    let others = [
        LoadFlags::LAZY,
        LoadFlags::NOW,
        LoadFlags::NOLOAD,
        LoadFlags::DEEPBIND,
        LoadFlags::NODELETE,
    ];

    for mask in 0u32..(1 << others.len()) {
        let mut flags = LoadFlags::GLOBAL;
        for (i, flag) in others.iter().enumerate() {
            if mask & (1 << i) != 0 {
                flags = flags | *flag;
            }
        }

        let stripped = flags.without(LoadFlags::GLOBAL);
        assert!(!stripped.intersects(LoadFlags::GLOBAL));
        assert_eq!(stripped | LoadFlags::GLOBAL, flags);
    }
}

#[test]
fn test_namespace_id_serialization() {
    let id = NamespaceId::from_raw(2);
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, "2");

    let deserialized: NamespaceId = serde_json::from_str(&json).unwrap();
    assert_eq!(id, deserialized);
}

#[test]
fn test_loaded_image_contains() {
    let image = LoadedImage {
        name: "/lib/libshadow.so".to_string(),
        base: 0x10_000,
        range: AddressRange::new(0x10_000, 0x20_000),
    };

    assert!(image.contains(0x10_000));
    assert!(image.contains(0x1f_fff));
    assert!(!image.contains(0x20_000));
    assert!(image.to_string().ends_with("/lib/libshadow.so"));
}

#[test]
fn test_event_timestamp() {
    let now = SystemTime::now();
    let event = BoundaryEvent::SlotsPatched {
        object: "libfoo.so".to_string(),
        slots: 2,
        timestamp: now,
    };

    assert_eq!(event.timestamp(), now);
    assert_eq!(event.to_string(), "2 slot(s) rewritten in libfoo.so");
}

#[test]
fn test_error_types() {
    let err = Error::InvalidConfig {
        message: "empty export list".to_string(),
    };
    assert!(err.to_string().contains("empty export list"));

    let io: Error = std::io::Error::other("boom").into();
    assert!(matches!(io, Error::Io(_)));
}
