//! Integration tests for cio-agent
//!
//! These tests verify the adapter's public behavior without requiring a
//! real cio backend (which would need actual storage hardware). Tests focus
//! on the tag schema, size accounting, device-path rules, and error
//! surfaces of the library API.

use std::collections::HashMap;

use uuid::Uuid;

use cio_agent::cio::tags::{
    CLUSTER_ID_LABEL, DATASET_ID_LABEL, METADATA_VERSION, METADATA_VERSION_LABEL, VolumeTags,
};
use cio_agent::device::{ALLOCATION_UNIT, DeviceError, expected_device_path, size_to_gib};
use cio_agent::proto;

// ============================================================================
// Tag schema
// ============================================================================

/// Every volume the agent creates carries all three labels
#[test]
fn test_created_volume_tags_are_complete() {
    let tags = VolumeTags::new(Uuid::new_v4(), Uuid::new_v4());
    let map: HashMap<String, String> = tags.to_pairs().into_iter().collect();

    assert_eq!(map.len(), 3);
    assert!(map.contains_key(DATASET_ID_LABEL));
    assert!(map.contains_key(CLUSTER_ID_LABEL));
    assert_eq!(
        map.get(METADATA_VERSION_LABEL).map(String::as_str),
        Some(METADATA_VERSION)
    );
}

/// Tags written by one agent must be readable by another
#[test]
fn test_tag_round_trip() {
    let written = VolumeTags::new(Uuid::new_v4(), Uuid::new_v4());
    let map: HashMap<String, String> = written.to_pairs().into_iter().collect();

    let read = VolumeTags::from_tags(&map).unwrap().unwrap();
    assert_eq!(read, written);
}

/// Vdisks without our labels belong to someone else and are not an error
#[test]
fn test_foreign_vdisk_tags_are_ignored() {
    let mut map = HashMap::new();
    map.insert("backup-policy".to_string(), "nightly".to_string());

    assert!(VolumeTags::from_tags(&map).unwrap().is_none());
}

/// A half-written label set is corrupt, not foreign
#[test]
fn test_partial_tags_are_corrupt() {
    let mut map = HashMap::new();
    map.insert(CLUSTER_ID_LABEL.to_string(), Uuid::new_v4().to_string());

    assert!(VolumeTags::from_tags(&map).is_err());
}

// ============================================================================
// Size accounting
// ============================================================================

/// The allocation unit is what the orchestrator sizes datasets in
#[test]
fn test_allocation_unit() {
    assert_eq!(ALLOCATION_UNIT, 8 * 1024 * 1024 * 1024);
}

/// Requested bytes are rounded up to whole GiB for the backend
#[test]
fn test_size_rounding() {
    let gib: u64 = 1024 * 1024 * 1024;

    assert_eq!(size_to_gib(1), 1);
    assert_eq!(size_to_gib(gib), 1);
    assert_eq!(size_to_gib(gib + 1), 2);
    assert_eq!(size_to_gib(ALLOCATION_UNIT), 8);
    // A full allocation unit plus a byte spills into the next GiB
    assert_eq!(size_to_gib(ALLOCATION_UNIT + 1), 9);
}

// ============================================================================
// Device-path rules
// ============================================================================

/// Device nodes are derived from the vdisk id
#[test]
fn test_device_path_derivation() {
    assert_eq!(expected_device_path("vd0"), "/dev/vdisk/vd0");
    assert_eq!(expected_device_path("vd128"), "/dev/vdisk/vd128");
}

// ============================================================================
// Error surfaces
// ============================================================================

/// Error messages carry enough context to debug a stuck convergence loop
#[test]
fn test_error_messages_identify_the_volume() {
    let errors = vec![
        DeviceError::UnknownVolume("vd7".to_string()),
        DeviceError::AlreadyAttached("vd7".to_string()),
        DeviceError::Unattached("vd7".to_string()),
        DeviceError::AttachedElsewhere {
            blockdevice_id: "vd7".to_string(),
            attached_to: "i-0aaa".to_string(),
            instance: "i-0bbb".to_string(),
        },
        DeviceError::UnexpectedDevice {
            blockdevice_id: "vd7".to_string(),
            expected: "/dev/vdisk/vd7".to_string(),
            discovered: "/dev/vdisk/vd9".to_string(),
        },
        DeviceError::Timeout {
            blockdevice_id: "vd7".to_string(),
            operation: "attach",
            waited_secs: 120,
        },
    ];

    for err in errors {
        assert!(
            err.to_string().contains("vd7"),
            "error '{}' should name the volume",
            err
        );
    }
}

// ============================================================================
// Wire types
// ============================================================================

/// Detached volumes are encoded with an empty attached_to
#[test]
fn test_proto_volume_detached_encoding() {
    let volume = proto::Volume {
        blockdevice_id: "vd1".to_string(),
        size_bytes: ALLOCATION_UNIT,
        attached_to: String::new(),
        dataset_id: Uuid::new_v4().to_string(),
    };

    assert!(volume.attached_to.is_empty());
    assert_eq!(volume.size_bytes, ALLOCATION_UNIT);
}
