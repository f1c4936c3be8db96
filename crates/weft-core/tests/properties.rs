//! Property-based tests for the protocol types
//!
//! These tests verify:
//!  - Legacy attributes always normalize to the current format
//!  - Normalization is idempotent
//!  - Package paths survive the `pkg` encoding
//!  - Tree lookups find what was inserted

use proptest::prelude::*;
use weft_core::attributes::{ChannelAttributes, PackagePath, SNAPSHOT_FORMAT_VERSION};
use weft_core::tree::SnapshotTree;

fn identifier_strategy() -> impl Strategy<Value = String> {
    "[A-Za-z][A-Za-z0-9_-]{0,12}"
}

fn package_strategy() -> impl Strategy<Value = PackagePath> {
    prop::collection::vec(identifier_strategy(), 1..5)
        .prop_map(|segments| PackagePath::new(segments).unwrap())
}

// ============================================================================
// Attribute Normalization
// ============================================================================

proptest! {
    #[test]
    fn legacy_pkg_normalizes_to_single_segment(name in identifier_strategy()) {
        let blob = serde_json::json!({ "pkg": name }).to_string();
        let attributes = ChannelAttributes::parse(blob.as_bytes()).unwrap();

        prop_assert_eq!(attributes.snapshot_format_version.as_deref(), Some(SNAPSHOT_FORMAT_VERSION));
        let package = attributes.package().unwrap();
        prop_assert_eq!(package.segments(), &[name.clone()][..]);
        prop_assert_eq!(attributes.channel_type, Some(name));
    }

    #[test]
    fn normalization_is_idempotent(package in package_strategy()) {
        let attributes = ChannelAttributes::new(&package).unwrap();
        let once = attributes.clone().normalize().unwrap();
        let twice = once.clone().normalize().unwrap();
        prop_assert_eq!(&once, &twice);
        prop_assert_eq!(once, attributes);
    }

    #[test]
    fn stored_attributes_reproduce_package(package in package_strategy(), seq in 0u64..1000) {
        let attributes = ChannelAttributes::new(&package)
            .unwrap()
            .with_sequence_numbers(seq, seq / 2);
        let parsed = ChannelAttributes::parse(&attributes.to_bytes().unwrap()).unwrap();

        prop_assert_eq!(parsed.package().unwrap(), package.clone());
        prop_assert_eq!(parsed.channel_type.as_deref(), Some(package.channel_type()));
        prop_assert_eq!(parsed.sequence_number, Some(seq));
    }
}

// ============================================================================
// Snapshot Tree Lookup
// ============================================================================

proptest! {
    #[test]
    fn nested_blobs_are_found(
        dirs in prop::collection::vec(identifier_strategy(), 0..4),
        name in identifier_strategy(),
        contents in prop::collection::vec(any::<u8>(), 0..64)
    ) {
        let mut tree = SnapshotTree::new();
        tree.add_blob(name.clone(), contents.clone());
        for dir in dirs.iter().rev() {
            let mut parent = SnapshotTree::new();
            parent.add_tree(dir.clone(), tree);
            tree = parent;
        }

        let mut path = dirs.join("/");
        if !path.is_empty() {
            path.push('/');
        }
        path.push_str(&name);
        prop_assert_eq!(tree.read_blob(&path), Some(&contents[..]));
    }
}
