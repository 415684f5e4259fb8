// Layout conformance tests for the wire control records.
// Both peers exchange these as raw bytes, so sizes and offsets must not drift.
use dmxp_deepcopy::Deep::Manifest::{default_align, TransportDescriptor};
use dmxp_deepcopy::Deep::Structs::{
    LengthHeader, ManifestPreamble, HEADER_LEN, PREAMBLE_LEN, PREAMBLE_MAGIC,
};
use memoffset::offset_of;
use std::mem::{align_of, size_of};

#[test]
fn test_length_header_layout() {
    let size = size_of::<LengthHeader>();
    let off_ordinal = offset_of!(LengthHeader, ordinal);
    let off_count = offset_of!(LengthHeader, count);
    let off_element_size = offset_of!(LengthHeader, element_size);

    println!(
        "LengthHeader => size: {size}, align: {}, offsets: [ordinal:{off_ordinal}, count:{off_count}, element_size:{off_element_size}]",
        align_of::<LengthHeader>()
    );

    assert_eq!(size, 24);
    assert_eq!(HEADER_LEN, size);
    assert_eq!(align_of::<LengthHeader>(), align_of::<u64>());
    assert_eq!(off_ordinal, 0);
    assert_eq!(off_count, 8);
    assert_eq!(off_element_size, 16);
}

#[test]
fn test_manifest_preamble_layout() {
    let size = size_of::<ManifestPreamble>();
    let off_magic = offset_of!(ManifestPreamble, magic);
    let off_roots = offset_of!(ManifestPreamble, roots);
    let off_descriptors = offset_of!(ManifestPreamble, descriptors);
    let off_fingerprint = offset_of!(ManifestPreamble, fingerprint);

    println!(
        "ManifestPreamble => size: {size}, offsets: [magic:{off_magic}, roots:{off_roots}, descriptors:{off_descriptors}, fingerprint:{off_fingerprint}]"
    );

    // No padding: u64 + u32 + u32 + u64.
    assert_eq!(size, 24);
    assert_eq!(PREAMBLE_LEN, size);
    assert_eq!(off_magic, 0);
    assert_eq!(off_roots, 8);
    assert_eq!(off_descriptors, 12);
    assert_eq!(off_fingerprint, 16);
    assert_eq!(&PREAMBLE_MAGIC.to_be_bytes(), b"DMXP_DPC");
}

#[test]
fn test_header_bytes_are_native_layout() {
    let header = LengthHeader {
        ordinal: 3,
        count: 7,
        element_size: 16,
    };
    let bytes = header.to_bytes();
    assert_eq!(&bytes[0..8], &3u64.to_ne_bytes());
    assert_eq!(&bytes[8..16], &7u64.to_ne_bytes());
    assert_eq!(&bytes[16..24], &16u64.to_ne_bytes());
    assert_eq!(LengthHeader::from_bytes(&bytes), header);
}

#[test]
fn test_default_alignment() {
    assert_eq!(default_align(0), 1);
    assert_eq!(default_align(1), 1);
    assert_eq!(default_align(4), 4);
    assert_eq!(default_align(12), 4);
    assert_eq!(default_align(24), 8);
    assert_eq!(default_align(64), 16);

    // Typed constructors take the real alignment and record the target, not the pointer.
    let desc = TransportDescriptor::indirection_of::<[u8; 3]>(0, 5);
    assert_eq!(desc.element_size, 3);
    assert_eq!(desc.element_align, 1);
    assert_eq!(desc.count, 5);
}
