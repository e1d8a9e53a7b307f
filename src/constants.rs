//! Format constants shared across the engine.

/// Leading bytes of the version line at offset 0.
pub const ASDF_MAGIC: &[u8] = b"#ASDF ";

/// On-disk magic preceding every binary block header.
pub const BLOCK_MAGIC: [u8; 4] = [0xd3, 0x42, 0x4c, 0x4b]; // "\xd3BLK"

/// First four bytes of a YAML region (the start of a `%YAML` directive).
pub const YAML_TOKEN: &[u8; 4] = b"%YAM";

/// Smallest block header size a reader will accept.
pub const BLOCK_HEADER_MIN_SIZE: u16 = 40;

/// Byte size of the mandatory header fields (flags through checksum).
pub const BLOCK_HEADER_SIZE: u16 = 48;

/// Bytes from the block magic to the first payload byte:
/// magic (4) + header length (2) + header fields.
pub const BLOCK_OVERHEAD: u64 = 4 + 2 + BLOCK_HEADER_SIZE as u64;

/// Width of a block checksum.  All zeros means "absent".
pub const CHECKSUM_SIZE: usize = 16;

pub const NO_CHECKSUM: [u8; CHECKSUM_SIZE] = [0u8; CHECKSUM_SIZE];

/// Decimal digits reserved per block reference when sizing a header
/// rewrite before final indices are known (allows 10^5 - 1 blocks).
pub const MAX_BLOCKS_DIGITS: usize = 5;

/// Tag prefix declared by the `%TAG !` directive in every YAML region.
pub const TAG_PREFIX: &str = "tag:stsci.edu:asdf/0.1.0/";

/// Short tag of the top-level document node.
pub const ASDF_TAG: &str = "core/asdf";

/// Short tag of an n-dimensional array node.
pub const NDARRAY_TAG: &str = "core/ndarray";

/// URL prefix the built-in extension maps [`TAG_PREFIX`] onto.
pub const SCHEMA_URL_PREFIX: &str = "http://stsci.edu/schemas/asdf/0.1.0/";
