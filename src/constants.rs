//! Global constants for ShardFS
//!
//! This module centralizes limits shared by clients and servers.

/// Maximum length of a single directory entry name
pub const MAX_NAME_LENGTH: usize = 255;

/// Maximum path length for path-level operations (4KB)
pub const MAX_PATH_LENGTH: usize = 4096;

/// Maximum inline file size (1MB)
///
/// File contents live with the entry, so writes beyond this offset are rejected.
pub const MAX_INLINE_DATA: u64 = 1 << 20;

/// Maximum TCP frame size (256MB)
///
/// Split transport units are the largest frames on the wire.
pub const MAX_FRAME_SIZE: usize = 256 << 20;

/// How many inserts past the split threshold before a partition re-queues itself
///
/// A partition whose split keeps failing would otherwise re-queue on every insert.
pub const SPLIT_RETRIGGER_STRIDE: u64 = 64;

/// Check an entry name for use inside a directory
#[inline]
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LENGTH
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\0')
}

/// Whether an insert that brought a partition to `size` should queue a split
#[inline]
pub fn should_trigger_split(size: u64, threshold: u64) -> bool {
    size >= threshold && (size - threshold) % SPLIT_RETRIGGER_STRIDE == 0
}
