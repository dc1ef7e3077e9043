use anyhow::Result;
use tracing::debug;

use crate::memory::{read_bytes, write_code};

/// Overwrite `bytes.len()` bytes at `address` and return what was there before. There is no
/// undo, keep the returned bytes if the patch needs reverting.
///
/// # Safety
/// Same requirements as [`write_code`].
pub unsafe fn patch_bytes(address: usize, bytes: &[u8]) -> Result<Vec<u8>> {
    let original = read_bytes(address, bytes.len());
    write_code(address, bytes)?;
    debug!("patched {address:#x}: {original:02x?} -> {bytes:02x?}");
    Ok(original)
}
