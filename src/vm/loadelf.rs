//! Executable page loader
//!
//! Reads the part of one page that comes from the executable image. Header
//! parsing happens elsewhere; by the time a fault gets here the segment
//! already knows its file offset and size.

use crate::config::PAGE_SIZE;
use crate::kern::error::{VmError, VmResult};
use crate::machine::device::BlockDevice;
use crate::vm::segment::LoadChunk;

/// Fill `page` from `image` as described by `chunk`
///
/// `page` must come in zeroed: bytes past the end of the image are left as
/// they are, so a short read yields a zero-filled tail. Returns the number
/// of bytes actually read.
pub fn load_page_from_elf(
    image: &dyn BlockDevice,
    page: &mut [u8; PAGE_SIZE],
    chunk: LoadChunk,
) -> VmResult<usize> {
    let end = (chunk.dest_offset + chunk.size).min(PAGE_SIZE);
    if chunk.dest_offset >= end {
        return Ok(0);
    }
    let done = image
        .read_at(chunk.file_offset, &mut page[chunk.dest_offset..end])
        .map_err(|_| VmError::ImageRead {
            offset: chunk.file_offset,
        })?;
    crate::vm_trace!(
        "loadelf: {} of {} bytes from offset {}",
        done,
        chunk.size,
        chunk.file_offset
    );
    Ok(done)
}
